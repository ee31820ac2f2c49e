//! Directory documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::couch::{impl_doc, FILES};

use super::{
	check_depth, check_name, join_path, parent_path, CozyMetadata, DocRef, VfsError, Vfs,
	ROOT_DIR_ID, TRASH_DIR_NAME,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirDoc {
	#[serde(rename = "type", default = "dir_type")]
	pub kind: String,
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	pub doc_id: String,
	#[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
	pub doc_rev: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub dir_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub restore_path: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	/// Denormalized full path of the directory.
	#[serde(rename = "path")]
	pub fullpath: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub referenced_by: Vec<DocRef>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub not_synchronized_on: Vec<DocRef>,
	#[serde(rename = "cozyMetadata", default, skip_serializing_if = "Option::is_none")]
	pub cozy_metadata: Option<CozyMetadata>,
}

fn dir_type() -> String {
	"directory".to_owned()
}

impl_doc!(DirDoc, FILES);

impl DirDoc {
	/// Builds a directory document from its name, parent id and parent
	/// path. The name is validated.
	pub fn new_with_path(name: &str, dir_id: &str, dir_path: &str) -> Result<Self, VfsError> {
		check_name(name)?;
		let dir_path = if dir_path.is_empty() { "/" } else { dir_path };
		let fullpath = join_path(dir_path, name);
		check_depth(&fullpath)?;
		let now = Utc::now();
		Ok(Self {
			kind: dir_type(),
			doc_id: String::new(),
			doc_rev: String::new(),
			name: name.to_owned(),
			dir_id: if dir_id.is_empty() {
				ROOT_DIR_ID.to_owned()
			} else {
				dir_id.to_owned()
			},
			restore_path: String::new(),
			created_at: now,
			updated_at: now,
			tags: Vec::new(),
			fullpath,
			referenced_by: Vec::new(),
			not_synchronized_on: Vec::new(),
			cozy_metadata: None,
		})
	}

	/// Builds a directory document as a child of the given parent.
	pub fn new_with_parent(name: &str, parent: &DirDoc) -> Result<Self, VfsError> {
		Self::new_with_path(name, &parent.doc_id, &parent.fullpath)
	}

	pub fn is_trashed(&self) -> bool {
		self.fullpath == TRASH_DIR_NAME || self.fullpath.starts_with(&format!("{TRASH_DIR_NAME}/"))
	}

	pub fn add_referenced_by(&mut self, refs: &[DocRef]) {
		for r in refs {
			if !self.referenced_by.contains(r) {
				self.referenced_by.push(r.clone());
			}
		}
	}

	pub fn remove_referenced_by(&mut self, refs: &[DocRef]) {
		self.referenced_by.retain(|r| !refs.contains(r));
	}

	pub fn add_not_synchronized_on(&mut self, refs: &[DocRef]) {
		for r in refs {
			if !self.not_synchronized_on.contains(r) {
				self.not_synchronized_on.push(r.clone());
			}
		}
	}

	pub fn remove_not_synchronized_on(&mut self, refs: &[DocRef]) {
		self.not_synchronized_on.retain(|r| !refs.contains(r));
	}
}

/// A partial update of a directory or file document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocPatch {
	pub name: Option<String>,
	pub dir_id: Option<String>,
	pub restore_path: Option<String>,
	pub tags: Option<Vec<String>>,
	pub updated_at: Option<DateTime<Utc>>,
}

/// Renames, moves or retags a directory.
pub async fn modify_dir_metadata(
	fs: &dyn Vfs,
	olddoc: &DirDoc,
	patch: DocPatch,
) -> Result<DirDoc, VfsError> {
	if olddoc.doc_id == ROOT_DIR_ID || olddoc.doc_id == super::TRASH_DIR_ID {
		return Err(VfsError::ForbiddenDocMove);
	}

	let name = patch.name.unwrap_or_else(|| olddoc.name.clone());
	let dir_id = patch.dir_id.unwrap_or_else(|| olddoc.dir_id.clone());

	let mut newdoc = if dir_id != olddoc.dir_id {
		if olddoc.is_trashed() {
			return Err(VfsError::FileInTrash);
		}
		let parent = fs.dir_by_id(&dir_id).await?;
		DirDoc::new_with_parent(&name, &parent)?
	} else {
		DirDoc::new_with_path(&name, &olddoc.dir_id, parent_path(&olddoc.fullpath))?
	};

	newdoc.doc_id = olddoc.doc_id.clone();
	newdoc.doc_rev = olddoc.doc_rev.clone();
	newdoc.restore_path = patch.restore_path.unwrap_or_else(|| olddoc.restore_path.clone());
	newdoc.created_at = olddoc.created_at;
	newdoc.updated_at = patch.updated_at.unwrap_or_else(Utc::now);
	newdoc.tags = patch.tags.unwrap_or_else(|| olddoc.tags.clone());
	newdoc.referenced_by = olddoc.referenced_by.clone();
	newdoc.not_synchronized_on = olddoc.not_synchronized_on.clone();
	newdoc.cozy_metadata = olddoc.cozy_metadata.clone();

	fs.update_dir_doc(olddoc, &mut newdoc).await?;
	Ok(newdoc)
}
