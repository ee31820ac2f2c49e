//! Trash and restore, plus the changes-feed filter for desktop clients
//! that opted some directories out of synchronization.

use chrono::Utc;
use serde_json::Value;

use crate::couch::{self, ChangesResponse};

use super::{
	directory::DirDoc, file::FileDoc, join_path, parent_path, Indexer, Vfs, VfsError,
	ROOT_DIR_ID, TRASH_DIR_ID, TRASH_DIR_NAME,
};

/// Finds a name free among the children of `dir_id`, suffixing with
/// ` (2)`, ` (3)`… when taken. Trashed children count too.
pub async fn conflict_free_name(
	index: &dyn Indexer,
	dir_id: &str,
	name: &str,
) -> Result<String, VfsError> {
	let children = index.dir_children(dir_id).await?;
	let taken: Vec<&str> = children.iter().map(|c| c.name()).collect();
	if !taken.contains(&name) {
		return Ok(name.to_owned());
	}
	for i in 2..1000 {
		let candidate = format!("{name} ({i})");
		if !taken.contains(&candidate.as_str()) {
			return Ok(candidate);
		}
	}
	Err(VfsError::Exists(name.to_owned()))
}

/// Strips a ` (N)` suffix previously added to resolve a name conflict.
pub fn strip_conflict_suffix(name: &str) -> &str {
	let Some(open) = name.rfind(" (") else {
		return name;
	};
	let suffix = &name[open + 2..];
	match suffix.strip_suffix(')') {
		Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
			&name[..open]
		}
		_ => name,
	}
}

/// Moves a file under `/Trash`, recording where to restore it.
pub async fn trash_file(fs: &dyn Vfs, olddoc: &FileDoc) -> Result<FileDoc, VfsError> {
	if olddoc.trashed {
		return Err(VfsError::FileInTrash);
	}
	let restore_path = parent_path(&fs.file_path(olddoc).await?).to_owned();
	let name = conflict_free_name(fs.indexer().as_ref(), TRASH_DIR_ID, &olddoc.name).await?;
	let mut newdoc = olddoc.clone();
	newdoc.dir_id = TRASH_DIR_ID.to_owned();
	newdoc.restore_path = restore_path;
	newdoc.name = name;
	newdoc.trashed = true;
	newdoc.updated_at = Utc::now();
	fs.update_file_doc(olddoc, &mut newdoc).await?;
	Ok(newdoc)
}

/// Moves a directory under `/Trash`, recording where to restore it.
pub async fn trash_dir(fs: &dyn Vfs, olddoc: &DirDoc) -> Result<DirDoc, VfsError> {
	if olddoc.is_trashed() {
		return Err(VfsError::FileInTrash);
	}
	let restore_path = parent_path(&olddoc.fullpath).to_owned();
	let name = conflict_free_name(fs.indexer().as_ref(), TRASH_DIR_ID, &olddoc.name).await?;
	let mut newdoc = olddoc.clone();
	newdoc.dir_id = TRASH_DIR_ID.to_owned();
	newdoc.restore_path = restore_path;
	newdoc.name = name.clone();
	newdoc.fullpath = join_path(TRASH_DIR_NAME, &name);
	newdoc.updated_at = Utc::now();
	fs.update_dir_doc(olddoc, &mut newdoc).await?;
	Ok(newdoc)
}

/// Finds the directory a trashed node restores into, recreating missing
/// ancestors.
async fn get_restore_dir(fs: &dyn Vfs, restore_path: &str) -> Result<DirDoc, VfsError> {
	let path = if restore_path.is_empty() || restore_path == "/" {
		return fs.dir_by_id(ROOT_DIR_ID).await;
	} else {
		restore_path
	};
	match fs.dir_by_path(path).await {
		Ok(dir) => Ok(dir),
		Err(e) if e.is_not_found() => mkdir_all(fs, path).await,
		Err(e) => Err(e),
	}
}

/// Creates every missing directory along a path, returning the deepest one.
pub async fn mkdir_all(fs: &dyn Vfs, path: &str) -> Result<DirDoc, VfsError> {
	let mut current = fs.dir_by_id(ROOT_DIR_ID).await?;
	for segment in path.split('/').filter(|s| !s.is_empty()) {
		let child_path = join_path(&current.fullpath, segment);
		current = match fs.dir_by_path(&child_path).await {
			Ok(dir) => dir,
			Err(e) if e.is_not_found() => {
				let mut dir = DirDoc::new_with_parent(segment, &current)?;
				fs.create_dir(&mut dir).await?;
				dir
			}
			Err(e) => return Err(e),
		};
	}
	Ok(current)
}

/// Restores a trashed file to its recorded restore path.
pub async fn restore_file(fs: &dyn Vfs, olddoc: &FileDoc) -> Result<FileDoc, VfsError> {
	if !olddoc.trashed {
		return Err(VfsError::NotFound(olddoc.doc_id.clone()));
	}
	let restore_dir = get_restore_dir(fs, &olddoc.restore_path).await?;
	let name = strip_conflict_suffix(&olddoc.name);
	let name = conflict_free_name(fs.indexer().as_ref(), &restore_dir.doc_id, name).await?;
	let mut newdoc = olddoc.clone();
	newdoc.dir_id = restore_dir.doc_id;
	newdoc.restore_path = String::new();
	newdoc.name = name;
	newdoc.trashed = false;
	newdoc.updated_at = Utc::now();
	fs.update_file_doc(olddoc, &mut newdoc).await?;
	Ok(newdoc)
}

/// Restores a trashed directory to its recorded restore path.
pub async fn restore_dir(fs: &dyn Vfs, olddoc: &DirDoc) -> Result<DirDoc, VfsError> {
	let restore_dir = get_restore_dir(fs, &olddoc.restore_path).await?;
	let name = strip_conflict_suffix(&olddoc.name);
	let name = conflict_free_name(fs.indexer().as_ref(), &restore_dir.doc_id, name).await?;
	let mut newdoc = olddoc.clone();
	newdoc.dir_id = restore_dir.doc_id.clone();
	newdoc.restore_path = String::new();
	newdoc.name = name.clone();
	newdoc.fullpath = join_path(&restore_dir.fullpath, &name);
	newdoc.updated_at = Utc::now();
	fs.update_dir_doc(olddoc, &mut newdoc).await?;
	Ok(newdoc)
}

/// Replaces, in a changes feed addressed to one client, the entries lying
/// inside directories this client opted out of with deletion tombstones.
pub async fn filter_not_synchronized_docs(
	fs: &dyn Vfs,
	client_id: &str,
	changes: &mut ChangesResponse,
) -> Result<(), VfsError> {
	if changes.results.is_empty() {
		return Ok(());
	}
	let index = fs.indexer();
	let dirs = index.list_not_synchronized_on(client_id).await?;
	if dirs.is_empty() {
		return Ok(());
	}
	let by_id: Vec<&str> = dirs.iter().map(|d| d.doc_id.as_str()).collect();
	let by_path: Vec<&str> = dirs.iter().map(|d| d.fullpath.as_str()).collect();

	for change in &mut changes.results {
		let Some(doc) = &change.doc else { continue };
		if is_not_synchronized(index.as_ref(), &by_id, &by_path, doc).await {
			let rev = change.changes.first().cloned().unwrap_or_default();
			change.doc = Some(couch::tombstone(&change.id, &rev));
			change.deleted = true;
		}
	}
	Ok(())
}

async fn is_not_synchronized(
	index: &dyn Indexer,
	by_id: &[&str],
	by_path: &[&str],
	doc: &Value,
) -> bool {
	let id = couch::doc_id(doc);
	if by_id.contains(&id) {
		return true;
	}
	let mut path = match doc.get("type").and_then(Value::as_str) {
		Some("directory") => doc
			.get("path")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_owned(),
		Some("file") => {
			let file = FileDoc {
				doc_id: id.to_owned(),
				dir_id: doc
					.get("dir_id")
					.and_then(Value::as_str)
					.unwrap_or_default()
					.to_owned(),
				name: doc
					.get("name")
					.and_then(Value::as_str)
					.unwrap_or_default()
					.to_owned(),
				..empty_file_doc()
			};
			match index.file_path(&file).await {
				Ok(path) => path,
				Err(_) => return false,
			}
		}
		_ => return false,
	};
	loop {
		if by_path.contains(&path.as_str()) {
			return true;
		}
		if path.is_empty() || path == "/" {
			return false;
		}
		path = parent_path(&path).to_owned();
	}
}

fn empty_file_doc() -> FileDoc {
	FileDoc::new("x", ROOT_DIR_ID, 0, String::new(), String::new(), String::new(), false)
		.expect("constant name is valid")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn conflict_suffix_stripping() {
		assert_eq!(strip_conflict_suffix("report (2)"), "report");
		assert_eq!(strip_conflict_suffix("report (abc)"), "report (abc)");
		assert_eq!(strip_conflict_suffix("report"), "report");
		assert_eq!(strip_conflict_suffix("report ()"), "report ()");
	}
}
