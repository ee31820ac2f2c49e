//! The virtual file system: a path-indexed tree of directories and files
//! over a pluggable object store.
//!
//! Two back-ends share one contract: [`local::LocalVfs`] mirrors the
//! document tree on a real filesystem, [`object::ObjectVfs`] is
//! content-addressed over an [`store::ObjectStore`]. Both index their
//! documents through an [`indexer::Indexer`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

use cozy_utils::{FileIOError, NonUtf8PathError};

use crate::couch::CouchError;

pub mod directory;
pub mod file;
pub mod indexer;
pub mod local;
pub mod object;
pub mod store;
pub mod trash;
pub mod versions;

pub use directory::DirDoc;
pub use file::FileDoc;
pub use indexer::{Indexer, SharingIndexer};
pub use versions::Version;

/// Identifier of the root directory.
pub const ROOT_DIR_ID: &str = "io.cozy.files.root-dir";
/// Identifier of the trash directory.
pub const TRASH_DIR_ID: &str = "io.cozy.files.trash-dir";
/// Name of the trash directory.
pub const TRASH_NAME: &str = "Trash";
/// Full path of the trash directory.
pub const TRASH_DIR_NAME: &str = "/Trash";

/// Maximum depth of the directory tree.
const MAX_DEPTH: usize = 512;

#[derive(Debug, Error)]
pub enum VfsError {
	#[error("file or directory not found: {0}")]
	NotFound(String),
	#[error("a file or directory already exists at this path: {0}")]
	Exists(String),
	#[error("the parent directory does not exist")]
	ParentDoesNotExist,
	#[error("invalid file or directory name: {0:?}")]
	InvalidName(String),
	#[error("the directory tree is too deep")]
	TooDeep,
	#[error("the file or directory is already in the trash")]
	FileInTrash,
	#[error("the parent directory is in the trash")]
	ParentInTrash,
	#[error("a directory cannot be moved into one of its descendants")]
	ForbiddenDocMove,
	#[error("the given md5 hash does not match the content")]
	InvalidHash,
	#[error("content length mismatch: declared {expected}, written {written}")]
	ContentLengthMismatch { expected: u64, written: u64 },
	#[error("the file is too big and exceeds the disk quota")]
	FileTooBig,
	#[error("the disk quota is exceeded")]
	QuotaExceeded,
	#[error(transparent)]
	Couch(CouchError),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error(transparent)]
	NonUtf8Path(#[from] NonUtf8PathError),
	#[error("vfs internal error: {0}")]
	Internal(String),
}

impl From<CouchError> for VfsError {
	fn from(e: CouchError) -> Self {
		match e {
			CouchError::NotFound { doctype, id } | CouchError::Deleted { doctype, id } => {
				VfsError::NotFound(format!("{doctype}/{id}"))
			}
			other => VfsError::Couch(other),
		}
	}
}

impl VfsError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, VfsError::NotFound(_) | VfsError::ParentDoesNotExist)
	}

	pub fn is_exists(&self) -> bool {
		matches!(self, VfsError::Exists(_))
	}
}

/// A reference to another document, eg. the sharing a directory belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRef {
	#[serde(rename = "type")]
	pub doctype: String,
	pub id: String,
}

impl DocRef {
	pub fn new(doctype: impl Into<String>, id: impl Into<String>) -> Self {
		Self {
			doctype: doctype.into(),
			id: id.into(),
		}
	}
}

/// Creator and updater applications of a file or directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CozyMetadata {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub created_by_app: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub updated_by_apps: Vec<String>,
}

impl CozyMetadata {
	pub fn new(app: impl Into<String>) -> Self {
		Self {
			created_by_app: app.into(),
			updated_by_apps: Vec::new(),
		}
	}

	pub fn updated_by(&mut self, app: &str) {
		if !self.updated_by_apps.iter().any(|a| a == app) {
			self.updated_by_apps.push(app.to_owned());
		}
	}
}

/// A directory or a file.
#[derive(Debug, Clone)]
pub enum DirOrFile {
	Dir(DirDoc),
	File(FileDoc),
}

impl DirOrFile {
	pub fn from_value(value: serde_json::Value) -> Result<Self, VfsError> {
		match value.get("type").and_then(serde_json::Value::as_str) {
			Some("directory") => Ok(DirOrFile::Dir(
				serde_json::from_value(value).map_err(CouchError::Json)?,
			)),
			Some("file") => Ok(DirOrFile::File(
				serde_json::from_value(value).map_err(CouchError::Json)?,
			)),
			other => Err(VfsError::Internal(format!(
				"unexpected files document type: {other:?}"
			))),
		}
	}

	pub fn id(&self) -> &str {
		match self {
			DirOrFile::Dir(d) => &d.doc_id,
			DirOrFile::File(f) => &f.doc_id,
		}
	}

	pub fn name(&self) -> &str {
		match self {
			DirOrFile::Dir(d) => &d.name,
			DirOrFile::File(f) => &f.name,
		}
	}

	pub fn is_trashed(&self) -> bool {
		match self {
			DirOrFile::Dir(d) => d.fullpath.starts_with(TRASH_DIR_NAME),
			DirOrFile::File(f) => f.trashed,
		}
	}
}

/// Validates a file or directory name.
pub fn check_name(name: &str) -> Result<(), VfsError> {
	if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
		return Err(VfsError::InvalidName(name.to_owned()));
	}
	Ok(())
}

/// Validates the depth of a full path.
pub fn check_depth(fullpath: &str) -> Result<(), VfsError> {
	if fullpath.matches('/').count() > MAX_DEPTH {
		return Err(VfsError::TooDeep);
	}
	Ok(())
}

/// Joins a directory path and a child name.
pub fn join_path(dir_path: &str, name: &str) -> String {
	if dir_path == "/" {
		format!("/{name}")
	} else {
		format!("{dir_path}/{name}")
	}
}

/// The parent of a full path, `/` for top-level entries.
pub fn parent_path(fullpath: &str) -> &str {
	match fullpath.rfind('/') {
		Some(0) | None => "/",
		Some(idx) => &fullpath[..idx],
	}
}

/// The disk space situation of an instance, used to refuse writes beyond
/// the quota and to alert when getting close to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskThreshold {
	/// Hard quota in bytes, zero for unlimited.
	pub quota: u64,
	/// Per-file size limit in bytes, zero for unlimited.
	pub max_file_size: u64,
}

impl DiskThreshold {
	/// The usage above which the near-quota alert fires (90% of quota).
	pub fn capacity(&self) -> u64 {
		self.quota / 10 * 9
	}
}

/// A file being written through the create-file protocol. Bytes are
/// streamed in, hashed and measured; `close` verifies the declared hash
/// and size and commits the document under the exclusive VFS lock.
#[async_trait]
pub trait FileHandle: Send {
	async fn write(&mut self, chunk: &[u8]) -> Result<(), VfsError>;
	/// Verifies and commits; on error the temporary content is cleaned up
	/// and the index left untouched.
	async fn close(self: Box<Self>) -> Result<FileDoc, VfsError>;
	/// Gives up: cleans the temporary content without touching the index.
	async fn abort(self: Box<Self>) -> Result<(), VfsError>;
}

pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// The virtual file system contract shared by both back-ends.
///
/// Reads take the instance-wide VFS lock shared, mutations take it
/// exclusive. The lock is always released before calling external peers.
#[async_trait]
pub trait Vfs: Send + Sync {
	fn domain(&self) -> &str;
	fn indexer(&self) -> Arc<dyn Indexer>;
	/// Clones this VFS with another indexer, keeping the same content
	/// store. Used to decorate the write paths with a [`SharingIndexer`].
	fn with_indexer(&self, indexer: Arc<dyn Indexer>) -> Arc<dyn Vfs>;

	/// Creates the root and trash directories when missing.
	async fn init(&self) -> Result<(), VfsError>;

	async fn dir_by_id(&self, id: &str) -> Result<DirDoc, VfsError>;
	async fn dir_by_path(&self, path: &str) -> Result<DirDoc, VfsError>;
	async fn file_by_id(&self, id: &str) -> Result<FileDoc, VfsError>;
	async fn file_by_path(&self, path: &str) -> Result<FileDoc, VfsError>;
	async fn dir_or_file_by_id(&self, id: &str) -> Result<DirOrFile, VfsError>;
	async fn file_path(&self, file: &FileDoc) -> Result<String, VfsError>;
	async fn dir_children(&self, dir: &DirDoc) -> Result<Vec<DirOrFile>, VfsError>;
	async fn open_file(&self, file: &FileDoc) -> Result<FileReader, VfsError>;
	async fn open_file_version(&self, version: &Version) -> Result<FileReader, VfsError>;

	async fn create_dir(&self, dir: &mut DirDoc) -> Result<(), VfsError>;
	async fn update_dir_doc(&self, old: &DirDoc, new: &mut DirDoc) -> Result<(), VfsError>;
	async fn create_file(
		&self,
		new: FileDoc,
		old: Option<FileDoc>,
	) -> Result<Box<dyn FileHandle>, VfsError>;
	async fn update_file_doc(&self, old: &FileDoc, new: &mut FileDoc) -> Result<(), VfsError>;
	async fn copy_file(&self, src: &FileDoc, new_name: &str) -> Result<FileDoc, VfsError>;
	async fn dissociate_file(&self, old: &FileDoc, new: &mut FileDoc) -> Result<(), VfsError>;
	async fn dissociate_dir(&self, old: &DirDoc, new: &mut DirDoc) -> Result<(), VfsError>;
	async fn destroy_file(&self, file: &FileDoc) -> Result<(), VfsError>;
	async fn destroy_dir_content(&self, dir: &DirDoc) -> Result<(), VfsError>;
	async fn destroy_dir_and_content(&self, dir: &DirDoc) -> Result<(), VfsError>;

	async fn revert_file_version(
		&self,
		file: &FileDoc,
		version: &Version,
	) -> Result<FileDoc, VfsError>;
	/// Stores an old version brought from outside (eg. a desktop client
	/// that kept a copy).
	async fn import_file_version(&self, version: Version, content: Vec<u8>)
		-> Result<(), VfsError>;
	async fn clean_old_versions(&self, file_id: &str) -> Result<(), VfsError>;

	async fn disk_usage(&self) -> Result<u64, VfsError>;
	/// Returns `(new_size, quota, capacity)` for a write of `size` bytes,
	/// or `FileTooBig` when it would exceed the quota or per-file limit.
	async fn check_available_disk_space(&self, size: u64) -> Result<(u64, u64, u64), VfsError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn path_helpers() {
		assert_eq!(join_path("/", "Docs"), "/Docs");
		assert_eq!(join_path("/Docs", "hello.txt"), "/Docs/hello.txt");
		assert_eq!(parent_path("/Docs/hello.txt"), "/Docs");
		assert_eq!(parent_path("/Docs"), "/");
		assert_eq!(parent_path("/"), "/");
	}

	#[test]
	fn name_validation() {
		assert!(check_name("hello.txt").is_ok());
		assert!(check_name("").is_err());
		assert!(check_name(".").is_err());
		assert!(check_name("a/b").is_err());
	}
}
