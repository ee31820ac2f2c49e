//! Content-addressed VFS back-end over an object store.
//!
//! Contents live in one container per instance; renames and moves are
//! metadata-only, a file's bytes are only touched when its content
//! changes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::{env::Env, lock};

use super::{
	file::MetaExtractor,
	indexer::Indexer,
	join_path, parent_path,
	store::{container_name, object_name, object_prefix, ObjectStore},
	versions::{self, Version},
	DirDoc, DirOrFile, DiskThreshold, FileDoc, FileHandle, FileReader, Vfs, VfsError,
};

pub struct ObjectVfs {
	domain: String,
	container: String,
	index: Arc<dyn Indexer>,
	store: Arc<dyn ObjectStore>,
	env: Arc<Env>,
	threshold: DiskThreshold,
}

impl ObjectVfs {
	pub fn new(
		domain: impl Into<String>,
		prefix: &str,
		index: Arc<dyn Indexer>,
		store: Arc<dyn ObjectStore>,
		env: Arc<Env>,
		threshold: DiskThreshold,
	) -> Arc<Self> {
		Arc::new(Self {
			domain: domain.into(),
			container: container_name(prefix),
			index,
			store,
			env,
			threshold,
		})
	}

	async fn check_parent(&self, dir_id: &str) -> Result<DirDoc, VfsError> {
		match self.index.dir_by_id(dir_id).await {
			Ok(parent) => Ok(parent),
			Err(e) if e.is_not_found() => Err(VfsError::ParentDoesNotExist),
			Err(e) => Err(e),
		}
	}

	/// Alerts the notification center when the instance is close to its
	/// disk quota.
	async fn check_capacity(&self) {
		if self.threshold.quota == 0 {
			return;
		}
		match self.index.disk_usage().await {
			Ok(usage) if usage > self.threshold.capacity() => {
				self.env.notifier.disk_quota_close(&self.domain);
			}
			Ok(_) => {}
			Err(e) => warn!(target: "vfs", domain = %self.domain, "cannot compute disk usage: {e}"),
		}
	}

	async fn destroy_file_inner(&self, file: &FileDoc) -> Result<(), VfsError> {
		for version in self.index.versions_of(&file.doc_id).await? {
			self.index.delete_version(&version).await?;
		}
		self.store
			.delete_prefix(&self.container, &format!("{}/", object_prefix(&file.doc_id)))
			.await?;
		self.index.delete_file_doc(file).await?;
		Ok(())
	}

	fn destroy_dir_content_inner<'a>(
		&'a self,
		dir: &'a DirDoc,
	) -> BoxFuture<'a, Result<(), VfsError>> {
		Box::pin(async move {
			for child in self.index.dir_children(&dir.doc_id).await? {
				match child {
					DirOrFile::File(file) => self.destroy_file_inner(&file).await?,
					DirOrFile::Dir(subdir) => {
						self.destroy_dir_content_inner(&subdir).await?;
						self.index.delete_dir_doc(&subdir).await?;
					}
				}
			}
			Ok(())
		})
	}

	async fn clean_old_versions_inner(&self, file_id: &str) -> Result<(), VfsError> {
		let all = self.index.versions_of(file_id).await?;
		for version in versions::to_clean(&all, &self.env.config.versions, Utc::now()) {
			debug!(target: "vfs", id = %version.doc_id, "dropping old version");
			self.store
				.delete(
					&self.container,
					&object_name(version.file_id(), version.internal_id()),
				)
				.await?;
			self.index.delete_version(&version).await?;
		}
		Ok(())
	}

	async fn check_disk_space(&self, size: u64) -> Result<(u64, u64, u64), VfsError> {
		let usage = self.index.disk_usage().await?;
		let new_size = usage + size;
		if self.threshold.max_file_size > 0 && size > self.threshold.max_file_size {
			return Err(VfsError::FileTooBig);
		}
		if self.threshold.quota > 0 && new_size > self.threshold.quota {
			return Err(VfsError::FileTooBig);
		}
		Ok((new_size, self.threshold.quota, self.threshold.capacity()))
	}
}

#[async_trait]
impl Vfs for ObjectVfs {
	fn domain(&self) -> &str {
		&self.domain
	}

	fn indexer(&self) -> Arc<dyn Indexer> {
		self.index.clone()
	}

	fn with_indexer(&self, indexer: Arc<dyn Indexer>) -> Arc<dyn Vfs> {
		Arc::new(Self {
			domain: self.domain.clone(),
			container: self.container.clone(),
			index: indexer,
			store: self.store.clone(),
			env: self.env.clone(),
			threshold: self.threshold,
		})
	}

	async fn init(&self) -> Result<(), VfsError> {
		self.index.init().await
	}

	async fn dir_by_id(&self, id: &str) -> Result<DirDoc, VfsError> {
		let _guard = self.env.locks.read(&self.domain, lock::VFS).await;
		self.index.dir_by_id(id).await
	}

	async fn dir_by_path(&self, path: &str) -> Result<DirDoc, VfsError> {
		let _guard = self.env.locks.read(&self.domain, lock::VFS).await;
		self.index.dir_by_path(path).await
	}

	async fn file_by_id(&self, id: &str) -> Result<FileDoc, VfsError> {
		let _guard = self.env.locks.read(&self.domain, lock::VFS).await;
		self.index.file_by_id(id).await
	}

	async fn file_by_path(&self, path: &str) -> Result<FileDoc, VfsError> {
		let _guard = self.env.locks.read(&self.domain, lock::VFS).await;
		let parent = self.index.dir_by_path(parent_path(path)).await?;
		let name = path.rsplit('/').next().unwrap_or_default();
		match self.index.dir_child_by_name(&parent.doc_id, name).await? {
			DirOrFile::File(file) => Ok(file),
			DirOrFile::Dir(_) => Err(VfsError::NotFound(path.to_owned())),
		}
	}

	async fn dir_or_file_by_id(&self, id: &str) -> Result<DirOrFile, VfsError> {
		let _guard = self.env.locks.read(&self.domain, lock::VFS).await;
		self.index.dir_or_file_by_id(id).await
	}

	async fn file_path(&self, file: &FileDoc) -> Result<String, VfsError> {
		self.index.file_path(file).await
	}

	async fn dir_children(&self, dir: &DirDoc) -> Result<Vec<DirOrFile>, VfsError> {
		let _guard = self.env.locks.read(&self.domain, lock::VFS).await;
		self.index.dir_children(&dir.doc_id).await
	}

	async fn open_file(&self, file: &FileDoc) -> Result<FileReader, VfsError> {
		self.store
			.get(&self.container, &object_name(&file.doc_id, &file.internal_id))
			.await
	}

	async fn open_file_version(&self, version: &Version) -> Result<FileReader, VfsError> {
		self.store
			.get(
				&self.container,
				&object_name(version.file_id(), version.internal_id()),
			)
			.await
	}

	async fn create_dir(&self, dir: &mut DirDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		let parent = self.check_parent(&dir.dir_id).await?;
		if parent.is_trashed() {
			return Err(VfsError::ParentInTrash);
		}
		dir.fullpath = join_path(&parent.fullpath, &dir.name);
		self.index.create_dir_doc(dir).await
	}

	async fn update_dir_doc(&self, old: &DirDoc, new: &mut DirDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		if new.fullpath.starts_with(&format!("{}/", old.fullpath)) {
			return Err(VfsError::ForbiddenDocMove);
		}
		if new.dir_id != old.dir_id {
			self.check_parent(&new.dir_id).await?;
		}
		self.index.update_dir_doc(old, new).await
	}

	async fn create_file(
		&self,
		mut new: FileDoc,
		old: Option<FileDoc>,
	) -> Result<Box<dyn FileHandle>, VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		if new.byte_size > 0 {
			self.check_disk_space(new.byte_size).await?;
		}
		let parent = self.check_parent(&new.dir_id).await?;
		if old.is_none() && parent.is_trashed() {
			return Err(VfsError::ParentInTrash);
		}
		if let Some(old) = &old {
			// A content update continues the old document's history.
			if new.doc_id.is_empty() {
				new.doc_id = old.doc_id.clone();
			}
			new.doc_rev = old.doc_rev.clone();
			new.created_at = old.created_at;
			if new.restore_path.is_empty() {
				new.restore_path = old.restore_path.clone();
			}
			if new.referenced_by.is_empty() {
				new.referenced_by = old.referenced_by.clone();
			}
		} else if new.doc_id.is_empty() {
			new.doc_id = cozy_utils::new_doc_id();
		}
		match self.index.dir_child_by_name(&new.dir_id, &new.name).await {
			Ok(child) if child.id() != new.doc_id => {
				return Err(VfsError::Exists(new.name.clone()))
			}
			Ok(_) => {}
			Err(e) if e.is_not_found() => {}
			Err(e) => return Err(e),
		}
		let remaining = if self.threshold.quota > 0 {
			let usage = self.index.disk_usage().await?;
			Some(self.threshold.quota.saturating_sub(usage))
		} else {
			None
		};
		Ok(Box::new(ObjectFileHandle {
			vfs: self.with_object_handle(),
			new,
			old,
			internal_id: cozy_utils::new_doc_id(),
			hasher: Md5::new(),
			extractor: MetaExtractor::new(),
			buf: Vec::new(),
			written: 0,
			remaining,
		}))
	}

	async fn update_file_doc(&self, old: &FileDoc, new: &mut FileDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		if new.dir_id != old.dir_id {
			let parent = self.check_parent(&new.dir_id).await?;
			if parent.is_trashed() && !new.trashed {
				return Err(VfsError::ParentInTrash);
			}
		}
		self.index.update_file_doc(old, new).await
	}

	async fn copy_file(&self, src: &FileDoc, new_name: &str) -> Result<FileDoc, VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		let mut copy = src.clone();
		copy.doc_id = cozy_utils::new_doc_id();
		copy.doc_rev = String::new();
		copy.internal_id = cozy_utils::new_doc_id();
		copy.name = new_name.to_owned();
		copy.created_at = Utc::now();
		copy.updated_at = copy.created_at;
		copy.referenced_by = Vec::new();
		self.store
			.copy(
				&self.container,
				&object_name(&src.doc_id, &src.internal_id),
				&object_name(&copy.doc_id, &copy.internal_id),
			)
			.await?;
		if let Err(e) = self.index.create_file_doc(&mut copy).await {
			let _ = self
				.store
				.delete(&self.container, &object_name(&copy.doc_id, &copy.internal_id))
				.await;
			return Err(e);
		}
		Ok(copy)
	}

	async fn dissociate_file(&self, old: &FileDoc, new: &mut FileDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		if new.doc_id.is_empty() {
			new.doc_id = cozy_utils::new_doc_id();
		}
		new.doc_rev = String::new();
		new.internal_id = cozy_utils::new_doc_id();
		self.store
			.copy(
				&self.container,
				&object_name(&old.doc_id, &old.internal_id),
				&object_name(&new.doc_id, &new.internal_id),
			)
			.await?;
		self.destroy_file_inner(old).await?;
		self.index.create_file_doc(new).await
	}

	async fn dissociate_dir(&self, old: &DirDoc, new: &mut DirDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		if new.doc_id.is_empty() {
			new.doc_id = cozy_utils::new_doc_id();
		}
		new.doc_rev = String::new();
		let children = self.index.dir_children(&old.doc_id).await?;
		self.index.delete_dir_doc(old).await?;
		self.index.create_dir_doc(new).await?;
		for child in children {
			match child {
				DirOrFile::File(file) => {
					let mut moved = file.clone();
					moved.dir_id = new.doc_id.clone();
					self.index.update_file_doc(&file, &mut moved).await?;
				}
				DirOrFile::Dir(dir) => {
					let mut moved = dir.clone();
					moved.dir_id = new.doc_id.clone();
					self.index.update_dir_doc(&dir, &mut moved).await?;
				}
			}
		}
		Ok(())
	}

	async fn destroy_file(&self, file: &FileDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		self.destroy_file_inner(file).await?;
		self.check_capacity().await;
		Ok(())
	}

	async fn destroy_dir_content(&self, dir: &DirDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		self.destroy_dir_content_inner(dir).await?;
		self.check_capacity().await;
		Ok(())
	}

	async fn destroy_dir_and_content(&self, dir: &DirDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		self.destroy_dir_content_inner(dir).await?;
		self.index.delete_dir_doc(dir).await?;
		self.check_capacity().await;
		Ok(())
	}

	async fn revert_file_version(
		&self,
		file: &FileDoc,
		version: &Version,
	) -> Result<FileDoc, VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		let mut snapshot = Version::from_file(file, &file.internal_id);
		self.index.create_version(&mut snapshot).await?;

		let mut newdoc = file.clone();
		newdoc.internal_id = version.internal_id().to_owned();
		newdoc.md5sum = version.md5sum.clone();
		newdoc.byte_size = version.byte_size;
		newdoc.mime = version.mime.clone();
		newdoc.class = version.class.clone();
		newdoc.updated_at = Utc::now();
		self.index.update_file_doc(file, &mut newdoc).await?;
		self.index.delete_version(version).await?;
		Ok(newdoc)
	}

	async fn import_file_version(
		&self,
		mut version: Version,
		content: Vec<u8>,
	) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		self.store
			.put(
				&self.container,
				&object_name(version.file_id(), version.internal_id()),
				Bytes::from(content),
			)
			.await?;
		self.index.create_version(&mut version).await
	}

	async fn clean_old_versions(&self, file_id: &str) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		self.clean_old_versions_inner(file_id).await
	}

	async fn disk_usage(&self) -> Result<u64, VfsError> {
		self.index.disk_usage().await
	}

	async fn check_available_disk_space(&self, size: u64) -> Result<(u64, u64, u64), VfsError> {
		self.check_disk_space(size).await
	}
}

impl ObjectVfs {
	fn with_object_handle(&self) -> Arc<ObjectVfs> {
		Arc::new(Self {
			domain: self.domain.clone(),
			container: self.container.clone(),
			index: self.index.clone(),
			store: self.store.clone(),
			env: self.env.clone(),
			threshold: self.threshold,
		})
	}
}

struct ObjectFileHandle {
	vfs: Arc<ObjectVfs>,
	new: FileDoc,
	old: Option<FileDoc>,
	internal_id: String,
	hasher: Md5,
	extractor: MetaExtractor,
	buf: Vec<u8>,
	written: u64,
	remaining: Option<u64>,
}

#[async_trait]
impl FileHandle for ObjectFileHandle {
	async fn write(&mut self, chunk: &[u8]) -> Result<(), VfsError> {
		self.written += chunk.len() as u64;
		if self.new.byte_size > 0 && self.written > self.new.byte_size {
			return Err(VfsError::ContentLengthMismatch {
				expected: self.new.byte_size,
				written: self.written,
			});
		}
		let max = self.vfs.threshold.max_file_size;
		if max > 0 && self.written > max {
			return Err(VfsError::FileTooBig);
		}
		if let Some(remaining) = self.remaining {
			if self.written > remaining {
				return Err(VfsError::FileTooBig);
			}
		}
		self.hasher.update(chunk);
		self.extractor.write(chunk);
		self.buf.extend_from_slice(chunk);
		Ok(())
	}

	async fn close(self: Box<Self>) -> Result<FileDoc, VfsError> {
		let Self {
			vfs,
			mut new,
			old,
			internal_id,
			hasher,
			extractor,
			buf,
			written,
			..
		} = *self;

		let md5 = hex::encode(hasher.finalize());
		if !new.md5sum.is_empty() && new.md5sum != md5 {
			return Err(VfsError::InvalidHash);
		}
		if new.byte_size > 0 && new.byte_size != written {
			return Err(VfsError::ContentLengthMismatch {
				expected: new.byte_size,
				written,
			});
		}
		new.md5sum = md5;
		new.byte_size = written;
		new.internal_id = internal_id;
		extractor.apply(&mut new);

		let object = object_name(&new.doc_id, &new.internal_id);
		vfs.store
			.put(&vfs.container, &object, Bytes::from(buf))
			.await?;

		let _guard = vfs.env.locks.write(&vfs.domain, lock::VFS).await;
		let commit = async {
			let exclude = old.as_ref().map(|o| o.doc_id.as_str()).unwrap_or(&new.doc_id);
			match vfs.index.dir_child_by_name(&new.dir_id, &new.name).await {
				Ok(child) if child.id() != exclude => {
					return Err(VfsError::Exists(new.name.clone()))
				}
				Ok(_) => {}
				Err(e) if e.is_not_found() => {}
				Err(e) => return Err(e),
			}
			match &old {
				Some(old) => {
					if !old.internal_id.is_empty() && old.md5sum != new.md5sum {
						let mut version = Version::from_file(old, &old.internal_id);
						vfs.index.create_version(&mut version).await?;
					}
					vfs.index.update_file_doc(old, &mut new).await?;
					vfs.clean_old_versions_inner(&new.doc_id).await?;
				}
				None => vfs.index.create_file_doc(&mut new).await?,
			}
			Ok(())
		};
		if let Err(e) = commit.await {
			let _ = vfs.store.delete(&vfs.container, &object).await;
			return Err(e);
		}
		vfs.check_capacity().await;
		Ok(new)
	}

	async fn abort(self: Box<Self>) -> Result<(), VfsError> {
		// Nothing was persisted before close.
		Ok(())
	}
}
