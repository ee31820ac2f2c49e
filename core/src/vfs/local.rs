//! Path-indexed VFS back-end over a local filesystem mount.
//!
//! The directory tree mirrors the document tree by full path; versions
//! live under a `.versions` shard and temporary uploads under `.tmp`.

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use md5::{Digest, Md5};
use tokio::{
	fs,
	io::{AsyncWriteExt, BufReader},
};
use tracing::warn;

use cozy_utils::FileIOError;

use crate::{env::Env, lock};

use super::{
	file::MetaExtractor,
	indexer::Indexer,
	join_path, parent_path,
	versions::{self, Version},
	DirDoc, DirOrFile, DiskThreshold, FileDoc, FileHandle, FileReader, Vfs, VfsError,
};

const TMP_DIR: &str = ".tmp";
const VERSIONS_DIR: &str = ".versions";

pub struct LocalVfs {
	domain: String,
	root: PathBuf,
	index: Arc<dyn Indexer>,
	env: Arc<Env>,
	threshold: DiskThreshold,
}

impl LocalVfs {
	pub fn new(
		domain: impl Into<String>,
		root: PathBuf,
		index: Arc<dyn Indexer>,
		env: Arc<Env>,
		threshold: DiskThreshold,
	) -> Arc<Self> {
		Arc::new(Self {
			domain: domain.into(),
			root,
			index,
			env,
			threshold,
		})
	}

	fn fs_path(&self, fullpath: &str) -> PathBuf {
		self.root.join(fullpath.trim_start_matches('/'))
	}

	fn version_path(&self, version: &Version) -> PathBuf {
		let file_id = version.file_id();
		let (a, b) = file_id.split_at(4.min(file_id.len()));
		self.root
			.join(VERSIONS_DIR)
			.join(a)
			.join(b)
			.join(version.internal_id())
	}

	async fn file_fullpath(&self, file: &FileDoc) -> Result<String, VfsError> {
		let parent = self.index.dir_by_id(&file.dir_id).await?;
		Ok(join_path(&parent.fullpath, &file.name))
	}

	async fn check_parent(&self, dir_id: &str) -> Result<DirDoc, VfsError> {
		match self.index.dir_by_id(dir_id).await {
			Ok(parent) => Ok(parent),
			Err(e) if e.is_not_found() => Err(VfsError::ParentDoesNotExist),
			Err(e) => Err(e),
		}
	}

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

	async fn destroy_file_inner(&self, file: &FileDoc) -> Result<(), VfsError> {
		for version in self.index.versions_of(&file.doc_id).await? {
			let path = self.version_path(&version);
			if let Err(e) = fs::remove_file(&path).await {
				if e.kind() != std::io::ErrorKind::NotFound {
					return Err(FileIOError::from((path, e)).into());
				}
			}
			self.index.delete_version(&version).await?;
		}
		let fullpath = self.file_fullpath(file).await?;
		let path = self.fs_path(&fullpath);
		if let Err(e) = fs::remove_file(&path).await {
			if e.kind() != std::io::ErrorKind::NotFound {
				return Err(FileIOError::from((path, e)).into());
			}
		}
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
						let path = self.fs_path(&subdir.fullpath);
						if let Err(e) = fs::remove_dir_all(&path).await {
							if e.kind() != std::io::ErrorKind::NotFound {
								return Err(FileIOError::from((path, e)).into());
							}
						}
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
			let path = self.version_path(&version);
			if let Err(e) = fs::remove_file(&path).await {
				if e.kind() != std::io::ErrorKind::NotFound {
					return Err(FileIOError::from((path, e)).into());
				}
			}
			self.index.delete_version(&version).await?;
		}
		Ok(())
	}
}

#[async_trait]
impl Vfs for LocalVfs {
	fn domain(&self) -> &str {
		&self.domain
	}

	fn indexer(&self) -> Arc<dyn Indexer> {
		self.index.clone()
	}

	fn with_indexer(&self, indexer: Arc<dyn Indexer>) -> Arc<dyn Vfs> {
		Arc::new(Self {
			domain: self.domain.clone(),
			root: self.root.clone(),
			index: indexer,
			env: self.env.clone(),
			threshold: self.threshold,
		})
	}

	async fn init(&self) -> Result<(), VfsError> {
		for dir in [
			self.root.clone(),
			self.root.join(TMP_DIR),
			self.root.join(VERSIONS_DIR),
			self.fs_path(super::TRASH_DIR_NAME),
		] {
			fs::create_dir_all(&dir)
				.await
				.map_err(|e| FileIOError::from((dir.clone(), e)))?;
		}
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
		let fullpath = self.file_fullpath(file).await?;
		let path = self.fs_path(&fullpath);
		let f = fs::File::open(&path)
			.await
			.map_err(|e| FileIOError::from((path, e)))?;
		Ok(Box::new(BufReader::new(f)))
	}

	async fn open_file_version(&self, version: &Version) -> Result<FileReader, VfsError> {
		let path = self.version_path(version);
		let f = fs::File::open(&path)
			.await
			.map_err(|e| FileIOError::from((path, e)))?;
		Ok(Box::new(BufReader::new(f)))
	}

	async fn create_dir(&self, dir: &mut DirDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		let parent = self.check_parent(&dir.dir_id).await?;
		if parent.is_trashed() {
			return Err(VfsError::ParentInTrash);
		}
		dir.fullpath = join_path(&parent.fullpath, &dir.name);
		let path = self.fs_path(&dir.fullpath);
		fs::create_dir(&path)
			.await
			.map_err(|e| FileIOError::from((path.clone(), e)))?;
		if let Err(e) = self.index.create_dir_doc(dir).await {
			let _ = fs::remove_dir(&path).await;
			return Err(e);
		}
		Ok(())
	}

	async fn update_dir_doc(&self, old: &DirDoc, new: &mut DirDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		if new.fullpath.starts_with(&format!("{}/", old.fullpath)) {
			return Err(VfsError::ForbiddenDocMove);
		}
		if new.dir_id != old.dir_id {
			self.check_parent(&new.dir_id).await?;
		}
		if new.fullpath != old.fullpath {
			let from = self.fs_path(&old.fullpath);
			let to = self.fs_path(&new.fullpath);
			fs::rename(&from, &to)
				.await
				.map_err(|e| FileIOError::from((from.clone(), e)))?;
			if let Err(e) = self.index.update_dir_doc(old, new).await {
				let _ = fs::rename(&to, &from).await;
				return Err(e);
			}
			return Ok(());
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
		let target = join_path(&parent.fullpath, &new.name);
		let tmp_path = self
			.root
			.join(TMP_DIR)
			.join(cozy_utils::new_doc_id());
		let tmp = fs::File::create(&tmp_path)
			.await
			.map_err(|e| FileIOError::from((tmp_path.clone(), e)))?;
		let remaining = if self.threshold.quota > 0 {
			let usage = self.index.disk_usage().await?;
			Some(self.threshold.quota.saturating_sub(usage))
		} else {
			None
		};
		Ok(Box::new(LocalFileHandle {
			vfs: self.clone_inner(),
			new,
			old,
			target,
			tmp_path,
			tmp: Some(tmp),
			hasher: Md5::new(),
			extractor: MetaExtractor::new(),
			written: 0,
			remaining,
		}))
	}

	async fn update_file_doc(&self, old: &FileDoc, new: &mut FileDoc) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		let old_fullpath = self.file_fullpath(old).await?;
		if new.dir_id != old.dir_id {
			let parent = self.check_parent(&new.dir_id).await?;
			if parent.is_trashed() && !new.trashed {
				return Err(VfsError::ParentInTrash);
			}
		}
		self.index.update_file_doc(old, new).await?;
		let new_fullpath = self.file_fullpath(new).await?;
		if new_fullpath != old_fullpath {
			let from = self.fs_path(&old_fullpath);
			let to = self.fs_path(&new_fullpath);
			fs::rename(&from, &to)
				.await
				.map_err(|e| FileIOError::from((from, e)))?;
		}
		Ok(())
	}

	async fn copy_file(&self, src: &FileDoc, new_name: &str) -> Result<FileDoc, VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		let mut copy = src.clone();
		copy.doc_id = cozy_utils::new_doc_id();
		copy.doc_rev = String::new();
		copy.name = new_name.to_owned();
		copy.created_at = Utc::now();
		copy.updated_at = copy.created_at;
		copy.referenced_by = Vec::new();
		let src_fullpath = self.file_fullpath(src).await?;
		let dst_fullpath = join_path(parent_path(&src_fullpath), new_name);
		let from = self.fs_path(&src_fullpath);
		let to = self.fs_path(&dst_fullpath);
		fs::copy(&from, &to)
			.await
			.map_err(|e| FileIOError::from((from, e)))?;
		if let Err(e) = self.index.create_file_doc(&mut copy).await {
			let _ = fs::remove_file(&to).await;
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
		let old_fullpath = self.file_fullpath(old).await?;
		let content = self.fs_path(&old_fullpath);
		let keep = self.root.join(TMP_DIR).join(cozy_utils::new_doc_id());
		fs::copy(&content, &keep)
			.await
			.map_err(|e| FileIOError::from((content.clone(), e)))?;
		self.destroy_file_inner(old).await?;
		self.index.create_file_doc(new).await?;
		let new_fullpath = self.file_fullpath(new).await?;
		let to = self.fs_path(&new_fullpath);
		fs::rename(&keep, &to)
			.await
			.map_err(|e| FileIOError::from((keep, e)))?;
		Ok(())
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
		let path = self.fs_path(&dir.fullpath);
		if let Err(e) = fs::remove_dir_all(&path).await {
			if e.kind() != std::io::ErrorKind::NotFound {
				return Err(FileIOError::from((path, e)).into());
			}
		}
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
		let fullpath = self.file_fullpath(file).await?;
		let content = self.fs_path(&fullpath);

		let mut snapshot = Version::from_file(file, &cozy_utils::new_doc_id());
		let snapshot_path = self.version_path(&snapshot);
		if let Some(parent) = snapshot_path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| FileIOError::from((parent.to_owned(), e)))?;
		}
		fs::copy(&content, &snapshot_path)
			.await
			.map_err(|e| FileIOError::from((content.clone(), e)))?;
		self.index.create_version(&mut snapshot).await?;

		let version_path = self.version_path(version);
		fs::copy(&version_path, &content)
			.await
			.map_err(|e| FileIOError::from((version_path.clone(), e)))?;
		let mut newdoc = file.clone();
		newdoc.md5sum = version.md5sum.clone();
		newdoc.byte_size = version.byte_size;
		newdoc.mime = version.mime.clone();
		newdoc.class = version.class.clone();
		newdoc.updated_at = Utc::now();
		self.index.update_file_doc(file, &mut newdoc).await?;
		let _ = fs::remove_file(&version_path).await;
		self.index.delete_version(version).await?;
		Ok(newdoc)
	}

	async fn import_file_version(
		&self,
		mut version: Version,
		content: Vec<u8>,
	) -> Result<(), VfsError> {
		let _guard = self.env.locks.write(&self.domain, lock::VFS).await;
		let path = self.version_path(&version);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| FileIOError::from((parent.to_owned(), e)))?;
		}
		fs::write(&path, content)
			.await
			.map_err(|e| FileIOError::from((path.clone(), e)))?;
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

impl LocalVfs {
	fn clone_inner(&self) -> Arc<LocalVfs> {
		Arc::new(Self {
			domain: self.domain.clone(),
			root: self.root.clone(),
			index: self.index.clone(),
			env: self.env.clone(),
			threshold: self.threshold,
		})
	}
}

struct LocalFileHandle {
	vfs: Arc<LocalVfs>,
	new: FileDoc,
	old: Option<FileDoc>,
	target: String,
	tmp_path: PathBuf,
	tmp: Option<fs::File>,
	hasher: Md5,
	extractor: MetaExtractor,
	written: u64,
	remaining: Option<u64>,
}

impl LocalFileHandle {
	async fn cleanup(path: &Path) {
		let _ = fs::remove_file(path).await;
	}
}

#[async_trait]
impl FileHandle for LocalFileHandle {
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
		let tmp = self.tmp.as_mut().expect("file handle used after close");
		tmp.write_all(chunk)
			.await
			.map_err(|e| VfsError::FileIO(FileIOError::from((self.tmp_path.clone(), e))))?;
		Ok(())
	}

	async fn close(self: Box<Self>) -> Result<FileDoc, VfsError> {
		let Self {
			vfs,
			mut new,
			old,
			target,
			tmp_path,
			mut tmp,
			hasher,
			extractor,
			written,
			..
		} = *self;

		if let Some(mut f) = tmp.take() {
			if let Err(e) = f.flush().await {
				Self::cleanup(&tmp_path).await;
				return Err(FileIOError::from((tmp_path, e)).into());
			}
		}

		let md5 = hex::encode(hasher.finalize());
		if !new.md5sum.is_empty() && new.md5sum != md5 {
			Self::cleanup(&tmp_path).await;
			return Err(VfsError::InvalidHash);
		}
		if new.byte_size > 0 && new.byte_size != written {
			Self::cleanup(&tmp_path).await;
			return Err(VfsError::ContentLengthMismatch {
				expected: new.byte_size,
				written,
			});
		}
		new.md5sum = md5;
		new.byte_size = written;
		extractor.apply(&mut new);

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
			if let Some(old) = &old {
				// Snapshot the previous content as a version before it is
				// overwritten.
				if old.md5sum != new.md5sum {
					let mut version = Version::from_file(old, &cozy_utils::new_doc_id());
					let version_path = vfs.version_path(&version);
					if let Some(parent) = version_path.parent() {
						fs::create_dir_all(parent)
							.await
							.map_err(|e| FileIOError::from((parent.to_owned(), e)))?;
					}
					let old_fullpath = vfs.file_fullpath(old).await?;
					let old_path = vfs.fs_path(&old_fullpath);
					fs::copy(&old_path, &version_path)
						.await
						.map_err(|e| FileIOError::from((old_path, e)))?;
					vfs.index.create_version(&mut version).await?;
				}
			}
			let final_path = vfs.fs_path(&target);
			fs::rename(&tmp_path, &final_path)
				.await
				.map_err(|e| FileIOError::from((tmp_path.clone(), e)))?;
			match &old {
				Some(old) => {
					vfs.index.update_file_doc(old, &mut new).await?;
					vfs.clean_old_versions_inner(&new.doc_id).await?;
				}
				None => vfs.index.create_file_doc(&mut new).await?,
			}
			Ok(())
		};
		if let Err(e) = commit.await {
			Self::cleanup(&tmp_path).await;
			return Err(e);
		}
		vfs.check_capacity().await;
		Ok(new)
	}

	async fn abort(self: Box<Self>) -> Result<(), VfsError> {
		Self::cleanup(&self.tmp_path).await;
		Ok(())
	}
}
