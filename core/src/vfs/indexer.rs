//! Indexers store the directory and file documents of a VFS.
//!
//! [`CouchIndexer`] is the base implementation over the document store.
//! [`SharingIndexer`] decorates it for writes coming from a sharing peer:
//! documents are written at a forced position in their revision tree and
//! the shared index is fed along the way.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
	couch::{
		self,
		revision::{synthesize, RevsStruct},
		CouchError, Selector, Store, FILES, VERSIONS,
	},
	realtime::{Hub, Verb},
	sharing::shared::SharedRef,
};

use super::{DirDoc, DirOrFile, FileDoc, Version, VfsError, ROOT_DIR_ID, TRASH_DIR_ID, TRASH_DIR_NAME, TRASH_NAME};

#[async_trait]
pub trait Indexer: Send + Sync {
	/// Creates the root and trash directory documents when missing.
	async fn init(&self) -> Result<(), VfsError>;

	async fn dir_by_id(&self, id: &str) -> Result<DirDoc, VfsError>;
	async fn dir_by_path(&self, path: &str) -> Result<DirDoc, VfsError>;
	async fn file_by_id(&self, id: &str) -> Result<FileDoc, VfsError>;
	async fn dir_or_file_by_id(&self, id: &str) -> Result<DirOrFile, VfsError>;
	/// The non-trashed child with this name, if any.
	async fn dir_child_by_name(&self, dir_id: &str, name: &str) -> Result<DirOrFile, VfsError>;
	async fn dir_children(&self, dir_id: &str) -> Result<Vec<DirOrFile>, VfsError>;
	async fn file_path(&self, file: &FileDoc) -> Result<String, VfsError>;

	async fn create_dir_doc(&self, dir: &mut DirDoc) -> Result<(), VfsError>;
	async fn update_dir_doc(&self, old: &DirDoc, new: &mut DirDoc) -> Result<(), VfsError>;
	async fn delete_dir_doc(&self, dir: &DirDoc) -> Result<(), VfsError>;
	async fn create_file_doc(&self, file: &mut FileDoc) -> Result<(), VfsError>;
	async fn update_file_doc(&self, old: &FileDoc, new: &mut FileDoc) -> Result<(), VfsError>;
	async fn delete_file_doc(&self, file: &FileDoc) -> Result<(), VfsError>;

	async fn create_version(&self, version: &mut Version) -> Result<(), VfsError>;
	async fn delete_version(&self, version: &Version) -> Result<(), VfsError>;
	async fn versions_of(&self, file_id: &str) -> Result<Vec<Version>, VfsError>;

	async fn list_not_synchronized_on(&self, client_id: &str) -> Result<Vec<DirDoc>, VfsError>;
	async fn disk_usage(&self) -> Result<u64, VfsError>;
}

pub struct CouchIndexer {
	store: Arc<dyn Store>,
	events: Hub,
}

impl CouchIndexer {
	pub fn new(store: Arc<dyn Store>, events: Hub) -> Arc<Self> {
		Arc::new(Self { store, events })
	}

	pub fn store(&self) -> Arc<dyn Store> {
		self.store.clone()
	}

	pub fn events(&self) -> Hub {
		self.events.clone()
	}

	/// Errors with `Exists` when another non-trashed child of `dir_id`
	/// bears this name.
	async fn check_unique(
		&self,
		dir_id: &str,
		name: &str,
		exclude_id: &str,
	) -> Result<(), VfsError> {
		match self.dir_child_by_name(dir_id, name).await {
			Ok(child) if child.id() != exclude_id => Err(VfsError::Exists(name.to_owned())),
			Ok(_) => Ok(()),
			Err(e) if e.is_not_found() => Ok(()),
			Err(e) => Err(e),
		}
	}

	/// After a directory moved, rewrite the denormalized path of all its
	/// descendant directories.
	async fn rename_descendants(&self, old_path: &str, new_path: &str) -> Result<(), VfsError> {
		let prefix = format!("{old_path}/");
		let docs = self.store.find(FILES, &Selector::Eq("type".into(), json!("directory")), 0).await?;
		for doc in docs {
			let Some(path) = doc.get("path").and_then(Value::as_str) else {
				continue;
			};
			if !path.starts_with(&prefix) {
				continue;
			}
			let path = path.to_string();
			let mut doc = doc;
			let renamed = format!("{new_path}/{}", &path[prefix.len()..]);
			doc["path"] = Value::String(renamed);
			self.store.put(FILES, doc).await?;
		}
		Ok(())
	}

	async fn put_doc(
		&self,
		verb: Verb,
		value: Value,
		old: Option<Value>,
	) -> Result<(String, String), CouchError> {
		let (id, rev) = self.store.put(FILES, value.clone()).await?;
		let mut doc = value;
		doc["_id"] = Value::String(id.clone());
		doc["_rev"] = Value::String(rev.clone());
		self.events.publish(verb, FILES, &id, doc, old);
		Ok((id, rev))
	}
}

#[async_trait]
impl Indexer for CouchIndexer {
	async fn init(&self) -> Result<(), VfsError> {
		if let Err(e) = self.store.get(FILES, ROOT_DIR_ID).await {
			if !e.is_not_found() {
				return Err(e.into());
			}
			let now = Utc::now();
			self.store
				.put(
					FILES,
					json!({
						"_id": ROOT_DIR_ID,
						"type": "directory",
						"path": "/",
						"created_at": now,
						"updated_at": now,
					}),
				)
				.await?;
			self.store
				.put(
					FILES,
					json!({
						"_id": TRASH_DIR_ID,
						"type": "directory",
						"name": TRASH_NAME,
						"dir_id": ROOT_DIR_ID,
						"path": TRASH_DIR_NAME,
						"created_at": now,
						"updated_at": now,
					}),
				)
				.await?;
		}
		Ok(())
	}

	async fn dir_by_id(&self, id: &str) -> Result<DirDoc, VfsError> {
		let value = self.store.get(FILES, id).await?;
		match DirOrFile::from_value(value)? {
			DirOrFile::Dir(dir) => Ok(dir),
			DirOrFile::File(_) => Err(VfsError::NotFound(id.to_owned())),
		}
	}

	async fn dir_by_path(&self, path: &str) -> Result<DirDoc, VfsError> {
		let docs = self
			.store
			.find(
				FILES,
				&Selector::And(vec![
					Selector::Eq("type".into(), json!("directory")),
					Selector::Eq("path".into(), json!(path)),
				]),
				1,
			)
			.await?;
		let doc = docs
			.into_iter()
			.next()
			.ok_or_else(|| VfsError::NotFound(path.to_owned()))?;
		match DirOrFile::from_value(doc)? {
			DirOrFile::Dir(dir) => Ok(dir),
			DirOrFile::File(_) => Err(VfsError::NotFound(path.to_owned())),
		}
	}

	async fn file_by_id(&self, id: &str) -> Result<FileDoc, VfsError> {
		let value = self.store.get(FILES, id).await?;
		match DirOrFile::from_value(value)? {
			DirOrFile::File(file) => Ok(file),
			DirOrFile::Dir(_) => Err(VfsError::NotFound(id.to_owned())),
		}
	}

	async fn dir_or_file_by_id(&self, id: &str) -> Result<DirOrFile, VfsError> {
		let value = self.store.get(FILES, id).await?;
		DirOrFile::from_value(value)
	}

	async fn dir_child_by_name(&self, dir_id: &str, name: &str) -> Result<DirOrFile, VfsError> {
		let docs = self
			.store
			.find(
				FILES,
				&Selector::And(vec![
					Selector::Eq("dir_id".into(), json!(dir_id)),
					Selector::Eq("name".into(), json!(name)),
				]),
				0,
			)
			.await?;
		for doc in docs {
			let child = DirOrFile::from_value(doc)?;
			let trashed_file = matches!(&child, DirOrFile::File(f) if f.trashed);
			if !trashed_file {
				return Ok(child);
			}
		}
		Err(VfsError::NotFound(format!("{dir_id}/{name}")))
	}

	async fn dir_children(&self, dir_id: &str) -> Result<Vec<DirOrFile>, VfsError> {
		let docs = self
			.store
			.find(FILES, &Selector::Eq("dir_id".into(), json!(dir_id)), 0)
			.await?;
		let mut children = docs
			.into_iter()
			.map(DirOrFile::from_value)
			.collect::<Result<Vec<_>, _>>()?;
		children.sort_by(|a, b| a.name().cmp(b.name()));
		Ok(children)
	}

	async fn file_path(&self, file: &FileDoc) -> Result<String, VfsError> {
		let parent = self.dir_by_id(&file.dir_id).await?;
		Ok(super::join_path(&parent.fullpath, &file.name))
	}

	async fn create_dir_doc(&self, dir: &mut DirDoc) -> Result<(), VfsError> {
		self.check_unique(&dir.dir_id, &dir.name, "").await?;
		let value = couch::to_value(dir)?;
		let (id, rev) = self.put_doc(Verb::Created, value, None).await?;
		dir.doc_id = id;
		dir.doc_rev = rev;
		Ok(())
	}

	async fn update_dir_doc(&self, old: &DirDoc, new: &mut DirDoc) -> Result<(), VfsError> {
		if new.dir_id != old.dir_id || new.name != old.name {
			self.check_unique(&new.dir_id, &new.name, &new.doc_id).await?;
		}
		let value = couch::to_value(new)?;
		let old_value = couch::to_value(old)?;
		let (_, rev) = self.put_doc(Verb::Updated, value, Some(old_value)).await?;
		new.doc_rev = rev;
		if new.fullpath != old.fullpath {
			self.rename_descendants(&old.fullpath, &new.fullpath).await?;
		}
		Ok(())
	}

	async fn delete_dir_doc(&self, dir: &DirDoc) -> Result<(), VfsError> {
		self.store.delete(FILES, &dir.doc_id, &dir.doc_rev).await?;
		let old = couch::to_value(dir)?;
		self.events.publish(
			Verb::Deleted,
			FILES,
			&dir.doc_id,
			couch::tombstone(&dir.doc_id, &dir.doc_rev),
			Some(old),
		);
		Ok(())
	}

	async fn create_file_doc(&self, file: &mut FileDoc) -> Result<(), VfsError> {
		self.check_unique(&file.dir_id, &file.name, "").await?;
		let value = couch::to_value(file)?;
		let (id, rev) = self.put_doc(Verb::Created, value, None).await?;
		file.doc_id = id;
		file.doc_rev = rev;
		Ok(())
	}

	async fn update_file_doc(&self, old: &FileDoc, new: &mut FileDoc) -> Result<(), VfsError> {
		if !new.trashed && (new.dir_id != old.dir_id || new.name != old.name) {
			self.check_unique(&new.dir_id, &new.name, &new.doc_id).await?;
		}
		let value = couch::to_value(new)?;
		let old_value = couch::to_value(old)?;
		let (_, rev) = self.put_doc(Verb::Updated, value, Some(old_value)).await?;
		new.doc_rev = rev;
		Ok(())
	}

	async fn delete_file_doc(&self, file: &FileDoc) -> Result<(), VfsError> {
		self.store.delete(FILES, &file.doc_id, &file.doc_rev).await?;
		let old = couch::to_value(file)?;
		self.events.publish(
			Verb::Deleted,
			FILES,
			&file.doc_id,
			couch::tombstone(&file.doc_id, &file.doc_rev),
			Some(old),
		);
		Ok(())
	}

	async fn create_version(&self, version: &mut Version) -> Result<(), VfsError> {
		let value = couch::to_value(version)?;
		let (_, rev) = self.store.put(VERSIONS, value).await?;
		version.doc_rev = rev;
		Ok(())
	}

	async fn delete_version(&self, version: &Version) -> Result<(), VfsError> {
		self.store
			.delete(VERSIONS, &version.doc_id, &version.doc_rev)
			.await?;
		Ok(())
	}

	async fn versions_of(&self, file_id: &str) -> Result<Vec<Version>, VfsError> {
		let prefix = format!("{file_id}/");
		let docs = self.store.all_docs(VERSIONS).await?;
		let mut versions = Vec::new();
		for doc in docs {
			if couch::doc_id(&doc).starts_with(&prefix) {
				versions.push(serde_json::from_value(doc).map_err(CouchError::Json)?);
			}
		}
		Ok(versions)
	}

	async fn list_not_synchronized_on(&self, client_id: &str) -> Result<Vec<DirDoc>, VfsError> {
		let docs = self
			.store
			.find(
				FILES,
				&Selector::Elem(
					"not_synchronized_on".into(),
					json!({"type": "io.cozy.oauth.clients", "id": client_id}),
				),
				0,
			)
			.await?;
		docs.into_iter()
			.map(|doc| serde_json::from_value(doc).map_err(|e| CouchError::Json(e).into()))
			.collect()
	}

	async fn disk_usage(&self) -> Result<u64, VfsError> {
		let mut total = 0u64;
		for doc in self.store.all_docs(FILES).await? {
			if doc.get("type").and_then(Value::as_str) == Some("file") {
				total += doc.get("size").and_then(Value::as_u64).unwrap_or(0);
			}
		}
		for doc in self.store.all_docs(VERSIONS).await? {
			total += doc.get("size").and_then(Value::as_u64).unwrap_or(0);
		}
		Ok(total)
	}
}

/// The revision at which a peer-originated write must land, with the
/// chain connecting it to history both sides know.
#[derive(Debug, Clone)]
pub struct BulkRevs {
	pub rev: String,
	pub revisions: RevsStruct,
}

/// Decorates an indexer for writes driven by the sharing engine: the
/// written documents keep the revisions computed by the peer instead of
/// getting fresh ones, and the shared index entry is updated in stride.
pub struct SharingIndexer {
	base: Arc<CouchIndexer>,
	store: Arc<dyn Store>,
	events: Hub,
	bulk: Mutex<Option<BulkRevs>>,
	shared_ref: Mutex<Option<SharedRef>>,
}

impl SharingIndexer {
	pub fn new(
		base: Arc<CouchIndexer>,
		bulk: Option<BulkRevs>,
		shared_ref: Option<SharedRef>,
	) -> Arc<Self> {
		let store = base.store();
		let events = base.events();
		Arc::new(Self {
			base,
			store,
			events,
			bulk: Mutex::new(bulk),
			shared_ref: Mutex::new(shared_ref),
		})
	}

	/// Bumps the forced revision by one generation. Used to resurrect a
	/// document over a tombstone, and to sidestep same-path conflicts.
	pub async fn increment_revision(&self) {
		let mut bulk = self.bulk.lock().await;
		if let Some(bulk) = bulk.as_mut() {
			let rev = synthesize(bulk.revisions.start + 1, &bulk.rev);
			bulk.revisions.start += 1;
			bulk.revisions.ids.insert(0, couch::revision::body(&rev).to_owned());
			bulk.rev = rev;
		}
	}

	/// Temporarily removes the forced revision, so an intermediate write
	/// gets a normal fresh revision. Restore it with
	/// [`Self::unstash_revision`].
	pub async fn stash_revision(&self) -> Option<BulkRevs> {
		self.bulk.lock().await.take()
	}

	pub async fn unstash_revision(&self, stash: Option<BulkRevs>) {
		*self.bulk.lock().await = stash;
	}

	/// Records that the local revision lost against the given chain: the
	/// next write lands at the chain's tip.
	pub async fn will_resolve_conflict(&self, chain: &[String]) {
		if let Some(tip) = chain.last() {
			*self.bulk.lock().await = Some(BulkRevs {
				rev: tip.clone(),
				revisions: RevsStruct::from_chain(chain),
			});
		}
	}

	async fn force_write(
		&self,
		verb: Verb,
		mut value: Value,
		old: Option<Value>,
		id: &str,
	) -> Result<Option<String>, VfsError> {
		let bulk = self.bulk.lock().await;
		let Some(bulk) = bulk.as_ref() else {
			return Ok(None);
		};
		value["_rev"] = Value::String(bulk.rev.clone());
		let chain = bulk.revisions.to_chain();
		debug!(target: "vfs", id, rev = %bulk.rev, "forced write");
		self.store.force_put(FILES, value.clone(), &chain).await?;
		self.events.publish(verb, FILES, id, value, old);

		let mut shared_ref = self.shared_ref.lock().await;
		if let Some(shared_ref) = shared_ref.as_mut() {
			shared_ref.merge_chain(&chain);
			shared_ref.save(self.store.as_ref(), &self.events).await?;
		}
		Ok(Some(bulk.rev.clone()))
	}
}

#[async_trait]
impl Indexer for SharingIndexer {
	async fn init(&self) -> Result<(), VfsError> {
		self.base.init().await
	}

	async fn dir_by_id(&self, id: &str) -> Result<DirDoc, VfsError> {
		self.base.dir_by_id(id).await
	}

	async fn dir_by_path(&self, path: &str) -> Result<DirDoc, VfsError> {
		self.base.dir_by_path(path).await
	}

	async fn file_by_id(&self, id: &str) -> Result<FileDoc, VfsError> {
		self.base.file_by_id(id).await
	}

	async fn dir_or_file_by_id(&self, id: &str) -> Result<DirOrFile, VfsError> {
		self.base.dir_or_file_by_id(id).await
	}

	async fn dir_child_by_name(&self, dir_id: &str, name: &str) -> Result<DirOrFile, VfsError> {
		self.base.dir_child_by_name(dir_id, name).await
	}

	async fn dir_children(&self, dir_id: &str) -> Result<Vec<DirOrFile>, VfsError> {
		self.base.dir_children(dir_id).await
	}

	async fn file_path(&self, file: &FileDoc) -> Result<String, VfsError> {
		self.base.file_path(file).await
	}

	async fn create_dir_doc(&self, dir: &mut DirDoc) -> Result<(), VfsError> {
		self.base.check_unique(&dir.dir_id, &dir.name, "").await?;
		if dir.doc_id.is_empty() {
			dir.doc_id = cozy_utils::new_doc_id();
		}
		let value = couch::to_value(dir)?;
		match self.force_write(Verb::Created, value, None, &dir.doc_id.clone()).await? {
			Some(rev) => {
				dir.doc_rev = rev;
				Ok(())
			}
			None => self.base.create_dir_doc(dir).await,
		}
	}

	async fn update_dir_doc(&self, old: &DirDoc, new: &mut DirDoc) -> Result<(), VfsError> {
		if new.dir_id != old.dir_id || new.name != old.name {
			self.base.check_unique(&new.dir_id, &new.name, &new.doc_id).await?;
		}
		let value = couch::to_value(new)?;
		let old_value = couch::to_value(old)?;
		match self
			.force_write(Verb::Updated, value, Some(old_value), &new.doc_id.clone())
			.await?
		{
			Some(rev) => {
				new.doc_rev = rev;
				if new.fullpath != old.fullpath {
					self.base.rename_descendants(&old.fullpath, &new.fullpath).await?;
				}
				Ok(())
			}
			None => self.base.update_dir_doc(old, new).await,
		}
	}

	async fn delete_dir_doc(&self, dir: &DirDoc) -> Result<(), VfsError> {
		self.base.delete_dir_doc(dir).await
	}

	async fn create_file_doc(&self, file: &mut FileDoc) -> Result<(), VfsError> {
		self.base.check_unique(&file.dir_id, &file.name, "").await?;
		if file.doc_id.is_empty() {
			file.doc_id = cozy_utils::new_doc_id();
		}
		let value = couch::to_value(file)?;
		match self
			.force_write(Verb::Created, value, None, &file.doc_id.clone())
			.await?
		{
			Some(rev) => {
				file.doc_rev = rev;
				Ok(())
			}
			None => self.base.create_file_doc(file).await,
		}
	}

	async fn update_file_doc(&self, old: &FileDoc, new: &mut FileDoc) -> Result<(), VfsError> {
		if !new.trashed && (new.dir_id != old.dir_id || new.name != old.name) {
			self.base.check_unique(&new.dir_id, &new.name, &new.doc_id).await?;
		}
		let value = couch::to_value(new)?;
		let old_value = couch::to_value(old)?;
		match self
			.force_write(Verb::Updated, value, Some(old_value), &new.doc_id.clone())
			.await?
		{
			Some(rev) => {
				new.doc_rev = rev;
				Ok(())
			}
			None => self.base.update_file_doc(old, new).await,
		}
	}

	async fn delete_file_doc(&self, file: &FileDoc) -> Result<(), VfsError> {
		self.base.delete_file_doc(file).await
	}

	async fn create_version(&self, version: &mut Version) -> Result<(), VfsError> {
		self.base.create_version(version).await
	}

	async fn delete_version(&self, version: &Version) -> Result<(), VfsError> {
		self.base.delete_version(version).await
	}

	async fn versions_of(&self, file_id: &str) -> Result<Vec<Version>, VfsError> {
		self.base.versions_of(file_id).await
	}

	async fn list_not_synchronized_on(&self, client_id: &str) -> Result<Vec<DirDoc>, VfsError> {
		self.base.list_not_synchronized_on(client_id).await
	}

	async fn disk_usage(&self) -> Result<u64, VfsError> {
		self.base.disk_usage().await
	}
}
