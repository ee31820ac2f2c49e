//! The object store behind the content-addressed VFS back-end.
//!
//! One container per instance, named `cozy-v3-<prefix>`. A file's content
//! object is named `<id[0:22]>/<id[22:27]>/<id[27:32]>/<internal-id>`; a
//! version reuses the same id prefix with another internal id, so all the
//! contents of one file share a prefix and can be bulk-deleted.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{FileReader, VfsError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn put(&self, container: &str, name: &str, content: Bytes) -> Result<(), VfsError>;
	async fn get(&self, container: &str, name: &str) -> Result<FileReader, VfsError>;
	async fn copy(&self, container: &str, src: &str, dst: &str) -> Result<(), VfsError>;
	async fn delete(&self, container: &str, name: &str) -> Result<(), VfsError>;
	/// Bulk deletion of every object under a prefix.
	async fn delete_prefix(&self, container: &str, prefix: &str) -> Result<(), VfsError>;
	/// Marks a whole container for deletion; a background sweep reclaims it.
	async fn delete_container(&self, container: &str) -> Result<(), VfsError>;
}

/// The name of the container holding an instance's objects.
pub fn container_name(prefix: &str) -> String {
	format!("cozy-v3-{prefix}")
}

fn split_at_clamped(id: &str, idx: usize) -> (&str, &str) {
	id.split_at(idx.min(id.len()))
}

/// The object name of one stored content.
pub fn object_name(doc_id: &str, internal_id: &str) -> String {
	format!("{}/{internal_id}", object_prefix(doc_id))
}

/// The shared object-name prefix of every content of one file.
pub fn object_prefix(doc_id: &str) -> String {
	let (a, rest) = split_at_clamped(doc_id, 22);
	let (b, c) = split_at_clamped(rest, 5);
	let (c, _) = split_at_clamped(c, 5);
	format!("{a}/{b}/{c}")
}

/// In-memory object store, used by tests and single-process deployments.
#[derive(Default)]
pub struct MemObjectStore {
	containers: RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl MemObjectStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ObjectStore for MemObjectStore {
	async fn put(&self, container: &str, name: &str, content: Bytes) -> Result<(), VfsError> {
		let mut containers = self.containers.write().await;
		containers
			.entry(container.to_owned())
			.or_default()
			.insert(name.to_owned(), content);
		Ok(())
	}

	async fn get(&self, container: &str, name: &str) -> Result<FileReader, VfsError> {
		let containers = self.containers.read().await;
		let content = containers
			.get(container)
			.and_then(|c| c.get(name))
			.cloned()
			.ok_or_else(|| VfsError::NotFound(format!("{container}/{name}")))?;
		Ok(Box::new(Cursor::new(content.to_vec())))
	}

	async fn copy(&self, container: &str, src: &str, dst: &str) -> Result<(), VfsError> {
		let mut containers = self.containers.write().await;
		let objects = containers
			.get_mut(container)
			.ok_or_else(|| VfsError::NotFound(container.to_owned()))?;
		let content = objects
			.get(src)
			.cloned()
			.ok_or_else(|| VfsError::NotFound(format!("{container}/{src}")))?;
		objects.insert(dst.to_owned(), content);
		Ok(())
	}

	async fn delete(&self, container: &str, name: &str) -> Result<(), VfsError> {
		let mut containers = self.containers.write().await;
		if let Some(objects) = containers.get_mut(container) {
			objects.remove(name);
		}
		Ok(())
	}

	async fn delete_prefix(&self, container: &str, prefix: &str) -> Result<(), VfsError> {
		let mut containers = self.containers.write().await;
		if let Some(objects) = containers.get_mut(container) {
			objects.retain(|name, _| !name.starts_with(prefix));
		}
		Ok(())
	}

	async fn delete_container(&self, container: &str) -> Result<(), VfsError> {
		let mut containers = self.containers.write().await;
		containers.remove(container);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn object_names_shard_by_doc_id() {
		let id = "2f85ac24f2104f5d8a8b4ff5c7a0e3b9";
		assert_eq!(
			object_name(id, "v1"),
			"2f85ac24f2104f5d8a8b4f/f5c7a/0e3b9/v1"
		);
		// A conflict id is longer than 32 characters and still shards.
		let long = format!("{id}-deadbeef");
		assert!(object_name(&long, "v1").starts_with("2f85ac24f2104f5d8a8b4f/"));
	}

	#[tokio::test]
	async fn put_get_delete_prefix() {
		let store = MemObjectStore::new();
		store
			.put("cozy-v3-a", "x/y/z/1", Bytes::from_static(b"one"))
			.await
			.unwrap();
		store
			.put("cozy-v3-a", "x/y/z/2", Bytes::from_static(b"two"))
			.await
			.unwrap();
		assert!(store.get("cozy-v3-a", "x/y/z/1").await.is_ok());
		store.delete_prefix("cozy-v3-a", "x/y/z/").await.unwrap();
		assert!(store.get("cozy-v3-a", "x/y/z/2").await.is_err());
	}
}
