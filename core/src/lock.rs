//! Named read-write locks.
//!
//! One lock per (instance, name); guards are owned so they can be held
//! across await points and released before calling external peers.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// The instance-wide VFS lock name.
pub const VFS: &str = "vfs";

#[derive(Default)]
pub struct LockManager {
	locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockManager {
	pub fn new() -> Self {
		Self::default()
	}

	async fn entry(&self, domain: &str, name: &str) -> Arc<RwLock<()>> {
		let key = format!("{domain}/{name}");
		let mut locks = self.locks.lock().await;
		locks.entry(key).or_default().clone()
	}

	/// Acquires the named lock exclusively.
	pub async fn write(&self, domain: &str, name: &str) -> OwnedRwLockWriteGuard<()> {
		self.entry(domain, name).await.write_owned().await
	}

	/// Acquires the named lock shared.
	pub async fn read(&self, domain: &str, name: &str) -> OwnedRwLockReadGuard<()> {
		self.entry(domain, name).await.read_owned().await
	}
}
