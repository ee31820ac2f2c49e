//! The process-wide environment: created once at startup, shared
//! read-only, teardown cancels all subscribers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{config::Config, lock::LockManager, sharing::upload::UploadKeyStore};

/// The notification collaborator. Only the hook the engine needs is
/// specified here.
pub trait Notifier: Send + Sync {
	/// The instance got close to its disk quota.
	fn disk_quota_close(&self, domain: &str);
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
	fn disk_quota_close(&self, _domain: &str) {}
}

pub struct Env {
	pub config: Config,
	pub locks: LockManager,
	pub notifier: Arc<dyn Notifier>,
	/// Pending upload keys handed out by the phase-1 file sync.
	pub upload_keys: UploadKeyStore,
	pub shutdown: CancellationToken,
}

impl Env {
	pub fn new(config: Config) -> Arc<Self> {
		Self::with_notifier(config, Arc::new(NoopNotifier))
	}

	pub fn with_notifier(config: Config, notifier: Arc<dyn Notifier>) -> Arc<Self> {
		Arc::new(Self {
			config,
			locks: LockManager::new(),
			notifier,
			upload_keys: UploadKeyStore::new(),
			shutdown: CancellationToken::new(),
		})
	}
}
