//! Process configuration.

use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::fs;

use cozy_utils::FileIOError;

/// How many changes a replicate or upload batch may cover.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// How many times a replicate or upload job retries before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Root directory for local-filesystem VFS mounts.
	pub fs_root: PathBuf,
	/// Default per-instance disk quota, in bytes. Zero means unlimited.
	pub disk_quota: u64,
	/// Hard per-file size limit, in bytes. Zero means unlimited.
	pub max_file_size: u64,
	/// Replication batch size.
	pub batch_size: usize,
	/// Max retries for replication and upload jobs.
	pub max_retries: u32,
	/// How often the trigger scheduler polls its time-based triggers.
	#[serde(with = "seconds")]
	pub poll_interval: Duration,
	pub versions: VersionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionPolicy {
	/// How many old versions of a file are kept.
	pub max_number: usize,
	/// Minimum delay between two captured versions.
	#[serde(with = "seconds")]
	pub min_delay: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			fs_root: PathBuf::from("storage"),
			disk_quota: 0,
			max_file_size: 0,
			batch_size: DEFAULT_BATCH_SIZE,
			max_retries: DEFAULT_MAX_RETRIES,
			poll_interval: Duration::from_secs(10),
			versions: VersionPolicy::default(),
		}
	}
}

impl Default for VersionPolicy {
	fn default() -> Self {
		Self {
			max_number: 20,
			min_delay: Duration::from_secs(15 * 60),
		}
	}
}

impl Config {
	/// Loads the configuration from a json file, creating it with the
	/// defaults when missing.
	pub async fn load_or_create(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		match fs::read(path).await {
			Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				let config = Self::default();
				config.save(path).await?;
				Ok(config)
			}
			Err(e) => Err(FileIOError::from((path, e)).into()),
		}
	}

	pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
		let path = path.as_ref();
		let bytes = serde_json::to_vec_pretty(self)?;
		fs::write(path, bytes)
			.await
			.map_err(|e| FileIOError::from((path, e)))?;
		Ok(())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("invalid config file: {0}")]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

mod seconds {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_secs(u64::deserialize(d)?))
	}
}
