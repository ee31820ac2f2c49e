//! Old versions of file contents.
//!
//! A version is an immutable snapshot of a file's prior content, with an
//! id of the form `<file-id>/<internal-id>`. Retention is driven by the
//! configured policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
	config::VersionPolicy,
	couch::{impl_doc, VERSIONS},
};

use super::FileDoc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	pub doc_id: String,
	#[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
	pub doc_rev: String,
	pub updated_at: DateTime<Utc>,
	#[serde(default)]
	pub md5sum: String,
	#[serde(rename = "size", default)]
	pub byte_size: u64,
	#[serde(default)]
	pub mime: String,
	#[serde(default)]
	pub class: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
}

impl_doc!(Version, VERSIONS);

impl Version {
	/// Snapshots the current content of a file. `internal_id` names the
	/// stored bytes in the content store.
	pub fn from_file(file: &FileDoc, internal_id: &str) -> Self {
		Self {
			doc_id: format!("{}/{}", file.doc_id, internal_id),
			doc_rev: String::new(),
			updated_at: file.updated_at,
			md5sum: file.md5sum.clone(),
			byte_size: file.byte_size,
			mime: file.mime.clone(),
			class: file.class.clone(),
			tags: file.tags.clone(),
		}
	}

	pub fn file_id(&self) -> &str {
		self.doc_id.split_once('/').map(|(f, _)| f).unwrap_or(&self.doc_id)
	}

	pub fn internal_id(&self) -> &str {
		self.doc_id.split_once('/').map(|(_, v)| v).unwrap_or("")
	}
}

/// Applies the retention policy to the versions of one file, returning the
/// versions that must be dropped. `versions` holds all the versions of the
/// file, the newly captured one included.
pub fn to_clean(versions: &[Version], policy: &VersionPolicy, now: DateTime<Utc>) -> Vec<Version> {
	let mut sorted: Vec<&Version> = versions.iter().collect();
	sorted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

	let mut drop = Vec::new();
	// Two versions captured in a burst only keep the most recent one.
	let min_delay =
		chrono::Duration::from_std(policy.min_delay).unwrap_or_else(|_| chrono::Duration::zero());
	let mut kept: Vec<&Version> = Vec::new();
	for v in sorted {
		match kept.last() {
			Some(prev) if prev.updated_at - v.updated_at < min_delay && now - v.updated_at < min_delay => {
				drop.push((*v).clone())
			}
			_ => kept.push(v),
		}
	}
	for v in kept.into_iter().skip(policy.max_number) {
		drop.push(v.clone());
	}
	drop
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	fn version(id: &str, age_secs: i64) -> Version {
		Version {
			doc_id: format!("file/{id}"),
			doc_rev: String::new(),
			updated_at: Utc::now() - chrono::Duration::seconds(age_secs),
			md5sum: String::new(),
			byte_size: 0,
			mime: String::new(),
			class: String::new(),
			tags: Vec::new(),
		}
	}

	#[test]
	fn keeps_at_most_max_number() {
		let policy = VersionPolicy {
			max_number: 2,
			min_delay: Duration::from_secs(0),
		};
		let versions = vec![version("a", 30), version("b", 20), version("c", 10)];
		let dropped = to_clean(&versions, &policy, Utc::now());
		assert_eq!(dropped.len(), 1);
		assert_eq!(dropped[0].doc_id, "file/a");
	}

	#[test]
	fn bursts_are_collapsed() {
		let policy = VersionPolicy {
			max_number: 10,
			min_delay: Duration::from_secs(60),
		};
		let versions = vec![version("a", 5), version("b", 2)];
		let dropped = to_clean(&versions, &policy, Utc::now());
		assert_eq!(dropped.len(), 1);
		assert_eq!(dropped[0].doc_id, "file/a");
	}
}
