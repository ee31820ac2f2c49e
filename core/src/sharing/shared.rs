//! The shared index: for every document touched by any sharing, which
//! sharings cover it and what they already know.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
	couch::{self, impl_doc, revision::RevTree, CouchError, Selector, Store, SHARED},
	job::JobCtx,
	realtime::{Hub, Verb},
	vfs,
};

use super::{find_sharing, SharingError};

/// Per-sharing replication state of one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedInfo {
	/// Index of the rule that covers this document.
	pub rule: usize,
	/// The document is a file with binary content to upload.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub binary: bool,
	/// The document is no longer shared (trashed, deleted, or moved out
	/// of the rule's scope).
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub removed: bool,
	/// The document was structurally moved out of the shared tree and got
	/// a new identity.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub dissociated: bool,
}

/// One entry of the shared index, keyed `<doctype>/<docid>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedRef {
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	pub doc_id: String,
	#[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
	pub doc_rev: String,
	/// The revisions of the document observed by the sharings.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub revisions: Option<RevTree>,
	pub infos: HashMap<String, SharedInfo>,
}

impl_doc!(SharedRef, SHARED);

impl SharedRef {
	pub fn new(doctype: &str, id: &str) -> Self {
		Self {
			doc_id: format!("{doctype}/{id}"),
			doc_rev: String::new(),
			revisions: None,
			infos: HashMap::new(),
		}
	}

	/// The document id part of the key.
	pub fn target_id(&self) -> &str {
		self.doc_id
			.split_once('/')
			.map(|(_, id)| id)
			.unwrap_or(&self.doc_id)
	}

	pub fn rev_known(&self, rev: &str) -> bool {
		self.revisions
			.as_ref()
			.map_or(false, |tree| tree.find(rev).is_some())
	}

	/// Merges a revision chain (root to tip) into the observed tree.
	pub fn merge_chain(&mut self, chain: &[String]) {
		match &mut self.revisions {
			Some(tree) => tree.insert_chain(chain),
			None => self.revisions = RevTree::chain(chain),
		}
	}

	/// Merges a single revision as a child of its parent.
	pub fn merge_rev(&mut self, rev: &str, parent: &str) {
		match &mut self.revisions {
			Some(tree) => tree.add(rev, parent),
			None => self.revisions = Some(RevTree::new(rev)),
		}
	}

	/// Persists the entry, retrying once over a concurrent write, and
	/// publishes the realtime event driving the replicate and upload
	/// triggers.
	pub async fn save(&mut self, store: &dyn Store, hub: &Hub) -> Result<(), CouchError> {
		let verb = if self.doc_rev.is_empty() {
			Verb::Created
		} else {
			Verb::Updated
		};
		let value = couch::to_value(self)?;
		let rev = match store.put(SHARED, value.clone()).await {
			Ok((_, rev)) => rev,
			Err(e) if e.is_conflict() => {
				let current = store.get(SHARED, &self.doc_id).await?;
				let mut merged: SharedRef = couch::from_value(current)?;
				if let Some(tree) = self.revisions.take() {
					merged.merge_chain(&tree.winner_chain());
					for leaf in tree.leaves() {
						merged.merge_chain(&[leaf.to_owned()]);
					}
				}
				for (sid, info) in self.infos.drain() {
					merged.infos.insert(sid, info);
				}
				*self = merged;
				let value = couch::to_value(self)?;
				let (_, rev) = store.put(SHARED, value).await?;
				rev
			}
			Err(e) => return Err(e),
		};
		self.doc_rev = rev.clone();
		let mut published = couch::to_value(self)?;
		published["_id"] = Value::String(self.doc_id.clone());
		published["_rev"] = Value::String(rev);
		hub.publish(verb, SHARED, &self.doc_id, published, None);
		Ok(())
	}
}

/// Fetches a shared index entry, `None` when the document is not covered
/// by any sharing.
pub async fn get_shared_ref(
	store: &dyn Store,
	doctype: &str,
	id: &str,
) -> Result<Option<SharedRef>, CouchError> {
	match store.get(SHARED, &format!("{doctype}/{id}")).await {
		Ok(value) => Ok(Some(couch::from_value(value)?)),
		Err(e) if e.is_not_found() => Ok(None),
		Err(e) => Err(e),
	}
}

/// The message carried by the track triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackMessage {
	pub sharing_id: String,
	pub rule_index: usize,
}

/// The `share-track` worker: called on local writes of the shared
/// doctypes, it records the per-sharing replication state used by the
/// replicate and upload workers.
pub async fn worker_track(ctx: JobCtx) -> Result<(), crate::Error> {
	let msg: TrackMessage =
		serde_json::from_value(ctx.message.clone()).map_err(CouchError::Json)?;
	let events = match ctx.event.clone() {
		Some(Value::Array(events)) => events,
		Some(event) => vec![event],
		None => return Ok(()),
	};
	let sharing = find_sharing(&ctx.instance, &msg.sharing_id).await?;
	for event in events {
		track_event(&ctx, &sharing, msg.rule_index, &event).await?;
	}
	Ok(())
}

async fn track_event(
	ctx: &JobCtx,
	sharing: &super::Sharing,
	rule_index: usize,
	event: &Value,
) -> Result<(), crate::Error> {
	let instance = &ctx.instance;
	let doctype = event
		.get("doctype")
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_owned();
	let id = event
		.get("id")
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_owned();
	if id.is_empty() || id.starts_with("_design") || id == vfs::ROOT_DIR_ID || id == vfs::TRASH_DIR_ID
	{
		return Ok(());
	}
	let Some(rule) = sharing.rules.get(rule_index) else {
		return Err(SharingError::InvalidSharing.into());
	};
	let doc = event.get("doc").cloned().unwrap_or(Value::Null);
	let old = event.get("old").cloned();
	let deleted = couch::is_tombstone(&doc);

	let sid = format!("{doctype}/{id}");
	let _guard = instance
		.env
		.locks
		.write(&instance.domain, &format!("shared/{sid}"))
		.await;

	let mut shared_ref = get_shared_ref(instance.store.as_ref(), &doctype, &id).await?;

	// Decide whether this change is (still) covered by the sharing.
	let accepted = !deleted && rule.accept(&doctype, &doc);
	let was_accepted = old
		.as_ref()
		.map_or(false, |old| rule.accept(&doctype, old));
	if !accepted && !was_accepted && shared_ref.is_none() {
		return Ok(());
	}

	let mut shared_ref = shared_ref
		.take()
		.unwrap_or_else(|| SharedRef::new(&doctype, &id));

	let rev = couch::doc_rev(&doc);
	if !rev.is_empty() {
		if shared_ref.rev_known(rev) && shared_ref.infos.contains_key(&sharing.doc_id) {
			// Echo of a change we applied from this very sharing.
			return Ok(());
		}
		let parent = old
			.as_ref()
			.map(|old| couch::doc_rev(old).to_owned())
			.unwrap_or_default();
		shared_ref.merge_rev(rev, &parent);
	}

	let is_file = doctype == couch::FILES
		&& doc.get("type").and_then(Value::as_str) == Some("file");
	let trashed = doc.get("trashed").and_then(Value::as_bool).unwrap_or(false);
	let previous = shared_ref
		.infos
		.get(&sharing.doc_id)
		.cloned()
		.unwrap_or_default();
	let removed = deleted || trashed || !accepted;
	shared_ref.infos.insert(
		sharing.doc_id.clone(),
		SharedInfo {
			rule: rule_index,
			binary: is_file && !deleted,
			removed,
			dissociated: previous.dissociated,
		},
	);

	debug!(target: "sharing", sharing = %sharing.doc_id, doc = %sid, removed, "tracked change");
	shared_ref
		.save(instance.store.as_ref(), &instance.realtime)
		.await?;
	Ok(())
}

/// Marks a document as structurally moved out of the shared tree: its
/// identity changed and further changes must not replicate.
pub async fn mark_dissociated(
	instance: &crate::instance::Instance,
	sharing_id: &str,
	doctype: &str,
	id: &str,
) -> Result<(), CouchError> {
	let Some(mut shared_ref) = get_shared_ref(instance.store.as_ref(), doctype, id).await? else {
		return Ok(());
	};
	if let Some(info) = shared_ref.infos.get_mut(sharing_id) {
		info.removed = true;
		info.dissociated = true;
		shared_ref
			.save(instance.store.as_ref(), &instance.realtime)
			.await?;
	}
	Ok(())
}

/// Sweeps every shared index entry of a revoked sharing.
pub async fn remove_all_shared_refs(
	instance: &crate::instance::Instance,
	sharing_id: &str,
) -> Result<(), CouchError> {
	let docs = instance
		.store
		.find(SHARED, &Selector::Exists(format!("infos.{sharing_id}")), 0)
		.await?;
	// `Exists` does not see nested keys, fall back to a full scan.
	let docs = if docs.is_empty() {
		instance.store.all_docs(SHARED).await?
	} else {
		docs
	};
	for doc in docs {
		let mut shared_ref: SharedRef = match couch::from_value(doc) {
			Ok(r) => r,
			Err(_) => continue,
		};
		if shared_ref.infos.remove(sharing_id).is_none() {
			continue;
		}
		if shared_ref.infos.is_empty() {
			instance
				.store
				.delete(SHARED, &shared_ref.doc_id, &shared_ref.doc_rev)
				.await?;
		} else {
			shared_ref
				.save(instance.store.as_ref(), &instance.realtime)
				.await?;
		}
	}
	Ok(())
}

/// Counts the shared documents of one sharing that carry binary content,
/// i.e. the files a recipient will receive during the initial sync.
pub async fn count_binaries(
	store: &dyn Store,
	sharing_id: &str,
) -> Result<usize, CouchError> {
	let mut count = 0;
	for doc in store.all_docs(SHARED).await? {
		let shared_ref: SharedRef = match couch::from_value(doc) {
			Ok(r) => r,
			Err(_) => continue,
		};
		if shared_ref
			.infos
			.get(sharing_id)
			.map_or(false, |i| i.binary && !i.removed)
		{
			count += 1;
		}
	}
	Ok(count)
}
