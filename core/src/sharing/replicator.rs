//! Document replication between instances, driven by the changes feed of
//! the shared index.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
	couch::{
		self, impl_doc,
		revision::{detect_conflict, synthesize, Conflict, RevsStruct},
		ChangesRequest, CouchError, Store, FILES, MEMBER_SEQS, SHARED,
	},
	instance::Instance,
	job::JobCtx,
	vfs::{
		self,
		indexer::{BulkRevs, CouchIndexer, SharingIndexer},
		trash, DirDoc, Vfs,
	},
};

use super::{
	find_sharing,
	member::{xor_id, Member},
	refresh_credentials,
	shared::{self, SharedInfo, SharedRef},
	transport::DocsByDoctype,
	PeerClient, Sharing, SharingError,
};

/// The message carried by replicate jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateMsg {
	pub sharing_id: String,
}

/// A persisted replication cursor, one per (sharing, member, direction).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LastSeqDoc {
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	doc_id: String,
	#[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
	doc_rev: String,
	#[serde(default)]
	seq: u64,
}

impl_doc!(LastSeqDoc, MEMBER_SEQS);

fn seq_doc_id(sharing_id: &str, member: &Member, kind: &str) -> String {
	let host = member
		.instance
		.trim_end_matches('/')
		.replace("://", "_")
		.replace('/', "_");
	format!("{sharing_id}/{host}/{kind}")
}

/// Reads the last sequence number seen for a member, zero when unknown.
pub(super) async fn get_last_seq(
	instance: &Arc<Instance>,
	sharing_id: &str,
	member: &Member,
	kind: &str,
) -> Result<u64, SharingError> {
	match instance
		.get_doc::<LastSeqDoc>(&seq_doc_id(sharing_id, member, kind))
		.await
	{
		Ok(doc) => Ok(doc.seq),
		Err(e) if e.is_not_found() => Ok(0),
		Err(e) => Err(e.into()),
	}
}

pub(super) async fn update_last_seq(
	instance: &Arc<Instance>,
	sharing_id: &str,
	member: &Member,
	kind: &str,
	seq: u64,
) -> Result<(), SharingError> {
	let id = seq_doc_id(sharing_id, member, kind);
	let mut doc = match instance.get_doc::<LastSeqDoc>(&id).await {
		Ok(doc) => doc,
		Err(e) if e.is_not_found() => LastSeqDoc {
			doc_id: id,
			doc_rev: String::new(),
			seq: 0,
		},
		Err(e) => return Err(e.into()),
	};
	doc.seq = seq;
	if doc.doc_rev.is_empty() {
		instance.create_doc(&mut doc).await?;
	} else {
		instance.update_doc(&mut doc).await?;
	}
	Ok(())
}

/// Drops the replication cursors of a member, on revocation.
pub(super) async fn clear_last_seqs(
	instance: &Arc<Instance>,
	s: &Sharing,
	member: &Member,
) -> Result<(), SharingError> {
	for kind in ["replicate", "upload"] {
		match instance
			.get_doc::<LastSeqDoc>(&seq_doc_id(&s.doc_id, member, kind))
			.await
		{
			Ok(doc) => instance.delete_doc(&doc).await?,
			Err(e) if e.is_not_found() => {}
			Err(e) => return Err(e.into()),
		}
	}
	Ok(())
}

/// The `share-replicate` worker.
pub async fn worker_replicate(
	ctx: JobCtx,
	peer: Arc<dyn PeerClient>,
) -> Result<(), crate::Error> {
	let msg: ReplicateMsg =
		serde_json::from_value(ctx.message.clone()).map_err(CouchError::Json)?;
	let instance = ctx.instance.clone();
	let s = match find_sharing(&instance, &msg.sharing_id).await {
		Ok(s) => s,
		Err(SharingError::NotFound) => return Ok(()),
		Err(e) => return Err(e.into()),
	};
	if !s.active {
		return Ok(());
	}
	if !s.owner && s.read_only() {
		return Err(SharingError::Safety.into());
	}
	let max = instance.env.config.max_retries;
	let last_try = ctx.attempt >= max;
	replicate(&instance, &s, peer.as_ref(), last_try).await?;
	Ok(())
}

/// Pushes the pending document revisions of a sharing to its peers.
pub async fn replicate(
	instance: &Arc<Instance>,
	s: &Sharing,
	peer: &dyn PeerClient,
	last_try: bool,
) -> Result<(), SharingError> {
	let _guard = instance
		.env
		.locks
		.write(&instance.domain, &format!("sharings/{}/replicate", s.doc_id))
		.await;
	for index in s.targets() {
		loop {
			let more = replicate_to(instance, s, peer, index, last_try).await?;
			if !more {
				break;
			}
		}
	}
	Ok(())
}

/// Pushes one batch of revisions to one member. Returns `true` when more
/// changes are pending.
async fn replicate_to(
	instance: &Arc<Instance>,
	s: &Sharing,
	peer: &dyn PeerClient,
	index: usize,
	last_try: bool,
) -> Result<bool, SharingError> {
	let member = s.members.get(index).ok_or(SharingError::MemberNotFound)?;
	let creds = s
		.credentials_for(index)
		.ok_or(SharingError::InvalidSharing)?;
	let since = get_last_seq(instance, &s.doc_id, member, "replicate").await?;
	debug!(target: "replicator", sharing = %s.doc_id, member = index, since, "replicating");

	let changes = instance
		.store
		.changes(&ChangesRequest {
			doctype: SHARED.to_owned(),
			since,
			limit: instance.env.config.batch_size,
			include_docs: true,
		})
		.await?;
	if changes.results.is_empty() {
		return Ok(false);
	}

	let mut docs: DocsByDoctype = DocsByDoctype::new();
	for change in &changes.results {
		let Some(doc) = &change.doc else { continue };
		let shared_ref: SharedRef = match couch::from_value(doc.clone()) {
			Ok(r) => r,
			Err(_) => continue,
		};
		let Some(info) = shared_ref.infos.get(&s.doc_id) else {
			continue;
		};
		if info.binary {
			// Files with content go through the upload protocol.
			continue;
		}
		let Some((doctype, doc_id)) = shared_ref.doc_id.split_once('/') else {
			continue;
		};
		let Some(tree) = &shared_ref.revisions else {
			continue;
		};
		let chain = tree.winner_chain();
		let Some(tip) = chain.last().cloned() else {
			continue;
		};

		let mut out = if info.removed && !info.dissociated {
			// The document left the sharing: the peer deletes its copy.
			couch::tombstone(doc_id, &tip)
		} else {
			let fetched = instance
				.store
				.bulk_get(doctype, &[(doc_id.to_owned(), tip.clone())])
				.await?;
			match fetched.into_iter().next() {
				Some(doc) => doc,
				None => {
					warn!(target: "replicator", id = %shared_ref.doc_id, rev = %tip, "missing revision for bulk get");
					continue;
				}
			}
		};
		transform_doc_to_sent(doctype, &mut out, &creds.xor_key);
		out["_revisions"] = serde_json::to_value(RevsStruct::from_chain(&chain))
			.map_err(CouchError::Json)?;
		docs.entry(doctype.to_owned()).or_default().push(out);
	}

	if !docs.is_empty() {
		let token = creds.bearer().unwrap_or_default().to_owned();
		let result = peer.bulk_docs(member, &token, &s.doc_id, &docs).await;
		let result = match result {
			Err(SharingError::Unauthorized) => {
				let token = refresh_credentials(instance, peer, &s.doc_id, index).await?;
				peer.bulk_docs(member, &token, &s.doc_id, &docs).await
			}
			other => other,
		};
		if let Err(e) = result {
			if last_try {
				// Do not stall the whole sharing on one bad batch.
				update_last_seq(instance, &s.doc_id, member, "replicate", changes.last_seq)
					.await?;
			}
			return Err(e);
		}
		info!(target: "replicator", sharing = %s.doc_id, member = index, count = docs.values().map(Vec::len).sum::<usize>(), "batch replicated");
	}
	update_last_seq(instance, &s.doc_id, member, "replicate", changes.last_seq).await?;
	Ok(changes.pending > 0)
}

/// Maps a document to the peer's id space: the document id, and for files
/// the parent directory id.
pub fn transform_doc_to_sent(doctype: &str, doc: &mut Value, xor_key: &str) {
	let id = couch::doc_id(doc).to_owned();
	doc["_id"] = Value::String(xor_id(&id, xor_key));
	if doctype == FILES {
		if let Some(dir_id) = doc.get("dir_id").and_then(Value::as_str) {
			if dir_id != vfs::ROOT_DIR_ID && dir_id != vfs::TRASH_DIR_ID {
				let mapped = xor_id(dir_id, xor_key);
				doc["dir_id"] = Value::String(mapped);
			}
		}
	}
}

// ---------------------------------------------------------------------
// Receiving side.
// ---------------------------------------------------------------------

/// `POST /sharings/{id}/_bulk_docs`: applies a batch of replicated
/// revisions, idempotently.
pub async fn apply_bulk_docs(
	instance: &Arc<Instance>,
	sharing_id: &str,
	docs: &DocsByDoctype,
) -> Result<(), SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	if !s.active {
		return Err(SharingError::InvalidSharing);
	}
	for (doctype, docs) in docs {
		if !s.rules.iter().any(|r| &r.doctype == doctype && !r.local) {
			warn!(target: "replicator", sharing = %sharing_id, doctype = %doctype, "no rule covers the replicated doctype");
			continue;
		}
		if doctype == FILES {
			apply_bulk_files(instance, &s, docs).await?;
		} else {
			for doc in docs {
				apply_doc(instance, &s, doctype, doc).await?;
			}
		}
	}
	Ok(())
}

fn revisions_of(doc: &Value) -> Option<Vec<String>> {
	let revs: RevsStruct =
		serde_json::from_value(doc.get("_revisions")?.clone()).ok()?;
	let chain = revs.to_chain();
	(!chain.is_empty()).then_some(chain)
}

/// Applies one replicated document (not a file or directory).
async fn apply_doc(
	instance: &Arc<Instance>,
	s: &Sharing,
	doctype: &str,
	doc: &Value,
) -> Result<(), SharingError> {
	let id = couch::doc_id(doc).to_owned();
	let Some(mut chain) = revisions_of(doc) else {
		return Err(SharingError::BadState);
	};
	let deleted = couch::is_tombstone(doc);

	let _guard = instance
		.env
		.locks
		.write(&instance.domain, &format!("shared/{doctype}/{id}"))
		.await;

	match instance.store.get_with_revs(doctype, &id).await {
		Ok((current, _)) => {
			let local_tip = couch::doc_rev(&current).to_owned();
			if chain.last().map(String::as_str) == Some(local_tip.as_str()) {
				// Echo: we already hold this revision.
				return Ok(());
			}
			// Otherwise both branches are kept in the revision tree; the
			// winner is decided by the store, losers stay as conflict
			// branches.
		}
		Err(e) if e.is_deleted() => {
			// The peer resurrects a document we deleted: synthesize a
			// revision over the tombstone.
			let tip = chain.last().cloned().unwrap_or_default();
			let next = synthesize(couch::revision::generation(&tip) + 1, &tip);
			chain.push(next);
		}
		Err(e) if e.is_not_found() => {}
		Err(e) => return Err(e.into()),
	}

	let mut to_store = doc.clone();
	if let Some(obj) = to_store.as_object_mut() {
		obj.remove("_revisions");
		obj.insert(
			"_rev".to_owned(),
			Value::String(chain.last().cloned().unwrap_or_default()),
		);
	}
	instance.store.force_put(doctype, to_store, &chain).await?;

	let mut shared_ref = shared::get_shared_ref(instance.store.as_ref(), doctype, &id)
		.await?
		.unwrap_or_else(|| SharedRef::new(doctype, &id));
	shared_ref.merge_chain(&chain);
	let rule_index = s
		.rules
		.iter()
		.position(|r| r.accept(doctype, doc))
		.unwrap_or(0);
	let previous = shared_ref
		.infos
		.get(&s.doc_id)
		.cloned()
		.unwrap_or(SharedInfo {
			rule: rule_index,
			..Default::default()
		});
	shared_ref.infos.insert(
		s.doc_id.clone(),
		SharedInfo {
			removed: deleted,
			..previous
		},
	);
	shared_ref
		.save(instance.store.as_ref(), &instance.realtime)
		.await?;
	Ok(())
}

/// Applies the directory documents and deletions of a files batch. File
/// metadata and contents travel through the upload protocol.
async fn apply_bulk_files(
	instance: &Arc<Instance>,
	s: &Sharing,
	docs: &[Value],
) -> Result<(), SharingError> {
	// Parents first: the sender's path still orders ancestors before
	// descendants.
	let mut dirs: Vec<&Value> = docs
		.iter()
		.filter(|d| {
			d.get("type").and_then(Value::as_str) == Some("directory")
				&& !couch::is_tombstone(d)
		})
		.collect();
	dirs.sort_by_key(|d| {
		d.get("path")
			.and_then(Value::as_str)
			.map(str::len)
			.unwrap_or(usize::MAX)
	});
	for doc in dirs {
		if let Err(e) = apply_dir(instance, s, doc).await {
			warn!(target: "replicator", sharing = %s.doc_id, "cannot apply directory: {e}");
		}
	}
	for doc in docs.iter().filter(|d| couch::is_tombstone(d)) {
		if let Err(e) = apply_files_deletion(instance, s, doc).await {
			warn!(target: "replicator", sharing = %s.doc_id, "cannot apply deletion: {e}");
		}
	}
	Ok(())
}

/// Finds the local parent for a replicated node, falling back to the
/// sharing directory and recreating a placeholder when the parent is not
/// known yet.
pub(super) async fn resolve_parent(
	instance: &Arc<Instance>,
	s: &Sharing,
	dir_id: &str,
) -> Result<DirDoc, SharingError> {
	let fs = instance.vfs();
	if dir_id.is_empty() {
		return s.get_sharing_dir(instance).await;
	}
	match fs.dir_by_id(dir_id).await {
		Ok(dir) => Ok(dir),
		Err(e) if e.is_not_found() => {
			let parent = s.get_sharing_dir(instance).await?;
			let name = trash::conflict_free_name(
				fs.indexer().as_ref(),
				&parent.doc_id,
				&dir_id[..8.min(dir_id.len())],
			)
			.await?;
			let mut dir = DirDoc::new_with_parent(&name, &parent)?;
			dir.doc_id = dir_id.to_owned();
			fs.create_dir(&mut dir).await?;
			debug!(target: "replicator", id = %dir_id, "recreated missing parent");
			Ok(dir)
		}
		Err(e) => Err(e.into()),
	}
}

async fn apply_dir(
	instance: &Arc<Instance>,
	s: &Sharing,
	doc: &Value,
) -> Result<(), SharingError> {
	let id = couch::doc_id(doc).to_owned();
	let Some(chain) = revisions_of(doc) else {
		return Err(SharingError::BadState);
	};
	let tip = chain.last().cloned().unwrap_or_default();
	let name = doc
		.get("name")
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_owned();
	let dir_id = doc
		.get("dir_id")
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_owned();

	let _guard = instance
		.env
		.locks
		.write(&instance.domain, &format!("shared/{FILES}/{id}"))
		.await;

	// The root of a files rule keeps its local name and position: each
	// side places the shared directory where it wants.
	if s.rules
		.iter()
		.any(|r| r.is_files() && r.values.contains(&id))
	{
		let mut shared_ref = shared::get_shared_ref(instance.store.as_ref(), FILES, &id)
			.await?
			.unwrap_or_else(|| SharedRef::new(FILES, &id));
		if !shared_ref.rev_known(&tip) || !shared_ref.infos.contains_key(&s.doc_id) {
			shared_ref.merge_chain(&chain);
			shared_ref.infos.entry(s.doc_id.clone()).or_insert(SharedInfo {
				rule: s.first_files_rule().map(|(i, _)| i).unwrap_or(0),
				..Default::default()
			});
			shared_ref
				.save(instance.store.as_ref(), &instance.realtime)
				.await?;
		}
		return Ok(());
	}

	let mut shared_ref = shared::get_shared_ref(instance.store.as_ref(), FILES, &id).await?;
	if let Some(r) = &shared_ref {
		if let Some(info) = r.infos.get(&s.doc_id) {
			if info.removed && !info.dissociated {
				return Err(SharingError::Safety);
			}
		}
		if r.rev_known(&tip) {
			return Ok(());
		}
	}

	let fs = instance.vfs();
	let base = CouchIndexer::new(instance.store.clone(), instance.realtime.clone());
	let rule_index = s
		.rules
		.iter()
		.position(|r| r.accept(FILES, doc))
		.or_else(|| s.first_files_rule().map(|(i, _)| i))
		.unwrap_or(0);
	let mut new_ref = shared_ref
		.take()
		.unwrap_or_else(|| SharedRef::new(FILES, &id));
	new_ref.infos.entry(s.doc_id.clone()).or_insert(SharedInfo {
		rule: rule_index,
		..Default::default()
	});

	let indexer = SharingIndexer::new(
		base,
		Some(BulkRevs {
			rev: tip.clone(),
			revisions: RevsStruct::from_chain(&chain),
		}),
		Some(new_ref),
	);
	let forced = fs.with_indexer(indexer.clone());

	match fs.dir_by_id(&id).await {
		Err(e) if e.is_not_found() => {
			let parent = resolve_parent(instance, s, &dir_id).await?;
			let mut dir = DirDoc::new_with_parent(&name, &parent)?;
			dir.doc_id = id.clone();
			match forced.create_dir(&mut dir).await {
				Err(e) if e.is_exists() => {
					let free = trash::conflict_free_name(
						fs.indexer().as_ref(),
						&parent.doc_id,
						&name,
					)
					.await?;
					indexer.increment_revision().await;
					let mut dir = DirDoc::new_with_parent(&free, &parent)?;
					dir.doc_id = id.clone();
					forced.create_dir(&mut dir).await?;
				}
				other => other?,
			}
		}
		Ok(local) => {
			match detect_conflict(&local.doc_rev, &chain) {
				Conflict::Lost => return Ok(()),
				Conflict::Won | Conflict::None => {}
			}
			let parent = resolve_parent(instance, s, &dir_id).await?;
			let mut newdoc = local.clone();
			newdoc.name = name.clone();
			newdoc.dir_id = parent.doc_id.clone();
			newdoc.fullpath = vfs::join_path(&parent.fullpath, &name);
			if let Some(tags) = doc.get("tags").and_then(Value::as_array) {
				newdoc.tags = tags
					.iter()
					.filter_map(Value::as_str)
					.map(str::to_owned)
					.collect();
			}
			match forced.update_dir_doc(&local, &mut newdoc).await {
				Err(e) if e.is_exists() => {
					let free = trash::conflict_free_name(
						fs.indexer().as_ref(),
						&parent.doc_id,
						&name,
					)
					.await?;
					indexer.increment_revision().await;
					newdoc.name = free.clone();
					newdoc.fullpath = vfs::join_path(&parent.fullpath, &free);
					forced.update_dir_doc(&local, &mut newdoc).await?;
				}
				other => other?,
			}
		}
		Err(e) => return Err(e.into()),
	}
	Ok(())
}

/// A replicated deletion of a file or directory: the local copy goes to
/// the trash.
async fn apply_files_deletion(
	instance: &Arc<Instance>,
	s: &Sharing,
	doc: &Value,
) -> Result<(), SharingError> {
	let id = couch::doc_id(doc);
	let fs = instance.vfs();
	let _guard = instance
		.env
		.locks
		.write(&instance.domain, &format!("shared/{FILES}/{id}"))
		.await;
	let Some(mut shared_ref) = shared::get_shared_ref(instance.store.as_ref(), FILES, id).await?
	else {
		return Ok(());
	};
	let Some(info) = shared_ref.infos.get(&s.doc_id) else {
		return Ok(());
	};
	if info.removed && !info.dissociated {
		return Ok(());
	}
	match fs.dir_or_file_by_id(id).await {
		Ok(vfs::DirOrFile::File(file)) if !file.trashed => {
			trash::trash_file(fs.as_ref(), &file).await?;
		}
		Ok(vfs::DirOrFile::Dir(dir)) if !dir.is_trashed() => {
			trash::trash_dir(fs.as_ref(), &dir).await?;
		}
		Ok(_) => {}
		Err(e) if e.is_not_found() => {}
		Err(e) => return Err(e.into()),
	}
	if let Some(info) = shared_ref.infos.get_mut(&s.doc_id) {
		info.removed = true;
	}
	if let Some(chain) = revisions_of(doc) {
		shared_ref.merge_chain(&chain);
	}
	shared_ref
		.save(instance.store.as_ref(), &instance.realtime)
		.await?;
	Ok(())
}
