//! Two-phase file synchronization: metadata first, then (when the peer
//! lacks the content) the binary itself.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::{
	couch::{
		self,
		revision::{body, detect_conflict, Conflict, RevsStruct},
		ChangesRequest, CouchError, Store, FILES, SHARED,
	},
	instance::Instance,
	job::JobCtx,
	realtime::Verb,
	vfs::{
		indexer::{BulkRevs, CouchIndexer, SharingIndexer},
		FileDoc, FileHandle, Vfs,
	},
};

use super::{
	find_sharing,
	member::xor_id,
	refresh_credentials,
	replicator::{self, resolve_parent},
	shared::{self, SharedInfo, SharedRef},
	PeerClient, Rule, Sharing, SharingError,
};

/// The message carried by upload jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMsg {
	pub sharing_id: String,
}

/// The payload of the phase-1 metadata probe: a file document with its
/// revision chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDocWithRevisions {
	#[serde(flatten)]
	pub file: FileDoc,
	#[serde(rename = "_revisions")]
	pub revisions: RevsStruct,
}

impl FileDocWithRevisions {
	pub fn chain(&self) -> Vec<String> {
		self.revisions.to_chain()
	}
}

/// The key returned by the phase-1 probe when the content is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyToUpload {
	pub key: String,
}

/// Pending upload metadata, held between the two phases.
#[derive(Default)]
pub struct UploadKeyStore {
	entries: Mutex<HashMap<String, (String, FileDocWithRevisions)>>,
}

impl UploadKeyStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn save(&self, domain: &str, doc: FileDocWithRevisions) -> String {
		let key = super::member::random_token();
		self.entries
			.lock()
			.expect("upload key store poisoned")
			.insert(key.clone(), (domain.to_owned(), doc));
		key
	}

	pub fn get(&self, domain: &str, key: &str) -> Option<FileDocWithRevisions> {
		let mut entries = self.entries.lock().expect("upload key store poisoned");
		match entries.get(key) {
			Some((owner, _)) if owner == domain => entries.remove(key).map(|(_, doc)| doc),
			_ => None,
		}
	}
}

/// The `share-upload` worker.
pub async fn worker_upload(ctx: JobCtx, peer: Arc<dyn PeerClient>) -> Result<(), crate::Error> {
	let msg: UploadMsg = serde_json::from_value(ctx.message.clone()).map_err(CouchError::Json)?;
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
	let last_try = ctx.attempt >= instance.env.config.max_retries;
	upload(&instance, &s, peer.as_ref(), last_try).await?;
	Ok(())
}

/// Uploads the pending files of a sharing to its peers.
pub async fn upload(
	instance: &Arc<Instance>,
	s: &Sharing,
	peer: &dyn PeerClient,
	last_try: bool,
) -> Result<(), SharingError> {
	let _guard = instance
		.env
		.locks
		.write(&instance.domain, &format!("sharings/{}/upload", s.doc_id))
		.await;
	for index in s.targets() {
		loop {
			let more = upload_to(instance, s, peer, index, last_try).await?;
			if !more {
				break;
			}
		}
	}
	Ok(())
}

/// Uploads one file to one member. Returns `false` when there is nothing
/// more to upload to this member currently.
async fn upload_to(
	instance: &Arc<Instance>,
	s: &Sharing,
	peer: &dyn PeerClient,
	index: usize,
	last_try: bool,
) -> Result<bool, SharingError> {
	let member = s.members.get(index).ok_or(SharingError::MemberNotFound)?;
	let since = replicator::get_last_seq(instance, &s.doc_id, member, "upload").await?;
	debug!(target: "upload", sharing = %s.doc_id, member = index, since, "looking for a file to upload");

	let next = find_next_file_to_upload(instance, s, since).await?;
	let Some((file, chain, rule_index)) = next.found else {
		if next.seq != since {
			replicator::update_last_seq(instance, &s.doc_id, member, "upload", next.seq).await?;
		}
		return Ok(false);
	};

	if let Err(e) = upload_file(instance, s, peer, index, file, chain, rule_index).await {
		if last_try {
			// Do not stall the whole sharing on one bad file.
			replicator::update_last_seq(instance, &s.doc_id, member, "upload", next.seq).await?;
		}
		return Err(e);
	}
	replicator::update_last_seq(instance, &s.doc_id, member, "upload", next.seq).await?;
	Ok(true)
}

struct NextFile {
	found: Option<(Value, Vec<String>, usize)>,
	seq: u64,
}

/// Walks the changes feed of the shared index for the next file whose
/// binary must be sent.
async fn find_next_file_to_upload(
	instance: &Arc<Instance>,
	s: &Sharing,
	mut since: u64,
) -> Result<NextFile, SharingError> {
	loop {
		let changes = instance
			.store
			.changes(&ChangesRequest {
				doctype: SHARED.to_owned(),
				since,
				limit: 1,
				include_docs: true,
			})
			.await?;
		since = changes.last_seq;
		let Some(change) = changes.results.into_iter().next() else {
			return Ok(NextFile { found: None, seq: since });
		};
		let Some(doc) = change.doc else { continue };
		let shared_ref: SharedRef = match couch::from_value(doc) {
			Ok(r) => r,
			Err(_) => continue,
		};
		let Some(info) = shared_ref.infos.get(&s.doc_id) else {
			continue;
		};
		if !info.binary || info.removed {
			continue;
		}
		let Some(tree) = &shared_ref.revisions else {
			continue;
		};
		let chain = tree.winner_chain();
		let Some(tip) = chain.last().cloned() else {
			continue;
		};
		let doc_id = shared_ref.target_id().to_owned();
		let results = instance
			.store
			.bulk_get(FILES, &[(doc_id.clone(), tip.clone())])
			.await?;
		let Some(file) = results.into_iter().next() else {
			warn!(target: "upload", id = %doc_id, rev = %tip, "missing revision for bulk get, skipping");
			return Ok(NextFile { found: None, seq: since });
		};
		if couch::is_tombstone(&file) {
			// Deletions are synchronized by the replicator.
			continue;
		}
		return Ok(NextFile {
			found: Some((file, chain, info.rule)),
			seq: since,
		});
	}
}

/// Sends one file to one member: first the metadata, then the binary when
/// the peer asks for it.
async fn upload_file(
	instance: &Arc<Instance>,
	s: &Sharing,
	peer: &dyn PeerClient,
	index: usize,
	file: Value,
	chain: Vec<String>,
	_rule_index: usize,
) -> Result<(), SharingError> {
	// A trashed file is synchronized through the replication protocol.
	if file.get("trashed").and_then(Value::as_bool).unwrap_or(false) {
		return Ok(());
	}
	let member = s.members.get(index).ok_or(SharingError::MemberNotFound)?;
	let creds = s
		.credentials_for(index)
		.ok_or(SharingError::InvalidSharing)?;
	let orig_id = couch::doc_id(&file).to_owned();

	let mut sent = file;
	replicator::transform_doc_to_sent(FILES, &mut sent, &creds.xor_key);
	let mut filedoc: FileDoc = couch::from_value(sent)?;
	filedoc.doc_rev = chain.last().cloned().unwrap_or_default();
	let payload = FileDocWithRevisions {
		file: filedoc,
		revisions: RevsStruct::from_chain(&chain),
	};

	let token = creds.bearer().unwrap_or_default().to_owned();
	let result = peer.sync_file(member, &token, &s.doc_id, &payload).await;
	let key = match result {
		Err(SharingError::Unauthorized) => {
			let token = refresh_credentials(instance, peer, &s.doc_id, index).await?;
			peer.sync_file(member, &token, &s.doc_id, &payload).await?
		}
		other => other?,
	};
	let Some(key) = key else {
		debug!(target: "upload", id = %orig_id, "metadata was enough");
		return Ok(());
	};

	let fs = instance.vfs();
	let local = fs.file_by_id(&orig_id).await?;
	let mut reader = fs.open_file(&local).await?;
	let mut content = Vec::with_capacity(local.byte_size as usize);
	reader
		.read_to_end(&mut content)
		.await
		.map_err(|e| SharingError::Request(e.to_string()))?;
	info!(target: "upload", id = %orig_id, size = content.len(), "sending binary");
	peer.send_file(member, &token, &s.doc_id, &key.key, &local.mime, content)
		.await
}

// ---------------------------------------------------------------------
// Receiving side.
// ---------------------------------------------------------------------

fn find_rule_for_new_file<'a>(s: &'a Sharing, file: &FileDoc) -> Option<(usize, &'a Rule)> {
	let value = couch::to_value(file).ok()?;
	s.rules
		.iter()
		.enumerate()
		.find(|(_, r)| r.accept(FILES, &value))
}

/// A conflict copy keeps the loser under a new, derived identity.
pub fn conflict_id(id: &str, rev: &str) -> String {
	format!("{id}-{}", body(rev))
}

/// The stable name of a conflict copy: `<name> (conflict <timestamp>)<ext>`.
pub fn conflict_name(name: &str) -> String {
	let stamp = Utc::now().format("%Y-%m-%dT%H_%M_%S");
	match name.rsplit_once('.') {
		Some((base, ext)) if !base.is_empty() => format!("{base} (conflict {stamp}).{ext}"),
		_ => format!("{name} (conflict {stamp})"),
	}
}

/// `PUT /sharings/{id}/io.cozy.files/{xored-id}/metadata`: phase 1.
/// Returns a key when the binary must be sent too.
pub async fn handle_sync_file(
	instance: &Arc<Instance>,
	sharing_id: &str,
	target: &FileDocWithRevisions,
) -> Result<Option<KeyToUpload>, SharingError> {
	debug!(target: "upload", id = %target.file.doc_id, "sync file");
	if target.file.md5sum.is_empty() {
		return Err(crate::vfs::VfsError::InvalidHash.into());
	}
	let s = find_sharing(instance, sharing_id).await?;
	if !s.active {
		return Err(SharingError::InvalidSharing);
	}
	let file_id = target.file.doc_id.clone();
	let _guard = instance
		.env
		.locks
		.write(&instance.domain, &format!("shared/{FILES}/{file_id}"))
		.await;

	let fs = instance.vfs();
	let current = match fs.file_by_id(&file_id).await {
		Ok(current) => current,
		Err(e) if e.is_not_found() => {
			if find_rule_for_new_file(&s, &target.file).is_none() {
				return Err(SharingError::Safety);
			}
			let key = instance
				.env
				.upload_keys
				.save(&instance.domain, target.clone());
			return Ok(Some(KeyToUpload { key }));
		}
		Err(e) => return Err(e.into()),
	};

	let Some(shared_ref) =
		shared::get_shared_ref(instance.store.as_ref(), FILES, &file_id).await?
	else {
		return Err(SharingError::Safety);
	};
	match shared_ref.infos.get(sharing_id) {
		None => return Err(SharingError::Safety),
		Some(info) if info.removed && !info.dissociated => return Err(SharingError::Safety),
		Some(_) => {}
	}
	if shared_ref.rev_known(&target.file.doc_rev) {
		// Just the echo, there is nothing to do.
		return Ok(None);
	}
	if target.file.md5sum != current.md5sum {
		let key = instance
			.env
			.upload_keys
			.save(&instance.domain, target.clone());
		return Ok(Some(KeyToUpload { key }));
	}
	update_file_metadata(instance, &s, target, &current, shared_ref).await?;
	Ok(None)
}

/// Applies a metadata-only change (rename, move, tags).
async fn update_file_metadata(
	instance: &Arc<Instance>,
	s: &Sharing,
	target: &FileDocWithRevisions,
	current: &FileDoc,
	shared_ref: SharedRef,
) -> Result<(), SharingError> {
	let chain = target.chain();
	match detect_conflict(&current.doc_rev, &chain) {
		Conflict::Lost => return Ok(()),
		Conflict::Won | Conflict::None => {}
	}

	let base = CouchIndexer::new(instance.store.clone(), instance.realtime.clone());
	let indexer = SharingIndexer::new(
		base,
		Some(BulkRevs {
			rev: target.file.doc_rev.clone(),
			revisions: target.revisions.clone(),
		}),
		Some(shared_ref),
	);
	let fs = instance.vfs().with_indexer(indexer.clone());

	let mut newdoc = current.clone();
	newdoc.name = target.file.name.clone();
	copy_safe_fields(&target.file, &mut newdoc);
	if target.file.dir_id != current.dir_id {
		let parent = resolve_parent(instance, s, &target.file.dir_id).await?;
		newdoc.dir_id = parent.doc_id;
	}

	match fs.update_file_doc(current, &mut newdoc).await {
		Err(e) if e.is_exists() => {
			let name = conflict_name(&newdoc.name);
			indexer.increment_revision().await;
			newdoc.name = name;
			fs.update_file_doc(current, &mut newdoc).await?;
		}
		other => other?,
	}
	Ok(())
}

/// Fields of a replicated file document that are safe to copy as-is.
fn copy_safe_fields(target: &FileDoc, newdoc: &mut FileDoc) {
	newdoc.tags = target.tags.clone();
	newdoc.created_at = target.created_at;
	newdoc.updated_at = target.updated_at;
	newdoc.executable = target.executable;
	newdoc.mime = target.mime.clone();
	newdoc.class = target.class.clone();
	newdoc.metadata = target.metadata.clone();
}

/// `PUT /sharings/{id}/io.cozy.files/{key}`: phase 2, the binary.
pub async fn handle_file_upload(
	instance: &Arc<Instance>,
	sharing_id: &str,
	key: &str,
	content: Vec<u8>,
) -> Result<(), SharingError> {
	let Some(target) = instance.env.upload_keys.get(&instance.domain, key) else {
		return Err(SharingError::MissingFileMetadata);
	};
	let s = find_sharing(instance, sharing_id).await?;
	if !s.active {
		return Err(SharingError::InvalidSharing);
	}
	debug!(target: "upload", id = %target.file.doc_id, size = content.len(), "receiving binary");
	let file_id = target.file.doc_id.clone();
	let _guard = instance
		.env
		.locks
		.write(&instance.domain, &format!("shared/{FILES}/{file_id}"))
		.await;

	let fs = instance.vfs();
	match fs.file_by_id(&file_id).await {
		Ok(current) => upload_existing_file(instance, &s, &target, current, content).await,
		Err(e) if e.is_not_found() => upload_new_file(instance, &s, &target, content).await,
		Err(e) => Err(e.into()),
	}
}

/// Receives the content of a file we do not have yet.
async fn upload_new_file(
	instance: &Arc<Instance>,
	s: &Sharing,
	target: &FileDocWithRevisions,
	content: Vec<u8>,
) -> Result<(), SharingError> {
	let Some((rule_index, rule)) = find_rule_for_new_file(s, &target.file) else {
		return Err(SharingError::Safety);
	};
	let file_id = &target.file.doc_id;

	let mut shared_ref = SharedRef::new(FILES, file_id);
	shared_ref.infos.insert(
		s.doc_id.clone(),
		SharedInfo {
			rule: rule_index,
			binary: true,
			removed: false,
			dissociated: false,
		},
	);

	let base = CouchIndexer::new(instance.store.clone(), instance.realtime.clone());
	let indexer = SharingIndexer::new(
		base,
		Some(BulkRevs {
			rev: target.file.doc_rev.clone(),
			revisions: target.revisions.clone(),
		}),
		Some(shared_ref),
	);
	let fs = instance.vfs().with_indexer(indexer.clone());

	let parent = if !target.file.dir_id.is_empty() {
		resolve_parent(instance, s, &target.file.dir_id).await?
	} else if rule.values.first() == Some(file_id) {
		// The file itself is the root of the sharing.
		crate::vfs::trash::mkdir_all(fs.as_ref(), super::SHARED_WITH_ME_DIR).await?
	} else {
		s.get_sharing_dir(instance).await?
	};

	// The store may still remember a deletion of this id: synthesize a
	// revision over the tombstone so the recreation wins.
	if let Err(e) = instance.store.get(FILES, file_id).await {
		if e.is_deleted() {
			indexer.increment_revision().await;
		}
	}

	let mut newdoc = FileDoc::new(
		&target.file.name,
		&parent.doc_id,
		target.file.byte_size,
		target.file.md5sum.clone(),
		target.file.mime.clone(),
		target.file.class.clone(),
		target.file.executable,
	)?;
	newdoc.doc_id = file_id.clone();
	copy_safe_fields(&target.file, &mut newdoc);

	let handle = match fs.create_file(newdoc.clone(), None).await {
		Err(e) if e.is_exists() => {
			let name = conflict_name(&newdoc.name);
			indexer.increment_revision().await;
			newdoc.name = name;
			fs.create_file(newdoc, None).await?
		}
		other => other?,
	};
	write_all(handle, &content).await?;
	if s.nb_files > 0 {
		count_received_files(instance, s).await;
	}
	Ok(())
}

async fn write_all(
	mut handle: Box<dyn crate::vfs::FileHandle>,
	content: &[u8],
) -> Result<FileDoc, SharingError> {
	if let Err(e) = handle.write(content).await {
		let _ = handle.abort().await;
		return Err(e.into());
	}
	Ok(handle.close().await?)
}

/// Tracks the initial-sync progress on a recipient and finalizes it when
/// every expected file arrived.
async fn count_received_files(instance: &Arc<Instance>, s: &Sharing) {
	let count = match shared::count_binaries(instance.store.as_ref(), &s.doc_id).await {
		Ok(count) => count,
		Err(e) => {
			warn!(target: "upload", sharing = %s.doc_id, "cannot count received files: {e}");
			return;
		}
	};
	if count >= s.nb_files {
		if let Err(e) = s.end_initial(instance).await {
			warn!(target: "upload", sharing = %s.doc_id, "cannot end the initial sync: {e}");
		}
		return;
	}
	instance.realtime.publish(
		Verb::Updated,
		couch::SHARINGS_INITIAL_SYNC,
		&s.doc_id,
		serde_json::json!({"_id": s.doc_id, "count": count}),
		None,
	);
}

/// Receives new content for an existing file.
///
/// When both the content and the path changed, the content is updated in
/// the old path first, then the file is renamed: a conflict on name and
/// directory is resolved by the higher revision, while a conflict on
/// content would duplicate the file.
async fn upload_existing_file(
	instance: &Arc<Instance>,
	s: &Sharing,
	target: &FileDocWithRevisions,
	current: FileDoc,
	content: Vec<u8>,
) -> Result<(), SharingError> {
	let Some(shared_ref) =
		shared::get_shared_ref(instance.store.as_ref(), FILES, &current.doc_id).await?
	else {
		return Err(SharingError::Safety);
	};
	match shared_ref.infos.get(&s.doc_id) {
		None => return Err(SharingError::Safety),
		Some(info) if info.removed && !info.dissociated => return Err(SharingError::Safety),
		Some(_) => {}
	}

	let base = CouchIndexer::new(instance.store.clone(), instance.realtime.clone());
	let indexer = SharingIndexer::new(
		base,
		Some(BulkRevs {
			rev: target.file.doc_rev.clone(),
			revisions: target.revisions.clone(),
		}),
		Some(shared_ref),
	);
	let fs = instance.vfs().with_indexer(indexer.clone());
	let olddoc = current.clone();

	let mut newdoc = current.clone();
	newdoc.name = target.file.name.clone();
	copy_safe_fields(&target.file, &mut newdoc);
	if target.file.dir_id != olddoc.dir_id {
		let parent = resolve_parent(instance, s, &target.file.dir_id).await?;
		newdoc.dir_id = parent.doc_id;
	}
	newdoc.byte_size = target.file.byte_size;
	newdoc.md5sum = target.file.md5sum.clone();

	let chain = target.chain();
	match detect_conflict(&olddoc.doc_rev, &chain) {
		Conflict::Lost => {
			return upload_lost_conflict(instance, target, content).await;
		}
		Conflict::Won => {
			upload_won_conflict(instance, &olddoc).await?;
		}
		Conflict::None => {}
	}
	indexer.will_resolve_conflict(&chain).await;

	// Easy case: only the content changed, not the path.
	if newdoc.name == olddoc.name && newdoc.dir_id == olddoc.dir_id {
		let handle = fs.create_file(newdoc, Some(olddoc)).await?;
		write_all(handle, &content).await?;
		return Ok(());
	}

	let stash = indexer.stash_revision().await;
	let mut tmpdoc = newdoc.clone();
	tmpdoc.name = olddoc.name.clone();
	tmpdoc.dir_id = olddoc.dir_id.clone();
	let handle = fs.create_file(tmpdoc, Some(olddoc)).await?;
	let tmpdoc = write_all(handle, &content).await?;

	indexer.unstash_revision(stash).await;
	newdoc.doc_rev = tmpdoc.doc_rev.clone();
	newdoc.internal_id = tmpdoc.internal_id.clone();
	match fs.update_file_doc(&tmpdoc, &mut newdoc).await {
		Err(e) if e.is_exists() => {
			let name = conflict_name(&newdoc.name);
			indexer.increment_revision().await;
			newdoc.name = name;
			fs.update_file_doc(&tmpdoc, &mut newdoc).await?;
		}
		other => other?,
	}
	Ok(())
}

/// The uploaded version lost the conflict: it lands in a fresh file, the
/// current one is left untouched.
async fn upload_lost_conflict(
	instance: &Arc<Instance>,
	target: &FileDocWithRevisions,
	content: Vec<u8>,
) -> Result<(), SharingError> {
	let rev = &target.file.doc_rev;
	let base = CouchIndexer::new(instance.store.clone(), instance.realtime.clone());
	let indexer = SharingIndexer::new(
		base,
		Some(BulkRevs {
			rev: rev.clone(),
			revisions: RevsStruct::from_chain(&[rev.clone()]),
		}),
		None,
	);
	let fs = instance.vfs().with_indexer(indexer);

	let mut newdoc = target.file.clone();
	newdoc.doc_id = conflict_id(&target.file.doc_id, rev);
	match fs.file_by_id(&newdoc.doc_id).await {
		Ok(_) => return Ok(()),
		Err(e) if e.is_not_found() => {}
		Err(e) => return Err(e.into()),
	}
	newdoc.name = conflict_name(&newdoc.name);
	newdoc.doc_rev = String::new();
	newdoc.internal_id = String::new();
	debug!(target: "upload", id = %newdoc.doc_id, "conflict loser saved aside");
	let handle = fs.create_file(newdoc, None).await?;
	write_all(handle, &content).await?;
	Ok(())
}

/// The uploaded version won the conflict: the current local content is
/// copied aside before being overwritten.
async fn upload_won_conflict(
	instance: &Arc<Instance>,
	src: &FileDoc,
) -> Result<(), SharingError> {
	let rev = &src.doc_rev;
	let base = CouchIndexer::new(instance.store.clone(), instance.realtime.clone());
	let indexer = SharingIndexer::new(
		base,
		Some(BulkRevs {
			rev: rev.clone(),
			revisions: RevsStruct::from_chain(&[rev.clone()]),
		}),
		None,
	);
	let fs = instance.vfs().with_indexer(indexer);

	let mut dst = src.clone();
	dst.doc_id = conflict_id(&src.doc_id, rev);
	match fs.file_by_id(&dst.doc_id).await {
		Ok(_) => return Ok(()),
		Err(e) if e.is_not_found() => {}
		Err(e) => return Err(e.into()),
	}
	dst.name = conflict_name(&dst.name);
	dst.doc_rev = String::new();
	dst.internal_id = String::new();
	dst.referenced_by = Vec::new();

	let mut reader = instance.vfs().open_file(src).await?;
	let mut content = Vec::with_capacity(src.byte_size as usize);
	reader
		.read_to_end(&mut content)
		.await
		.map_err(|e| SharingError::Request(e.to_string()))?;
	debug!(target: "upload", id = %dst.doc_id, "conflict winner preserved aside");
	let handle = fs.create_file(dst, None).await?;
	write_all(handle, &content).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn conflict_naming() {
		let name = conflict_name("hello.txt");
		assert!(name.starts_with("hello (conflict "));
		assert!(name.ends_with(".txt"));
		let name = conflict_name("no-extension");
		assert!(name.starts_with("no-extension (conflict "));
	}

	#[test]
	fn conflict_ids_derive_from_the_revision()	{
		assert_eq!(conflict_id("abc123", "3-deadbeef"), "abc123-deadbeef");
	}
}
