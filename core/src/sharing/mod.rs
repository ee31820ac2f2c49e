//! Sharing of documents and files between instances.
//!
//! A sharing links an owner instance with one or more recipients. Local
//! changes are tracked into the shared index, replicated through the
//! changes feed and, for file contents, uploaded with the two-phase
//! protocol. See the `replicator` and `upload` submodules for the data
//! plane; this module owns the lifecycle (create, invite, accept,
//! revoke) and the per-sharing triggers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
	couch::{self, impl_doc, CouchError, Selector, Store, FILES, SHARINGS},
	instance::Instance,
	job::{JobError, WorkerConfig, WorkerFunc},
	vfs::{self, trash, DirDoc, DocRef, Vfs, VfsError},
};

pub mod member;
pub mod replicator;
pub mod rule;
pub mod shared;
pub mod transport;
pub mod upload;

pub use member::{AccessToken, Credentials, Member, MemberStatus, OAuthClient};
pub use rule::Rule;
pub use shared::{SharedInfo, SharedRef};
pub use transport::{
	AnswerRequest, AnswerResponse, DocsByDoctype, HttpPeerClient, LocalPeerClient, PeerClient,
	SharingRequest,
};

/// Where the sharings received from other instances land.
pub const SHARED_WITH_ME_DIR: &str = "/Shared with me";

/// Worker types of the sharing engine.
pub const TRACK_WORKER: &str = "share-track";
pub const REPLICATE_WORKER: &str = "share-replicate";
pub const UPLOAD_WORKER: &str = "share-upload";

#[derive(Debug, Error)]
pub enum SharingError {
	#[error("sharing not found")]
	NotFound,
	#[error("the sharing is invalid")]
	InvalidSharing,
	#[error("the sharing rules are invalid")]
	InvalidRules,
	#[error("the sharing was already accepted")]
	AlreadyAccepted,
	#[error("a sharing needs at least one recipient")]
	NoRecipients,
	#[error("member not found")]
	MemberNotFound,
	#[error("no metadata was stored for this upload key")]
	MissingFileMetadata,
	#[error("the operation is not allowed for safety reasons")]
	Safety,
	#[error("the sharing is not in the expected state")]
	BadState,
	#[error("invalid instance URL")]
	InvalidUrl,
	#[error("the peer rejected the credentials")]
	Unauthorized,
	#[error("the peer refused the operation")]
	Forbidden,
	#[error("the peer answered with an error: {status}")]
	RequestFailed { status: u16 },
	#[error("the peer had an internal error")]
	InternalServerError,
	#[error("request error: {0}")]
	Request(String),
	#[error(transparent)]
	Couch(#[from] CouchError),
	#[error(transparent)]
	Vfs(#[from] VfsError),
	#[error(transparent)]
	Job(#[from] JobError),
}

/// The ids of the triggers installed for an active sharing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Triggers {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub track_ids: Vec<String>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub replicate_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub upload_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sharing {
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	pub doc_id: String,
	#[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
	pub doc_rev: String,
	#[serde(default)]
	pub triggers: Triggers,
	#[serde(default)]
	pub active: bool,
	#[serde(default)]
	pub owner: bool,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub description: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub app_slug: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub preview_path: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	/// How many files the initial sync will bring, on a recipient.
	#[serde(
		rename = "initial_number_of_files_to_sync",
		default,
		skip_serializing_if = "is_zero"
	)]
	pub nb_files: usize,
	#[serde(rename = "initial_sync", default, skip_serializing_if = "std::ops::Not::not")]
	pub initial: bool,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub shortcut_id: String,
	pub rules: Vec<Rule>,
	/// `members[0]` is the owner.
	pub members: Vec<Member>,
	/// On the owner, `credentials[i]` pairs with `members[i+1]`; on a
	/// recipient there is only one entry, for the owner.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub credentials: Vec<Credentials>,
}

fn is_zero(n: &usize) -> bool {
	*n == 0
}

impl_doc!(Sharing, SHARINGS);

impl Sharing {
	pub fn new(description: impl Into<String>, rules: Vec<Rule>) -> Self {
		let now = Utc::now();
		Self {
			doc_id: String::new(),
			doc_rev: String::new(),
			triggers: Triggers::default(),
			active: false,
			owner: false,
			description: description.into(),
			app_slug: String::new(),
			preview_path: String::new(),
			created_at: now,
			updated_at: now,
			nb_files: 0,
			initial: false,
			shortcut_id: String::new(),
			rules,
			members: Vec::new(),
			credentials: Vec::new(),
		}
	}

	/// Initializes the sharing on the instance of its owner.
	pub fn be_owner(&mut self, instance: &Instance, slug: &str) {
		self.active = true;
		self.owner = true;
		if self.app_slug.is_empty() {
			self.app_slug = slug.to_owned();
		}
		if self.app_slug.is_empty() {
			self.preview_path = String::new();
		}
		self.created_at = Utc::now();
		self.updated_at = self.created_at;
		self.members = vec![Member {
			status: MemberStatus::Owner,
			name: instance.settings.public_name.clone(),
			email: instance.settings.email.clone(),
			instance: instance.url.clone(),
			read_only: false,
			public_key: String::new(),
		}];
	}

	/// Adds a recipient to the roster, with its credentials slot.
	pub fn add_recipient(&mut self, email: &str, url: &str, read_only: bool) {
		self.members.push(Member {
			status: MemberStatus::MailNotSent,
			name: String::new(),
			email: email.to_owned(),
			instance: url.trim_end_matches('/').to_owned(),
			read_only,
			public_key: String::new(),
		});
		self.credentials.push(Credentials::new());
	}

	/// True only if this instance is declared a read-only member.
	pub fn read_only_flag(&self) -> bool {
		if !self.owner {
			for m in self.members.iter().skip(1) {
				if !m.instance.is_empty() {
					return m.read_only;
				}
			}
		}
		false
	}

	/// True if the rules forbid propagating a recipient's changes back.
	pub fn read_only_rules(&self) -> bool {
		!self.rules.iter().any(Rule::has_sync)
	}

	pub fn read_only(&self) -> bool {
		self.read_only_flag() || self.read_only_rules()
	}

	pub fn first_files_rule(&self) -> Option<(usize, &Rule)> {
		self.rules
			.iter()
			.enumerate()
			.find(|(_, r)| r.is_files() && !r.local)
	}

	/// The credentials paired with `members[index]` on the owner side, or
	/// the single entry on a recipient.
	pub fn credentials_for(&self, index: usize) -> Option<&Credentials> {
		if self.owner {
			self.credentials.get(index.checked_sub(1)?)
		} else {
			self.credentials.first()
		}
	}

	pub fn credentials_for_mut(&mut self, index: usize) -> Option<&mut Credentials> {
		if self.owner {
			self.credentials.get_mut(index.checked_sub(1)?)
		} else {
			self.credentials.first_mut()
		}
	}

	/// The members a replication or upload job must push to.
	pub fn targets(&self) -> Vec<usize> {
		if self.owner {
			self.members
				.iter()
				.enumerate()
				.skip(1)
				.filter(|(_, m)| m.status == MemberStatus::Ready)
				.map(|(i, _)| i)
				.collect()
		} else {
			vec![0]
		}
	}

	pub fn member_index_by_url(&self, url: &str) -> Option<usize> {
		let url = url.trim_end_matches('/');
		self.members
			.iter()
			.position(|m| m.instance.trim_end_matches('/') == url)
	}

	/// Checks the sharing and persists it on the owner's instance.
	pub async fn create(&mut self, instance: &Arc<Instance>) -> Result<(), SharingError> {
		rule::validate_rules(&self.rules)?;
		if self.members.len() < 2 {
			return Err(SharingError::NoRecipients);
		}
		instance.create_doc(self).await?;
		if let Some((_, files_rule)) = self.first_files_rule() {
			if files_rule.selector != rule::SELECTOR_REFERENCED_BY {
				if let Err(e) = self.add_reference_for_sharing_dir(instance).await {
					warn!(target: "sharing", id = %self.doc_id, "cannot tag the sharing dir: {e}");
				}
			}
		}
		info!(target: "sharing", id = %self.doc_id, "sharing created");
		Ok(())
	}

	async fn add_reference_for_sharing_dir(
		&self,
		instance: &Arc<Instance>,
	) -> Result<(), SharingError> {
		let Some((_, files_rule)) = self.first_files_rule() else {
			return Ok(());
		};
		let Some(dir_id) = files_rule.values.first() else {
			return Ok(());
		};
		let fs = instance.vfs();
		let dir = fs.dir_by_id(dir_id).await?;
		let mut newdoc = dir.clone();
		newdoc.add_referenced_by(&[DocRef::new(SHARINGS, &self.doc_id)]);
		fs.update_dir_doc(&dir, &mut newdoc).await?;
		Ok(())
	}

	/// The invitation payload for one member: the rules are translated to
	/// the recipient's id space with its XOR key.
	pub fn request_for_member(&self, index: usize) -> Result<SharingRequest, SharingError> {
		let creds = self
			.credentials_for(index)
			.ok_or(SharingError::MemberNotFound)?;
		let mut rules = self.rules.clone();
		for r in &mut rules {
			if r.is_files() && r.selector != rule::SELECTOR_REFERENCED_BY {
				for v in &mut r.values {
					*v = member::xor_id(v, &creds.xor_key);
				}
			}
		}
		Ok(SharingRequest {
			sharing_id: self.doc_id.clone(),
			description: self.description.clone(),
			app_slug: self.app_slug.clone(),
			preview_path: self.preview_path.clone(),
			rules,
			members: self.members.clone(),
		})
	}

	/// Sends the invitation to every member that was not reached yet.
	pub async fn invite_members(
		&mut self,
		instance: &Arc<Instance>,
		peer: &dyn PeerClient,
	) -> Result<(), SharingError> {
		for index in 1..self.members.len() {
			if self.members[index].status != MemberStatus::MailNotSent {
				continue;
			}
			let req = self.request_for_member(index)?;
			peer.create_sharing(&self.members[index].instance.clone(), &req)
				.await?;
			self.members[index].status = MemberStatus::Pending;
		}
		instance.update_doc(self).await?;
		Ok(())
	}

	/// Accepts a pending sharing on a recipient: exchanges credentials
	/// with the owner, creates the shared directory and installs the
	/// triggers for outbound changes (unless read-only).
	pub async fn accept(
		&mut self,
		instance: &Arc<Instance>,
		peer: &dyn PeerClient,
	) -> Result<(), SharingError> {
		if self.owner {
			return Err(SharingError::InvalidSharing);
		}
		if self.active || !self.credentials.is_empty() {
			return Err(SharingError::AlreadyAccepted);
		}
		let owner_url = self.members.first().map(|m| m.instance.clone());
		let owner_url = owner_url.ok_or(SharingError::InvalidSharing)?;

		// Register an OAuth client the owner will use to reach us.
		let inbound_client = OAuthClient {
			client_id: member::random_token(),
			client_secret: member::random_token(),
		};
		let inbound_token = AccessToken {
			access_token: member::random_token(),
			refresh_token: member::random_token(),
			scope: "sharing".to_owned(),
		};
		let answer = peer
			.answer(
				&owner_url,
				&self.doc_id,
				&AnswerRequest {
					instance: instance.url.clone(),
					public_name: instance.settings.public_name.clone(),
					client: inbound_client.clone(),
					access_token: inbound_token,
				},
			)
			.await?;

		self.credentials = vec![Credentials {
			xor_key: answer.xor_key,
			state: String::new(),
			inbound_client_id: inbound_client.client_id,
			client: Some(answer.client),
			access_token: Some(answer.access_token),
		}];
		self.nb_files = answer.nb_files;
		self.initial = answer.nb_files > 0;
		self.active = true;
		if let Some(index) = self.member_index_by_url(&instance.url) {
			self.members[index].status = MemberStatus::Ready;
		}

		if self.first_files_rule().is_some() {
			self.create_sharing_dir(instance).await?;
		}
		if !self.read_only() {
			self.setup_triggers(instance).await?;
		} else {
			self.setup_track_triggers(instance).await?;
		}
		instance.update_doc(self).await?;
		info!(target: "sharing", id = %self.doc_id, "sharing accepted");
		Ok(())
	}

	/// The shared root directory of this sharing, found by reference.
	pub async fn get_sharing_dir(&self, instance: &Arc<Instance>) -> Result<DirDoc, SharingError> {
		let docs = instance
			.store
			.find(
				FILES,
				&Selector::Elem(
					"referenced_by".into(),
					json!({"type": SHARINGS, "id": self.doc_id}),
				),
				0,
			)
			.await?;
		for doc in docs {
			if doc.get("type").and_then(Value::as_str) == Some("directory") {
				return Ok(couch::from_value(doc)?);
			}
		}
		Err(SharingError::NotFound)
	}

	/// Creates the shared root directory on a recipient, with the id the
	/// replicated children will reference as their parent.
	async fn create_sharing_dir(&self, instance: &Arc<Instance>) -> Result<DirDoc, SharingError> {
		let Some((_, files_rule)) = self.first_files_rule() else {
			return Err(SharingError::InvalidSharing);
		};
		let fs = instance.vfs();
		let parent = trash::mkdir_all(fs.as_ref(), SHARED_WITH_ME_DIR).await?;
		let name = if files_rule.title.is_empty() {
			self.description.clone()
		} else {
			files_rule.title.clone()
		};
		let name = trash::conflict_free_name(fs.indexer().as_ref(), &parent.doc_id, &name).await?;
		let mut dir = DirDoc::new_with_parent(&name, &parent)?;
		if let Some(id) = files_rule.values.first() {
			dir.doc_id = id.clone();
		}
		dir.add_referenced_by(&[DocRef::new(SHARINGS, &self.doc_id)]);
		fs.create_dir(&mut dir).await?;
		Ok(dir)
	}

	/// Installs the track triggers (one per rule).
	async fn setup_track_triggers(&mut self, instance: &Arc<Instance>) -> Result<(), SharingError> {
		if !self.triggers.track_ids.is_empty() {
			return Ok(());
		}
		let scheduler = &instance.jobs.scheduler;
		for (rule_index, r) in self.rules.iter().enumerate() {
			if r.local {
				continue;
			}
			let args = format!("{}:CREATED,UPDATED,DELETED", r.doctype);
			let infos = crate::job::TriggerInfos::new(
				&instance.domain,
				"@event",
				TRACK_WORKER,
				args,
				json!({ "sharing_id": self.doc_id, "rule_index": rule_index }),
			);
			let infos = scheduler.add_trigger(instance, infos).await?;
			self.triggers.track_ids.push(infos.doc_id);
		}
		Ok(())
	}

	/// Installs all the triggers: track local changes, replicate
	/// documents, upload binaries.
	pub async fn setup_triggers(&mut self, instance: &Arc<Instance>) -> Result<(), SharingError> {
		self.setup_track_triggers(instance).await?;
		let scheduler = &instance.jobs.scheduler;
		if self.triggers.replicate_id.is_empty() {
			let infos = crate::job::TriggerInfos::new(
				&instance.domain,
				"@event",
				REPLICATE_WORKER,
				format!("{}:CREATED,UPDATED", couch::SHARED),
				json!({ "sharing_id": self.doc_id }),
			);
			let infos = scheduler.add_trigger(instance, infos).await?;
			self.triggers.replicate_id = infos.doc_id;
		}
		if self.triggers.upload_id.is_empty() && self.first_files_rule().is_some() {
			let infos = crate::job::TriggerInfos::new(
				&instance.domain,
				"@event",
				UPLOAD_WORKER,
				format!("{}:CREATED,UPDATED", couch::SHARED),
				json!({ "sharing_id": self.doc_id }),
			);
			let infos = scheduler.add_trigger(instance, infos).await?;
			self.triggers.upload_id = infos.doc_id;
		}
		Ok(())
	}

	/// Removes every trigger of this sharing.
	pub async fn remove_triggers(&mut self, instance: &Arc<Instance>) -> Result<(), SharingError> {
		let scheduler = &instance.jobs.scheduler;
		for id in self.triggers.track_ids.drain(..) {
			scheduler.delete_trigger(instance, &id).await?;
		}
		if !self.triggers.replicate_id.is_empty() {
			let id = std::mem::take(&mut self.triggers.replicate_id);
			scheduler.delete_trigger(instance, &id).await?;
		}
		if !self.triggers.upload_id.is_empty() {
			let id = std::mem::take(&mut self.triggers.upload_id);
			scheduler.delete_trigger(instance, &id).await?;
		}
		Ok(())
	}

	/// Marks the end of the initial sync on a recipient.
	pub async fn end_initial(&self, instance: &Arc<Instance>) -> Result<(), SharingError> {
		if !self.initial {
			return Ok(());
		}
		update_sharing(instance, &self.doc_id, |s| {
			s.initial = false;
			s.nb_files = 0;
		})
		.await?;
		instance.realtime.publish(
			crate::realtime::Verb::Updated,
			couch::SHARINGS_INITIAL_SYNC,
			&self.doc_id,
			json!({"_id": self.doc_id, "done": true}),
			None,
		);
		info!(target: "sharing", id = %self.doc_id, "initial sync done");
		Ok(())
	}
}

/// Fetches a sharing by id.
pub async fn find_sharing(
	instance: &Arc<Instance>,
	sharing_id: &str,
) -> Result<Sharing, SharingError> {
	match instance.get_doc(sharing_id).await {
		Ok(s) => Ok(s),
		Err(e) if e.is_not_found() => Err(SharingError::NotFound),
		Err(e) => Err(e.into()),
	}
}

/// Updates a sharing document with a bounded conflict-retry loop of three
/// attempts; beyond that the sharing may stay partially updated.
pub async fn update_sharing<F>(
	instance: &Arc<Instance>,
	sharing_id: &str,
	mutate: F,
) -> Result<Sharing, SharingError>
where
	F: Fn(&mut Sharing),
{
	let mut attempts = 0;
	loop {
		let mut s = find_sharing(instance, sharing_id).await?;
		mutate(&mut s);
		s.updated_at = Utc::now();
		match instance.update_doc(&mut s).await {
			Ok(()) => return Ok(s),
			Err(e) if e.is_conflict() && attempts < 2 => {
				attempts += 1;
			}
			Err(e) => {
				warn!(target: "sharing", id = %sharing_id, "cannot update sharing: {e}");
				return Err(e.into());
			}
		}
	}
}

/// Refreshes the access token for a member and persists it.
pub async fn refresh_credentials(
	instance: &Arc<Instance>,
	peer: &dyn PeerClient,
	sharing_id: &str,
	member_index: usize,
) -> Result<String, SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	let member = s
		.members
		.get(member_index)
		.ok_or(SharingError::MemberNotFound)?;
	let creds = s
		.credentials_for(member_index)
		.ok_or(SharingError::InvalidSharing)?;
	let (client, refresh) = match (&creds.client, &creds.access_token) {
		(Some(client), Some(token)) => (client.clone(), token.refresh_token.clone()),
		_ => return Err(SharingError::InvalidSharing),
	};
	let token = peer.refresh_token(member, &client, &refresh).await?;
	let access = token.access_token.clone();
	update_sharing(instance, sharing_id, move |s| {
		if let Some(creds) = s.credentials_for_mut(member_index) {
			creds.access_token = Some(token.clone());
		}
	})
	.await?;
	Ok(access)
}

// ---------------------------------------------------------------------
// Receiving-side handlers (the peer HTTP surface).
// ---------------------------------------------------------------------

/// `POST /sharings`: stores the sharing request sent by an owner.
pub async fn handle_create_sharing(
	instance: &Arc<Instance>,
	req: &SharingRequest,
) -> Result<(), SharingError> {
	rule::validate_rules(&req.rules)?;
	if req.members.len() < 2 {
		return Err(SharingError::NoRecipients);
	}
	if instance.get_doc::<Sharing>(&req.sharing_id).await.is_ok() {
		return Err(SharingError::AlreadyAccepted);
	}
	let mut s = Sharing::new(&req.description, req.rules.clone());
	s.doc_id = req.sharing_id.clone();
	s.app_slug = req.app_slug.clone();
	s.preview_path = req.preview_path.clone();
	s.members = req.members.clone();
	let value = couch::to_value(&s)?;
	instance.store.put(SHARINGS, value).await?;
	info!(target: "sharing", id = %req.sharing_id, "sharing request stored");
	Ok(())
}

/// `POST /sharings/{id}/answer`: the owner accepts a recipient's answer,
/// stores its credentials, installs its own triggers and seeds the
/// initial sync.
pub async fn handle_answer(
	instance: &Arc<Instance>,
	sharing_id: &str,
	req: &AnswerRequest,
) -> Result<AnswerResponse, SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	if !s.owner || !s.active {
		return Err(SharingError::InvalidSharing);
	}
	let index = s
		.member_index_by_url(&req.instance)
		.filter(|i| *i > 0)
		.ok_or(SharingError::MemberNotFound)?;
	if s.members[index].status == MemberStatus::Ready {
		return Err(SharingError::AlreadyAccepted);
	}

	// The client and token the recipient will use to reach us back.
	let outbound_client = OAuthClient {
		client_id: member::random_token(),
		client_secret: member::random_token(),
	};
	let outbound_token = AccessToken {
		access_token: member::random_token(),
		refresh_token: member::random_token(),
		scope: "sharing".to_owned(),
	};

	let client = req.client.clone();
	let token = req.access_token.clone();
	let public_name = req.public_name.clone();
	let outbound_id = outbound_client.client_id.clone();
	let s = update_sharing(instance, sharing_id, move |s| {
		s.members[index].status = MemberStatus::Ready;
		if !public_name.is_empty() {
			s.members[index].name = public_name.clone();
		}
		if let Some(creds) = s.credentials_for_mut(index) {
			creds.client = Some(client.clone());
			creds.access_token = Some(token.clone());
			creds.inbound_client_id = outbound_id.clone();
		}
	})
	.await?;

	let mut s = s;
	s.setup_triggers(instance).await?;
	update_sharing(instance, sharing_id, {
		let triggers = s.triggers.clone();
		move |s| s.triggers = triggers.clone()
	})
	.await?;

	// Seed the shared index with the documents already covered by the
	// rules; the replicate and upload triggers take it from there.
	initial_seed(instance, &s).await?;
	let nb_files = shared::count_binaries(instance.store.as_ref(), sharing_id).await?;

	let creds = s
		.credentials_for(index)
		.ok_or(SharingError::InvalidSharing)?;
	info!(target: "sharing", id = %sharing_id, member = index, "answer accepted");
	Ok(AnswerResponse {
		xor_key: creds.xor_key.clone(),
		client: outbound_client,
		access_token: outbound_token,
		nb_files,
	})
}

/// Seeds the shared index with every document already matching the rules.
async fn initial_seed(instance: &Arc<Instance>, s: &Sharing) -> Result<(), SharingError> {
	for (rule_index, r) in s.rules.iter().enumerate() {
		if r.local {
			continue;
		}
		let docs = if r.is_files() && r.selector.is_empty() {
			// A files rule covers its roots and all their descendants.
			let mut docs = Vec::new();
			let fs = instance.vfs();
			for id in &r.values {
				match fs.dir_or_file_by_id(id).await {
					Ok(vfs::DirOrFile::Dir(dir)) => {
						docs.push(couch::to_value(&dir)?);
						collect_descendants(&fs, &dir, &mut docs).await?;
					}
					Ok(vfs::DirOrFile::File(file)) => docs.push(couch::to_value(&file)?),
					Err(e) if e.is_not_found() => continue,
					Err(e) => return Err(e.into()),
				}
			}
			docs
		} else {
			let mut matching = Vec::new();
			for doc in instance.store.all_docs(&r.doctype).await? {
				if r.accept(&r.doctype, &doc) {
					matching.push(doc);
				}
			}
			matching
		};

		for doc in docs {
			let id = couch::doc_id(&doc).to_owned();
			if id.is_empty() {
				continue;
			}
			let (_, chain) = instance.store.get_with_revs(&r.doctype, &id).await?;
			let mut shared_ref = shared::get_shared_ref(instance.store.as_ref(), &r.doctype, &id)
				.await?
				.unwrap_or_else(|| SharedRef::new(&r.doctype, &id));
			shared_ref.merge_chain(&chain);
			let is_file = r.is_files()
				&& doc.get("type").and_then(Value::as_str) == Some("file");
			shared_ref.infos.insert(
				s.doc_id.clone(),
				SharedInfo {
					rule: rule_index,
					binary: is_file,
					removed: false,
					dissociated: false,
				},
			);
			shared_ref
				.save(instance.store.as_ref(), &instance.realtime)
				.await?;
		}
	}
	Ok(())
}

fn collect_descendants<'a>(
	fs: &'a Arc<dyn vfs::Vfs>,
	dir: &'a DirDoc,
	docs: &'a mut Vec<Value>,
) -> futures::future::BoxFuture<'a, Result<(), SharingError>> {
	async move {
		for child in fs.dir_children(dir).await? {
			match child {
				vfs::DirOrFile::Dir(subdir) => {
					docs.push(couch::to_value(&subdir)?);
					collect_descendants(fs, &subdir, docs).await?;
				}
				vfs::DirOrFile::File(file) => {
					if !file.trashed {
						docs.push(couch::to_value(&file)?);
					}
				}
			}
		}
		Ok(())
	}
	.boxed()
}

/// `DELETE /sharings/{id}/initial`: the owner pushed every file of the
/// initial sync.
pub async fn handle_initial_end(
	instance: &Arc<Instance>,
	sharing_id: &str,
) -> Result<(), SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	s.end_initial(instance).await
}

/// `POST /sharings/{id}/preview-url`: resolves the preview URL for a
/// state token.
pub async fn get_preview_url(
	instance: &Arc<Instance>,
	sharing_id: &str,
	state: &str,
) -> Result<String, SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	if s.preview_path.is_empty() || !s.credentials.iter().any(|c| c.state == state) {
		return Err(SharingError::Forbidden);
	}
	Ok(format!(
		"{}?sharecode={state}",
		instance.page_url(&s.preview_path)
	))
}

/// `POST /sharings/{id}/public-key`: stores the public key of the
/// member calling us.
pub async fn handle_public_key(
	instance: &Arc<Instance>,
	sharing_id: &str,
	from: &str,
	public_key: &str,
) -> Result<(), SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	let index = s
		.member_index_by_url(from)
		.ok_or(SharingError::MemberNotFound)?;
	let public_key = public_key.to_owned();
	update_sharing(instance, sharing_id, move |s| {
		s.members[index].public_key = public_key.clone();
	})
	.await?;
	Ok(())
}

// ---------------------------------------------------------------------
// Revocation.
// ---------------------------------------------------------------------

/// Owner-side: revokes the whole sharing for every member.
pub async fn revoke(
	instance: &Arc<Instance>,
	peer: &dyn PeerClient,
	sharing_id: &str,
) -> Result<(), SharingError> {
	let mut s = find_sharing(instance, sharing_id).await?;
	if !s.owner {
		return Err(SharingError::InvalidSharing);
	}
	info!(target: "sharing", id = %sharing_id, "revoking sharing");
	for index in 1..s.members.len() {
		if s.members[index].status != MemberStatus::Ready {
			continue;
		}
		revoke_member_side_effects(instance, peer, &s, index, true).await;
	}
	s.remove_triggers(instance).await?;
	shared::remove_all_shared_refs(instance, sharing_id).await?;
	remove_sharing_dir_reference(instance, &s).await;
	update_sharing(instance, sharing_id, |s| {
		s.active = false;
		s.triggers = Triggers::default();
		for m in s.members.iter_mut().skip(1) {
			m.status = MemberStatus::Revoked;
		}
		s.credentials = vec![Credentials::default(); s.credentials.len()];
	})
	.await?;
	Ok(())
}

/// Owner-side: revokes a single member. Cascades to a full revocation
/// when no active member remains.
pub async fn revoke_recipient(
	instance: &Arc<Instance>,
	peer: &dyn PeerClient,
	sharing_id: &str,
	index: usize,
) -> Result<(), SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	if !s.owner || index == 0 || index >= s.members.len() {
		return Err(SharingError::MemberNotFound);
	}
	revoke_member_side_effects(instance, peer, &s, index, true).await;
	let s = update_sharing(instance, sharing_id, |s| {
		s.members[index].status = MemberStatus::Revoked;
		if let Some(creds) = s.credentials_for_mut(index) {
			*creds = Credentials::default();
		}
	})
	.await?;
	if !s
		.members
		.iter()
		.skip(1)
		.any(|m| m.status == MemberStatus::Ready)
	{
		no_more_recipients(instance, &s).await?;
	}
	Ok(())
}

/// Owner-side cleanup applied when the last member left.
async fn no_more_recipients(
	instance: &Arc<Instance>,
	s: &Sharing,
) -> Result<(), SharingError> {
	let mut s = s.clone();
	s.remove_triggers(instance).await?;
	shared::remove_all_shared_refs(instance, &s.doc_id).await?;
	remove_sharing_dir_reference(instance, &s).await;
	update_sharing(instance, &s.doc_id, |s| {
		s.active = false;
		s.triggers = Triggers::default();
	})
	.await?;
	Ok(())
}

/// Per-member owner-side cleanup: peer notification, OAuth client
/// deletion, replication cursors.
async fn revoke_member_side_effects(
	instance: &Arc<Instance>,
	peer: &dyn PeerClient,
	s: &Sharing,
	index: usize,
	notify: bool,
) {
	let member = &s.members[index];
	let Some(creds) = s.credentials_for(index) else {
		return;
	};
	let token = creds.bearer().unwrap_or_default().to_owned();
	if notify {
		if let Err(e) = peer
			.revoke_sharing(member, &token, &s.doc_id, Some(index), &instance.url)
			.await
		{
			warn!(target: "sharing", id = %s.doc_id, member = index, "cannot notify revocation: {e}");
		}
	}
	if let Some(client) = &creds.client {
		if let Err(e) = peer.delete_client(member, client, &token).await {
			warn!(target: "sharing", id = %s.doc_id, member = index, "cannot delete peer client: {e}");
		}
	}
	if let Err(e) = replicator::clear_last_seqs(instance, s, member).await {
		warn!(target: "sharing", id = %s.doc_id, member = index, "cannot clear sequence numbers: {e}");
	}
}

/// Recipient-side: this instance leaves the sharing.
pub async fn revoke_recipient_by_self(
	instance: &Arc<Instance>,
	peer: &dyn PeerClient,
	sharing_id: &str,
	sharing_dir_trashed: bool,
) -> Result<(), SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	if s.owner {
		return Err(SharingError::InvalidSharing);
	}
	// Tell the owner first; a failure here is not fatal, the owner will
	// learn about it on its next push.
	if let (Some(owner), Some(creds)) = (s.members.first(), s.credentials.first()) {
		let token = creds.bearer().unwrap_or_default();
		if let Err(e) = peer
			.revoke_sharing(owner, token, sharing_id, None, &instance.url)
			.await
		{
			warn!(target: "sharing", id = %sharing_id, "cannot notify the owner: {e}");
		}
	}
	revoke_recipient_side(instance, s, sharing_dir_trashed).await
}

/// Recipient-side: the owner revoked us.
pub async fn handle_revoked_by_owner(
	instance: &Arc<Instance>,
	sharing_id: &str,
) -> Result<(), SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	if s.owner {
		return Err(SharingError::InvalidSharing);
	}
	if !s.active {
		return Ok(());
	}
	revoke_recipient_side(instance, s, false).await
}

async fn revoke_recipient_side(
	instance: &Arc<Instance>,
	mut s: Sharing,
	sharing_dir_trashed: bool,
) -> Result<(), SharingError> {
	info!(target: "sharing", id = %s.doc_id, "leaving sharing");
	s.remove_triggers(instance).await?;
	shared::remove_all_shared_refs(instance, &s.doc_id).await?;
	if !sharing_dir_trashed {
		match s.get_sharing_dir(instance).await {
			Ok(dir) => {
				if !dir.is_trashed() {
					let fs = instance.vfs();
					if let Err(e) = trash::trash_dir(fs.as_ref(), &dir).await {
						warn!(target: "sharing", id = %s.doc_id, "cannot trash the sharing dir: {e}");
					}
				}
			}
			Err(SharingError::NotFound) => {}
			Err(e) => return Err(e),
		}
	}
	let url = instance.url.clone();
	update_sharing(instance, &s.doc_id.clone(), move |s| {
		s.active = false;
		s.triggers = Triggers::default();
		s.credentials = Vec::new();
		if let Some(index) = s.member_index_by_url(&url) {
			s.members[index].status = MemberStatus::Revoked;
		}
	})
	.await?;
	Ok(())
}

/// Owner-side: a recipient told us it revoked itself.
pub async fn handle_recipient_revoked(
	instance: &Arc<Instance>,
	sharing_id: &str,
	from: &str,
) -> Result<(), SharingError> {
	let s = find_sharing(instance, sharing_id).await?;
	if !s.owner {
		return Err(SharingError::InvalidSharing);
	}
	let index = s
		.member_index_by_url(from)
		.filter(|i| *i > 0)
		.ok_or(SharingError::MemberNotFound)?;
	if let Err(e) = replicator::clear_last_seqs(instance, &s, &s.members[index]).await {
		warn!(target: "sharing", id = %sharing_id, member = index, "cannot clear sequence numbers: {e}");
	}
	let s = update_sharing(instance, sharing_id, move |s| {
		s.members[index].status = MemberStatus::Revoked;
		if let Some(creds) = s.credentials_for_mut(index) {
			*creds = Credentials::default();
		}
	})
	.await?;
	if !s
		.members
		.iter()
		.skip(1)
		.any(|m| m.status == MemberStatus::Ready)
	{
		no_more_recipients(instance, &s).await?;
	}
	Ok(())
}

async fn remove_sharing_dir_reference(instance: &Arc<Instance>, s: &Sharing) {
	match s.get_sharing_dir(instance).await {
		Ok(dir) => {
			let fs = instance.vfs();
			let mut newdoc = dir.clone();
			newdoc.remove_referenced_by(&[DocRef::new(SHARINGS, &s.doc_id)]);
			if let Err(e) = fs.update_dir_doc(&dir, &mut newdoc).await {
				warn!(target: "sharing", id = %s.doc_id, "cannot untag the sharing dir: {e}");
			}
		}
		Err(SharingError::NotFound) => {}
		Err(e) => {
			warn!(target: "sharing", id = %s.doc_id, "cannot find the sharing dir: {e}");
		}
	}
}

// ---------------------------------------------------------------------
// Worker registration.
// ---------------------------------------------------------------------

/// The worker pool configuration of the sharing engine, to be passed to
/// the job system at startup.
pub fn workers(peer: Arc<dyn PeerClient>) -> Vec<(WorkerConfig, WorkerFunc)> {
	let track: WorkerFunc = Arc::new(|ctx| Box::pin(shared::worker_track(ctx)));

	let replicate_peer = peer.clone();
	let replicate: WorkerFunc = Arc::new(move |ctx| {
		let peer = replicate_peer.clone();
		Box::pin(async move { replicator::worker_replicate(ctx, peer).await })
	});

	let upload_peer = peer;
	let upload: WorkerFunc = Arc::new(move |ctx| {
		let peer = upload_peer.clone();
		Box::pin(async move { upload::worker_upload(ctx, peer).await })
	});

	let mut track_config = WorkerConfig::new(TRACK_WORKER);
	track_config.concurrency = 4;
	let mut replicate_config = WorkerConfig::new(REPLICATE_WORKER);
	replicate_config.max_exec_count = crate::config::DEFAULT_MAX_RETRIES;
	let mut upload_config = WorkerConfig::new(UPLOAD_WORKER);
	upload_config.max_exec_count = crate::config::DEFAULT_MAX_RETRIES;
	upload_config.timeout = std::time::Duration::from_secs(300);

	vec![
		(track_config, track),
		(replicate_config, replicate),
		(upload_config, upload),
	]
}
