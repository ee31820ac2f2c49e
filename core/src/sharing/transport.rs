//! The instance-to-instance transport.
//!
//! [`PeerClient`] covers the peer HTTP surface; [`HttpPeerClient`] is the
//! production implementation. [`LocalPeerClient`] short-circuits the wire
//! for instances hosted in the same process.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{couch::FILES, instance::Instance};

use super::{
	member::{AccessToken, Member, OAuthClient},
	replicator, upload,
	upload::{FileDocWithRevisions, KeyToUpload},
	Rule, SharingError,
};

/// Replicated documents grouped by doctype, each carrying `_revisions`.
pub type DocsByDoctype = HashMap<String, Vec<Value>>;

/// The payload creating a sharing request on a recipient. Ids inside the
/// rules are already translated to the recipient's space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharingRequest {
	pub sharing_id: String,
	pub description: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub app_slug: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub preview_path: String,
	pub rules: Vec<Rule>,
	pub members: Vec<Member>,
}

/// The recipient's acceptation: the credentials the owner will use to
/// reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRequest {
	/// URL of the answering instance, identifying the member.
	pub instance: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub public_name: String,
	pub client: OAuthClient,
	pub access_token: AccessToken,
}

/// The owner's response: the credentials the recipient will use to reach
/// it back, and the id obfuscation key both sides share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
	pub xor_key: String,
	pub client: OAuthClient,
	pub access_token: AccessToken,
	/// How many files the initial sync will push.
	#[serde(default)]
	pub nb_files: usize,
}

#[async_trait]
pub trait PeerClient: Send + Sync {
	/// `POST /sharings`: the owner creates the sharing on the recipient.
	async fn create_sharing(&self, url: &str, req: &SharingRequest) -> Result<(), SharingError>;

	/// `POST /sharings/{id}/answer`: the recipient accepts.
	async fn answer(
		&self,
		url: &str,
		sharing_id: &str,
		req: &AnswerRequest,
	) -> Result<AnswerResponse, SharingError>;

	/// `POST /sharings/{id}/_bulk_docs`: replicate a batch of revisions.
	async fn bulk_docs(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		docs: &DocsByDoctype,
	) -> Result<(), SharingError>;

	/// `PUT /sharings/{id}/io.cozy.files/{xored-id}/metadata`: phase-1
	/// file sync. `None` means the metadata was enough.
	async fn sync_file(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		doc: &FileDocWithRevisions,
	) -> Result<Option<KeyToUpload>, SharingError>;

	/// `PUT /sharings/{id}/io.cozy.files/{key}`: phase-2 binary push.
	async fn send_file(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		key: &str,
		mime: &str,
		content: Vec<u8>,
	) -> Result<(), SharingError>;

	/// `DELETE /sharings/{id}/recipients[/{index}]`: revocation. Without
	/// an index the target is the owner and `from` names the recipient
	/// revoking itself; with an index the owner revokes that member.
	async fn revoke_sharing(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		index: Option<usize>,
		from: &str,
	) -> Result<(), SharingError>;

	/// `DELETE /sharings/{id}/initial`: every file of the initial sync
	/// was pushed.
	async fn notify_initial_end(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
	) -> Result<(), SharingError>;

	/// `POST /sharings/{id}/preview-url`: resolve the preview URL with a
	/// state token.
	async fn preview_url(
		&self,
		url: &str,
		sharing_id: &str,
		state: &str,
	) -> Result<String, SharingError>;

	/// `POST /sharings/{id}/public-key`: deliver a member's public key.
	async fn send_public_key(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		from: &str,
		public_key: &str,
	) -> Result<(), SharingError>;

	/// `POST /auth/access_token`: refresh an expired access token.
	async fn refresh_token(
		&self,
		member: &Member,
		client: &OAuthClient,
		refresh_token: &str,
	) -> Result<AccessToken, SharingError>;

	/// `DELETE /auth/register/{client-id}`: delete the OAuth client we
	/// registered on the peer.
	async fn delete_client(
		&self,
		member: &Member,
		client: &OAuthClient,
		token: &str,
	) -> Result<(), SharingError>;
}

/// Production implementation over HTTP with bearer tokens.
pub struct HttpPeerClient {
	http: reqwest::Client,
}

impl Default for HttpPeerClient {
	fn default() -> Self {
		Self::new()
	}
}

impl HttpPeerClient {
	pub fn new() -> Self {
		Self {
			http: reqwest::Client::new(),
		}
	}

	fn url(base: &str, path: &str) -> String {
		format!("{}{}", base.trim_end_matches('/'), path)
	}

	async fn check(res: reqwest::Response) -> Result<reqwest::Response, SharingError> {
		let status = res.status();
		if status.is_success() {
			return Ok(res);
		}
		let description = res
			.json::<Value>()
			.await
			.ok()
			.and_then(|body| {
				body.get("error_description")
					.or_else(|| body.get("error"))
					.and_then(Value::as_str)
					.map(str::to_owned)
			})
			.unwrap_or_default();
		debug!(target: "sharing", status = status.as_u16(), "peer request failed: {description}");
		Err(match status.as_u16() {
			401 => SharingError::Unauthorized,
			403 => SharingError::Forbidden,
			s if s >= 500 => SharingError::InternalServerError,
			s => SharingError::RequestFailed { status: s },
		})
	}
}

#[async_trait]
impl PeerClient for HttpPeerClient {
	async fn create_sharing(&self, url: &str, req: &SharingRequest) -> Result<(), SharingError> {
		let res = self
			.http
			.post(Self::url(url, "/sharings"))
			.json(req)
			.send()
			.await?;
		Self::check(res).await.map(drop)
	}

	async fn answer(
		&self,
		url: &str,
		sharing_id: &str,
		req: &AnswerRequest,
	) -> Result<AnswerResponse, SharingError> {
		let res = self
			.http
			.post(Self::url(url, &format!("/sharings/{sharing_id}/answer")))
			.json(req)
			.send()
			.await?;
		Ok(Self::check(res).await?.json().await?)
	}

	async fn bulk_docs(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		docs: &DocsByDoctype,
	) -> Result<(), SharingError> {
		let res = self
			.http
			.post(Self::url(
				&member.instance,
				&format!("/sharings/{sharing_id}/_bulk_docs"),
			))
			.bearer_auth(token)
			.json(docs)
			.send()
			.await?;
		Self::check(res).await.map(drop)
	}

	async fn sync_file(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		doc: &FileDocWithRevisions,
	) -> Result<Option<KeyToUpload>, SharingError> {
		let res = self
			.http
			.put(Self::url(
				&member.instance,
				&format!("/sharings/{sharing_id}/{FILES}/{}/metadata", doc.file.doc_id),
			))
			.bearer_auth(token)
			.json(doc)
			.send()
			.await?;
		let res = Self::check(res).await?;
		if res.status().as_u16() == 204 {
			return Ok(None);
		}
		Ok(Some(res.json().await?))
	}

	async fn send_file(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		key: &str,
		mime: &str,
		content: Vec<u8>,
	) -> Result<(), SharingError> {
		let res = self
			.http
			.put(Self::url(
				&member.instance,
				&format!("/sharings/{sharing_id}/{FILES}/{key}"),
			))
			.bearer_auth(token)
			.header(reqwest::header::CONTENT_TYPE, mime.to_owned())
			.body(content)
			.send()
			.await?;
		Self::check(res).await.map(drop)
	}

	async fn revoke_sharing(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		index: Option<usize>,
		from: &str,
	) -> Result<(), SharingError> {
		let path = match index {
			Some(index) => format!("/sharings/{sharing_id}/recipients/{index}"),
			None => format!("/sharings/{sharing_id}/recipients"),
		};
		let res = self
			.http
			.delete(Self::url(&member.instance, &path))
			.bearer_auth(token)
			.query(&[("from", from)])
			.send()
			.await?;
		Self::check(res).await.map(drop)
	}

	async fn notify_initial_end(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
	) -> Result<(), SharingError> {
		let res = self
			.http
			.delete(Self::url(
				&member.instance,
				&format!("/sharings/{sharing_id}/initial"),
			))
			.bearer_auth(token)
			.send()
			.await?;
		Self::check(res).await.map(drop)
	}

	async fn preview_url(
		&self,
		url: &str,
		sharing_id: &str,
		state: &str,
	) -> Result<String, SharingError> {
		let res = self
			.http
			.post(Self::url(url, &format!("/sharings/{sharing_id}/preview-url")))
			.json(&json!({ "state": state }))
			.send()
			.await?;
		let body: Value = Self::check(res).await?.json().await?;
		Ok(body
			.get("url")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_owned())
	}

	async fn send_public_key(
		&self,
		member: &Member,
		token: &str,
		sharing_id: &str,
		from: &str,
		public_key: &str,
	) -> Result<(), SharingError> {
		let res = self
			.http
			.post(Self::url(
				&member.instance,
				&format!("/sharings/{sharing_id}/public-key"),
			))
			.bearer_auth(token)
			.json(&json!({ "from": from, "public_key": public_key }))
			.send()
			.await?;
		Self::check(res).await.map(drop)
	}

	async fn refresh_token(
		&self,
		member: &Member,
		client: &OAuthClient,
		refresh_token: &str,
	) -> Result<AccessToken, SharingError> {
		let res = self
			.http
			.post(Self::url(&member.instance, "/auth/access_token"))
			.form(&[
				("grant_type", "refresh_token"),
				("client_id", &client.client_id),
				("client_secret", &client.client_secret),
				("refresh_token", refresh_token),
			])
			.send()
			.await?;
		Ok(Self::check(res).await?.json().await?)
	}

	async fn delete_client(
		&self,
		member: &Member,
		client: &OAuthClient,
		token: &str,
	) -> Result<(), SharingError> {
		let res = self
			.http
			.delete(Self::url(
				&member.instance,
				&format!("/auth/register/{}", client.client_id),
			))
			.bearer_auth(token)
			.send()
			.await?;
		Self::check(res).await.map(drop)
	}
}

/// In-process transport for instances hosted by the same server.
#[derive(Default)]
pub struct LocalPeerClient {
	instances: RwLock<HashMap<String, Arc<Instance>>>,
}

impl LocalPeerClient {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub async fn register(&self, instance: Arc<Instance>) {
		self.instances
			.write()
			.await
			.insert(instance.url.clone(), instance);
	}

	async fn resolve(&self, url: &str) -> Result<Arc<Instance>, SharingError> {
		self.instances
			.read()
			.await
			.get(url.trim_end_matches('/'))
			.cloned()
			.ok_or(SharingError::InvalidUrl)
	}
}

#[async_trait]
impl PeerClient for LocalPeerClient {
	async fn create_sharing(&self, url: &str, req: &SharingRequest) -> Result<(), SharingError> {
		let instance = self.resolve(url).await?;
		super::handle_create_sharing(&instance, req).await
	}

	async fn answer(
		&self,
		url: &str,
		sharing_id: &str,
		req: &AnswerRequest,
	) -> Result<AnswerResponse, SharingError> {
		let instance = self.resolve(url).await?;
		super::handle_answer(&instance, sharing_id, req).await
	}

	async fn bulk_docs(
		&self,
		member: &Member,
		_token: &str,
		sharing_id: &str,
		docs: &DocsByDoctype,
	) -> Result<(), SharingError> {
		let instance = self.resolve(&member.instance).await?;
		replicator::apply_bulk_docs(&instance, sharing_id, docs).await
	}

	async fn sync_file(
		&self,
		member: &Member,
		_token: &str,
		sharing_id: &str,
		doc: &FileDocWithRevisions,
	) -> Result<Option<KeyToUpload>, SharingError> {
		let instance = self.resolve(&member.instance).await?;
		upload::handle_sync_file(&instance, sharing_id, doc).await
	}

	async fn send_file(
		&self,
		member: &Member,
		_token: &str,
		sharing_id: &str,
		key: &str,
		_mime: &str,
		content: Vec<u8>,
	) -> Result<(), SharingError> {
		let instance = self.resolve(&member.instance).await?;
		upload::handle_file_upload(&instance, sharing_id, key, content).await
	}

	async fn revoke_sharing(
		&self,
		member: &Member,
		_token: &str,
		sharing_id: &str,
		index: Option<usize>,
		from: &str,
	) -> Result<(), SharingError> {
		let instance = self.resolve(&member.instance).await?;
		match index {
			None => super::handle_recipient_revoked(&instance, sharing_id, from).await,
			Some(_) => super::handle_revoked_by_owner(&instance, sharing_id).await,
		}
	}

	async fn notify_initial_end(
		&self,
		member: &Member,
		_token: &str,
		sharing_id: &str,
	) -> Result<(), SharingError> {
		let instance = self.resolve(&member.instance).await?;
		super::handle_initial_end(&instance, sharing_id).await
	}

	async fn preview_url(
		&self,
		url: &str,
		sharing_id: &str,
		state: &str,
	) -> Result<String, SharingError> {
		let instance = self.resolve(url).await?;
		super::get_preview_url(&instance, sharing_id, state).await
	}

	async fn send_public_key(
		&self,
		member: &Member,
		_token: &str,
		sharing_id: &str,
		from: &str,
		public_key: &str,
	) -> Result<(), SharingError> {
		let instance = self.resolve(&member.instance).await?;
		super::handle_public_key(&instance, sharing_id, from, public_key).await
	}

	async fn refresh_token(
		&self,
		_member: &Member,
		_client: &OAuthClient,
		refresh_token: &str,
	) -> Result<AccessToken, SharingError> {
		// In-process peers do not expire; hand back an equivalent token.
		Ok(AccessToken {
			access_token: super::member::random_token(),
			refresh_token: refresh_token.to_owned(),
			scope: "sharing".to_owned(),
		})
	}

	async fn delete_client(
		&self,
		_member: &Member,
		_client: &OAuthClient,
		_token: &str,
	) -> Result<(), SharingError> {
		Ok(())
	}
}

impl From<reqwest::Error> for SharingError {
	fn from(e: reqwest::Error) -> Self {
		SharingError::Request(e.to_string())
	}
}
