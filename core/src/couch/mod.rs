//! The document-store boundary.
//!
//! The store itself is an external collaborator: this module only fixes the
//! contract the engine relies on (get/put by id+rev, a changes feed,
//! bulk-get, find-by-selector, and forced writes carrying a revision
//! history), plus an in-memory implementation with real revision-tree
//! semantics used by tests and single-process deployments.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod memory;
pub mod revision;

pub use memory::MemStore;

// Document type namespaces.
pub const FILES: &str = "io.cozy.files";
pub const VERSIONS: &str = "io.cozy.files.versions";
pub const SHARED: &str = "io.cozy.shared";
pub const SHARINGS: &str = "io.cozy.sharings";
pub const SHARINGS_INITIAL_SYNC: &str = "io.cozy.sharings.initial_sync";
pub const MEMBER_SEQS: &str = "io.cozy.sharings.member-last-seq";
pub const JOBS: &str = "io.cozy.jobs";
pub const TRIGGERS: &str = "io.cozy.triggers";

#[derive(Debug, Error)]
pub enum CouchError {
	#[error("document not found: {doctype}/{id}")]
	NotFound { doctype: String, id: String },
	#[error("document was deleted: {doctype}/{id}")]
	Deleted { doctype: String, id: String },
	#[error("document update conflict: {doctype}/{id}")]
	Conflict { doctype: String, id: String },
	#[error("invalid document: {0}")]
	InvalidDoc(String),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl CouchError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, CouchError::NotFound { .. })
	}

	pub fn is_deleted(&self) -> bool {
		matches!(self, CouchError::Deleted { .. })
	}

	pub fn is_conflict(&self) -> bool {
		matches!(self, CouchError::Conflict { .. })
	}
}

/// A typed document persisted in the store.
pub trait Doc: Serialize + DeserializeOwned + Send + Sync {
	const DOCTYPE: &'static str;

	fn id(&self) -> &str;
	fn rev(&self) -> &str;
	fn set_id(&mut self, id: String);
	fn set_rev(&mut self, rev: String);
}

/// Implements the [`Doc`] accessors for a struct with `doc_id` and
/// `doc_rev` string fields.
macro_rules! impl_doc {
	($ty:ty, $doctype:expr) => {
		impl $crate::couch::Doc for $ty {
			const DOCTYPE: &'static str = $doctype;

			fn id(&self) -> &str {
				&self.doc_id
			}
			fn rev(&self) -> &str {
				&self.doc_rev
			}
			fn set_id(&mut self, id: String) {
				self.doc_id = id;
			}
			fn set_rev(&mut self, rev: String) {
				self.doc_rev = rev;
			}
		}
	};
}
pub(crate) use impl_doc;

/// A selector over json documents, the small subset the engine needs.
#[derive(Debug, Clone)]
pub enum Selector {
	/// Field equals value.
	Eq(String, Value),
	/// Array field contains the value.
	Elem(String, Value),
	/// Field is present.
	Exists(String),
	/// Conjunction.
	And(Vec<Selector>),
}

impl Selector {
	pub fn matches(&self, doc: &Value) -> bool {
		match self {
			Selector::Eq(field, value) => doc.get(field) == Some(value),
			Selector::Elem(field, value) => doc
				.get(field)
				.and_then(Value::as_array)
				.is_some_and(|items| items.contains(value)),
			Selector::Exists(field) => doc.get(field).is_some(),
			Selector::And(all) => all.iter().all(|s| s.matches(doc)),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ChangesRequest {
	pub doctype: String,
	pub since: u64,
	pub limit: usize,
	pub include_docs: bool,
}

#[derive(Debug, Clone)]
pub struct Change {
	pub seq: u64,
	pub id: String,
	pub deleted: bool,
	/// The leaf revisions of the document.
	pub changes: Vec<String>,
	pub doc: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangesResponse {
	pub last_seq: u64,
	pub pending: usize,
	pub results: Vec<Change>,
}

/// The store contract. Documents are json objects carrying `_id` and
/// `_rev`; a `_deleted: true` member marks a tombstone.
#[async_trait]
pub trait Store: Send + Sync {
	/// Fetches the current winning revision of a document.
	async fn get(&self, doctype: &str, id: &str) -> Result<Value, CouchError>;

	/// Fetches a document along with the revision chain of its winner,
	/// ordered root to tip.
	async fn get_with_revs(&self, doctype: &str, id: &str)
		-> Result<(Value, Vec<String>), CouchError>;

	/// Writes a document. A missing `_id` is generated; `_rev` must match
	/// the current winner or the write fails with `Conflict`. Returns the
	/// id and the new revision.
	async fn put(&self, doctype: &str, doc: Value) -> Result<(String, String), CouchError>;

	/// Writes a document at an explicit position in its revision tree
	/// (replication write, `new_edits=false`): the chain is merged as-is
	/// and never conflicts.
	async fn force_put(
		&self,
		doctype: &str,
		doc: Value,
		chain: &[String],
	) -> Result<(), CouchError>;

	/// Deletes a document, writing a tombstone. Returns the tombstone
	/// revision.
	async fn delete(&self, doctype: &str, id: &str, rev: &str) -> Result<String, CouchError>;

	/// Fetches several (id, rev) pairs at once; unknown pairs are skipped.
	async fn bulk_get(
		&self,
		doctype: &str,
		ids: &[(String, String)],
	) -> Result<Vec<Value>, CouchError>;

	/// Reads the changes feed.
	async fn changes(&self, req: &ChangesRequest) -> Result<ChangesResponse, CouchError>;

	/// Finds documents matching a selector.
	async fn find(
		&self,
		doctype: &str,
		selector: &Selector,
		limit: usize,
	) -> Result<Vec<Value>, CouchError>;

	/// All current (non-deleted) documents of a doctype.
	async fn all_docs(&self, doctype: &str) -> Result<Vec<Value>, CouchError>;
}

/// Serializes a typed document to its store representation.
pub fn to_value<T: Doc>(doc: &T) -> Result<Value, CouchError> {
	let mut value = serde_json::to_value(doc)?;
	let obj = value
		.as_object_mut()
		.ok_or_else(|| CouchError::InvalidDoc("document is not an object".to_owned()))?;
	if doc.id().is_empty() {
		obj.remove("_id");
	}
	if doc.rev().is_empty() {
		obj.remove("_rev");
	}
	Ok(value)
}

pub fn from_value<T: Doc>(value: Value) -> Result<T, CouchError> {
	Ok(serde_json::from_value(value)?)
}

/// Reads the `_id` of a raw document.
pub fn doc_id(doc: &Value) -> &str {
	doc.get("_id").and_then(Value::as_str).unwrap_or_default()
}

/// Reads the `_rev` of a raw document.
pub fn doc_rev(doc: &Value) -> &str {
	doc.get("_rev").and_then(Value::as_str).unwrap_or_default()
}

pub fn is_tombstone(doc: &Value) -> bool {
	doc.get("_deleted").and_then(Value::as_bool).unwrap_or(false)
}

/// Builds a tombstone document for the given id and revision.
pub fn tombstone(id: &str, rev: &str) -> Value {
	let mut m = Map::new();
	m.insert("_id".to_owned(), Value::String(id.to_owned()));
	m.insert("_rev".to_owned(), Value::String(rev.to_owned()));
	m.insert("_deleted".to_owned(), Value::Bool(true));
	Value::Object(m)
}
