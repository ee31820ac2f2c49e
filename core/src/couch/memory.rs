//! In-memory document store with revision-tree semantics: winner
//! election, tombstones, forced writes and a monotonic changes feed.

use std::collections::HashMap;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
	revision::{self, RevTree},
	Change, ChangesRequest, ChangesResponse, CouchError, Selector, Store,
};

#[derive(Default)]
pub struct MemStore {
	dbs: RwLock<HashMap<String, Db>>,
}

#[derive(Default)]
struct Db {
	records: HashMap<String, Record>,
	seq: u64,
	log: Vec<(u64, String)>,
	last_change: HashMap<String, u64>,
}

struct Record {
	tree: RevTree,
	bodies: HashMap<String, Value>,
	deleted: HashMap<String, bool>,
}

impl Record {
	/// The winning leaf: live leaves beat tombstones, then the usual
	/// generation/lexicographic order applies.
	fn winner(&self) -> (String, bool) {
		let leaves = self.tree.leaves();
		let live = leaves
			.iter()
			.filter(|rev| !self.is_deleted(rev))
			.max_by(|a, b| revision::compare(a, b));
		match live {
			Some(rev) => ((*rev).to_owned(), false),
			None => {
				let rev = leaves
					.into_iter()
					.max_by(|a, b| revision::compare(a, b))
					.expect("a revision tree always has at least one leaf");
				(rev.to_owned(), true)
			}
		}
	}

	fn is_deleted(&self, rev: &str) -> bool {
		self.deleted.get(rev).copied().unwrap_or(false)
	}

	fn current_doc(&self, id: &str) -> Option<Value> {
		let (rev, deleted) = self.winner();
		if deleted {
			return None;
		}
		let mut doc = self.bodies.get(&rev)?.clone();
		let obj = doc.as_object_mut()?;
		obj.insert("_id".to_owned(), Value::String(id.to_owned()));
		obj.insert("_rev".to_owned(), Value::String(rev));
		Some(doc)
	}
}

impl Db {
	fn log_change(&mut self, id: &str) {
		self.seq += 1;
		self.log.push((self.seq, id.to_owned()));
		self.last_change.insert(id.to_owned(), self.seq);
	}
}

impl MemStore {
	pub fn new() -> Self {
		Self::default()
	}
}

fn new_rev(generation: u64, parent: &str, body: &Value) -> String {
	let mut hasher = Md5::new();
	hasher.update(parent.as_bytes());
	hasher.update(body.to_string().as_bytes());
	format!("{generation}-{}", hex::encode(hasher.finalize()))
}

fn strip_meta(doc: &mut Value) {
	if let Some(obj) = doc.as_object_mut() {
		obj.remove("_id");
		obj.remove("_rev");
		obj.remove("_revisions");
	}
}

#[async_trait]
impl Store for MemStore {
	async fn get(&self, doctype: &str, id: &str) -> Result<Value, CouchError> {
		let dbs = self.dbs.read().await;
		let record = dbs
			.get(doctype)
			.and_then(|db| db.records.get(id))
			.ok_or_else(|| CouchError::NotFound {
				doctype: doctype.to_owned(),
				id: id.to_owned(),
			})?;
		record.current_doc(id).ok_or_else(|| CouchError::Deleted {
			doctype: doctype.to_owned(),
			id: id.to_owned(),
		})
	}

	async fn get_with_revs(
		&self,
		doctype: &str,
		id: &str,
	) -> Result<(Value, Vec<String>), CouchError> {
		let dbs = self.dbs.read().await;
		let record = dbs
			.get(doctype)
			.and_then(|db| db.records.get(id))
			.ok_or_else(|| CouchError::NotFound {
				doctype: doctype.to_owned(),
				id: id.to_owned(),
			})?;
		let doc = record.current_doc(id).ok_or_else(|| CouchError::Deleted {
			doctype: doctype.to_owned(),
			id: id.to_owned(),
		})?;
		let (winner, _) = record.winner();
		let mut chain = record.tree.winner_chain();
		if chain.last() != Some(&winner) {
			// The tree winner and the live winner can diverge when the
			// longest branch ends in a tombstone.
			chain = vec![winner];
		}
		Ok((doc, chain))
	}

	async fn put(&self, doctype: &str, mut doc: Value) -> Result<(String, String), CouchError> {
		let id = match doc.get("_id").and_then(Value::as_str) {
			Some(id) => id.to_owned(),
			None => cozy_utils::new_doc_id(),
		};
		let given_rev = doc
			.get("_rev")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_owned();
		strip_meta(&mut doc);

		let mut dbs = self.dbs.write().await;
		let db = dbs.entry(doctype.to_owned()).or_default();
		let rev = match db.records.get_mut(&id) {
			None => {
				if !given_rev.is_empty() {
					return Err(CouchError::Conflict {
						doctype: doctype.to_owned(),
						id,
					});
				}
				let rev = new_rev(1, "", &doc);
				let mut record = Record {
					tree: RevTree::new(rev.clone()),
					bodies: HashMap::new(),
					deleted: HashMap::new(),
				};
				record.bodies.insert(rev.clone(), doc);
				db.records.insert(id.clone(), record);
				rev
			}
			Some(record) => {
				let (winner, deleted) = record.winner();
				// A new edit must target the winner; writing over a
				// tombstone extends its chain.
				if given_rev != winner && !(deleted && given_rev.is_empty()) {
					return Err(CouchError::Conflict {
						doctype: doctype.to_owned(),
						id,
					});
				}
				let rev = new_rev(revision::generation(&winner) + 1, &winner, &doc);
				record.tree.add(&rev, &winner);
				record.bodies.insert(rev.clone(), doc);
				rev
			}
		};
		db.log_change(&id);
		Ok((id, rev))
	}

	async fn force_put(
		&self,
		doctype: &str,
		mut doc: Value,
		chain: &[String],
	) -> Result<(), CouchError> {
		let tip = chain
			.last()
			.ok_or_else(|| CouchError::InvalidDoc("empty revision chain".to_owned()))?
			.clone();
		let id = super::doc_id(&doc).to_owned();
		if id.is_empty() {
			return Err(CouchError::InvalidDoc("forced write without _id".to_owned()));
		}
		let deleted = super::is_tombstone(&doc);
		strip_meta(&mut doc);

		let mut dbs = self.dbs.write().await;
		let db = dbs.entry(doctype.to_owned()).or_default();
		match db.records.get_mut(&id) {
			None => {
				let tree = RevTree::chain(chain).expect("chain is not empty");
				let mut record = Record {
					tree,
					bodies: HashMap::new(),
					deleted: HashMap::new(),
				};
				record.bodies.insert(tip.clone(), doc);
				record.deleted.insert(tip, deleted);
				db.records.insert(id.clone(), record);
			}
			Some(record) => {
				record.tree.insert_chain(chain);
				record.bodies.insert(tip.clone(), doc);
				record.deleted.insert(tip, deleted);
			}
		}
		db.log_change(&id);
		Ok(())
	}

	async fn delete(&self, doctype: &str, id: &str, rev: &str) -> Result<String, CouchError> {
		let mut dbs = self.dbs.write().await;
		let db = dbs
			.get_mut(doctype)
			.ok_or_else(|| CouchError::NotFound {
				doctype: doctype.to_owned(),
				id: id.to_owned(),
			})?;
		let record = db.records.get_mut(id).ok_or_else(|| CouchError::NotFound {
			doctype: doctype.to_owned(),
			id: id.to_owned(),
		})?;
		let (winner, _) = record.winner();
		if rev != winner {
			return Err(CouchError::Conflict {
				doctype: doctype.to_owned(),
				id: id.to_owned(),
			});
		}
		let body = Value::Object(Default::default());
		let tombstone = new_rev(revision::generation(&winner) + 1, &winner, &body);
		record.tree.add(&tombstone, &winner);
		record.bodies.insert(tombstone.clone(), body);
		record.deleted.insert(tombstone.clone(), true);
		db.log_change(id);
		Ok(tombstone)
	}

	async fn bulk_get(
		&self,
		doctype: &str,
		ids: &[(String, String)],
	) -> Result<Vec<Value>, CouchError> {
		let dbs = self.dbs.read().await;
		let Some(db) = dbs.get(doctype) else {
			return Ok(Vec::new());
		};
		let mut out = Vec::new();
		for (id, rev) in ids {
			let Some(record) = db.records.get(id) else {
				continue;
			};
			let Some(body) = record.bodies.get(rev) else {
				continue;
			};
			let mut doc = body.clone();
			if let Some(obj) = doc.as_object_mut() {
				obj.insert("_id".to_owned(), Value::String(id.clone()));
				obj.insert("_rev".to_owned(), Value::String(rev.clone()));
				if record.is_deleted(rev) {
					obj.insert("_deleted".to_owned(), Value::Bool(true));
				}
			}
			out.push(doc);
		}
		Ok(out)
	}

	async fn changes(&self, req: &ChangesRequest) -> Result<ChangesResponse, CouchError> {
		let dbs = self.dbs.read().await;
		let Some(db) = dbs.get(&req.doctype) else {
			return Ok(ChangesResponse::default());
		};
		let limit = if req.limit == 0 { usize::MAX } else { req.limit };
		let mut results = Vec::new();
		let mut last_seq = db.seq;
		let mut truncated = false;
		for (seq, id) in db.log.iter().filter(|(seq, _)| *seq > req.since) {
			// Only the latest change of each document is surfaced.
			if db.last_change.get(id) != Some(seq) {
				continue;
			}
			if results.len() >= limit {
				truncated = true;
				break;
			}
			let record = &db.records[id];
			let (winner, deleted) = record.winner();
			let doc = if req.include_docs {
				if deleted {
					Some(super::tombstone(id, &winner))
				} else {
					record.current_doc(id)
				}
			} else {
				None
			};
			results.push(Change {
				seq: *seq,
				id: id.clone(),
				deleted,
				changes: record.tree.leaves().into_iter().map(str::to_owned).collect(),
				doc,
			});
			last_seq = *seq;
		}
		let pending = if truncated {
			db.log
				.iter()
				.filter(|(seq, id)| *seq > last_seq && db.last_change.get(id) == Some(seq))
				.count()
		} else {
			0
		};
		Ok(ChangesResponse {
			last_seq,
			pending,
			results,
		})
	}

	async fn find(
		&self,
		doctype: &str,
		selector: &Selector,
		limit: usize,
	) -> Result<Vec<Value>, CouchError> {
		let docs = self.all_docs(doctype).await?;
		let limit = if limit == 0 { usize::MAX } else { limit };
		Ok(docs
			.into_iter()
			.filter(|doc| selector.matches(doc))
			.take(limit)
			.collect())
	}

	async fn all_docs(&self, doctype: &str) -> Result<Vec<Value>, CouchError> {
		let dbs = self.dbs.read().await;
		let Some(db) = dbs.get(doctype) else {
			return Ok(Vec::new());
		};
		let mut ids: Vec<&String> = db.records.keys().collect();
		ids.sort();
		Ok(ids
			.into_iter()
			.filter_map(|id| db.records[id].current_doc(id))
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn put_get_update_delete() {
		let store = MemStore::new();
		let (id, rev1) = store
			.put(super::super::FILES, json!({"name": "hello"}))
			.await
			.unwrap();
		assert_eq!(revision::generation(&rev1), 1);

		let doc = store.get(super::super::FILES, &id).await.unwrap();
		assert_eq!(doc["name"], "hello");

		// Updating with a stale revision conflicts.
		let err = store
			.put(
				super::super::FILES,
				json!({"_id": id, "_rev": "1-bogus", "name": "hi"}),
			)
			.await
			.unwrap_err();
		assert!(err.is_conflict());

		let (_, rev2) = store
			.put(
				super::super::FILES,
				json!({"_id": id, "_rev": rev1, "name": "hi"}),
			)
			.await
			.unwrap();
		assert_eq!(revision::generation(&rev2), 2);

		let tombstone = store.delete(super::super::FILES, &id, &rev2).await.unwrap();
		assert_eq!(revision::generation(&tombstone), 3);
		assert!(store.get(super::super::FILES, &id).await.unwrap_err().is_deleted());
	}

	#[tokio::test]
	async fn force_put_is_idempotent() {
		let store = MemStore::new();
		let chain = vec!["1-aaa".to_owned(), "2-bbb".to_owned()];
		let doc = json!({"_id": "doc1", "name": "forced"});
		store
			.force_put(super::super::FILES, doc.clone(), &chain)
			.await
			.unwrap();
		store
			.force_put(super::super::FILES, doc, &chain)
			.await
			.unwrap();

		let (doc, revs) = store
			.get_with_revs(super::super::FILES, "doc1")
			.await
			.unwrap();
		assert_eq!(doc["_rev"], "2-bbb");
		assert_eq!(revs, chain);
	}

	#[tokio::test]
	async fn changes_feed_dedups_and_paginates() {
		let store = MemStore::new();
		let (id1, _) = store.put("io.cozy.test", json!({"i": 1})).await.unwrap();
		let (_, _) = store.put("io.cozy.test", json!({"i": 2})).await.unwrap();
		let doc1 = store.get("io.cozy.test", &id1).await.unwrap();
		store.put("io.cozy.test", doc1).await.unwrap();

		let res = store
			.changes(&ChangesRequest {
				doctype: "io.cozy.test".to_owned(),
				since: 0,
				limit: 1,
				include_docs: true,
			})
			.await
			.unwrap();
		// The first change of doc1 was superseded by its update.
		assert_eq!(res.results.len(), 1);
		assert_ne!(res.results[0].id, id1);
		assert_eq!(res.pending, 1);

		let res = store
			.changes(&ChangesRequest {
				doctype: "io.cozy.test".to_owned(),
				since: res.last_seq,
				limit: 10,
				include_docs: false,
			})
			.await
			.unwrap();
		assert_eq!(res.results.len(), 1);
		assert_eq!(res.results[0].id, id1);
		assert_eq!(res.pending, 0);
	}
}
