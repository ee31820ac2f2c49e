//! Per-instance realtime event hub.
//!
//! Events are published after the store write succeeds; subscribers see a
//! monotonically increasing sequence per instance.

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
	#[serde(rename = "CREATED")]
	Created,
	#[serde(rename = "UPDATED")]
	Updated,
	#[serde(rename = "DELETED")]
	Deleted,
}

#[derive(Debug, Clone)]
pub struct Event {
	pub seq: u64,
	pub domain: String,
	pub verb: Verb,
	pub doctype: String,
	pub id: String,
	pub doc: Value,
	pub old_doc: Option<Value>,
}

#[derive(Clone)]
pub struct Hub {
	domain: String,
	seq: Arc<AtomicU64>,
	tx: broadcast::Sender<Arc<Event>>,
}

impl Hub {
	pub fn new(domain: impl Into<String>) -> Self {
		let (tx, _) = broadcast::channel(256);
		Self {
			domain: domain.into(),
			seq: Arc::new(AtomicU64::new(0)),
			tx,
		}
	}

	pub fn publish(&self, verb: Verb, doctype: &str, id: &str, doc: Value, old_doc: Option<Value>) {
		let event = Event {
			seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
			domain: self.domain.clone(),
			verb,
			doctype: doctype.to_owned(),
			id: id.to_owned(),
			doc,
			old_doc,
		};
		// A send error only means nobody is listening right now.
		let _ = self.tx.send(Arc::new(event));
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
		self.tx.subscribe()
	}
}
