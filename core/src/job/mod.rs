//! Background jobs: triggers, broker and workers.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
	couch::{impl_doc, CouchError, JOBS},
	instance::Instance,
};

pub mod broker;
pub mod scheduler;
pub mod trigger;
mod worker;

pub use broker::{Broker, TriggerFeedback, WorkerConfig};
pub use scheduler::Scheduler;
pub use trigger::{TriggerInfos, TriggerState};

#[derive(Debug, Error)]
pub enum JobError {
	#[error("unknown worker type: {0}")]
	UnknownWorker(String),
	#[error("unknown trigger type: {0}")]
	UnknownTrigger(String),
	#[error("invalid trigger arguments: {0}")]
	InvalidTrigger(String),
	#[error("trigger is invalid: {0}")]
	BadTrigger(String),
	#[error("job deadline exceeded")]
	DeadlineExceeded,
	#[error("trigger not found: {0}")]
	TriggerNotFound(String),
	#[error("the job system is shutting down")]
	Shutdown,
	#[error(transparent)]
	Couch(#[from] CouchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
	Queued,
	Running,
	Done,
	Errored,
	Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
	/// Per-job timeout in seconds, overriding the worker default.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout: Option<u64>,
	/// Max executions, overriding the worker default.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_exec_count: Option<u32>,
}

/// One unit of work, persisted as an `io.cozy.jobs` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	pub doc_id: String,
	#[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
	pub doc_rev: String,
	pub domain: String,
	#[serde(rename = "worker")]
	pub worker_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub trigger_id: Option<String>,
	#[serde(default, skip_serializing_if = "Value::is_null")]
	pub message: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub event: Option<Value>,
	#[serde(default)]
	pub manual: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub options: Option<JobOptions>,
	pub state: State,
	pub queued_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub started_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finished_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default)]
	pub exec_count: u32,
}

impl_doc!(Job, JOBS);

/// What a trigger (or a manual launch) asks the broker to run.
#[derive(Debug, Clone)]
pub struct JobRequest {
	pub worker_type: String,
	pub trigger_id: Option<String>,
	pub message: Value,
	pub event: Option<Value>,
	pub manual: bool,
	pub options: Option<JobOptions>,
}

impl JobRequest {
	pub fn new(worker_type: impl Into<String>, message: Value) -> Self {
		Self {
			worker_type: worker_type.into(),
			trigger_id: None,
			message,
			event: None,
			manual: false,
			options: None,
		}
	}
}

/// The context handed to a worker function. Long-running operations must
/// observe `cancel` at their suspension points.
#[derive(Clone)]
pub struct JobCtx {
	pub instance: Arc<Instance>,
	pub job_id: String,
	pub trigger_id: Option<String>,
	pub message: Value,
	pub event: Option<Value>,
	pub attempt: u32,
	pub cancel: CancellationToken,
}

pub type WorkerFunc =
	Arc<dyn Fn(JobCtx) -> BoxFuture<'static, Result<(), crate::Error>> + Send + Sync>;

/// The broker and the scheduler, wired together at startup.
pub struct JobSystem {
	pub broker: Arc<Broker>,
	pub scheduler: Arc<Scheduler>,
}

impl JobSystem {
	pub fn start(workers: Vec<(WorkerConfig, WorkerFunc)>, poll_interval: Duration) -> Arc<Self> {
		let broker = Broker::new(workers);
		let scheduler = Scheduler::start(broker.clone(), poll_interval);
		Arc::new(Self { broker, scheduler })
	}

	pub async fn shutdown(&self) {
		self.scheduler.shutdown().await;
		self.broker.shutdown().await;
	}
}
