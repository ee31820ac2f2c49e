//! The job broker: one bounded queue per worker type, drained by a pool
//! of workers with retry, backoff and timeout enforcement.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::instance::Instance;

use super::{worker, Job, JobError, JobRequest, State, WorkerFunc};

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
	pub worker_type: String,
	pub concurrency: usize,
	pub timeout: Duration,
	pub max_exec_count: u32,
	/// Initial retry backoff; doubled on each attempt, with jitter.
	pub retry_delay: Duration,
}

impl WorkerConfig {
	pub fn new(worker_type: impl Into<String>) -> Self {
		Self {
			worker_type: worker_type.into(),
			concurrency: 2,
			timeout: Duration::from_secs(60),
			max_exec_count: 3,
			retry_delay: Duration::from_millis(250),
		}
	}
}

pub(crate) struct QueueItem {
	pub instance: Arc<Instance>,
	pub job_id: String,
}

struct WorkerDef {
	config: WorkerConfig,
	tx: async_channel::Sender<QueueItem>,
}

/// Worker feedback routed back to the scheduler: trigger state updates
/// and `BadTrigger` deactivations.
pub struct TriggerFeedback {
	pub instance: Arc<Instance>,
	pub trigger_id: String,
	pub job: Job,
	pub bad_trigger: bool,
}

pub struct Broker {
	workers: HashMap<String, WorkerDef>,
	feedback_tx: mpsc::UnboundedSender<TriggerFeedback>,
	feedback_rx: Mutex<Option<mpsc::UnboundedReceiver<TriggerFeedback>>>,
	shutdown: CancellationToken,
}

impl Broker {
	pub fn new(workers: Vec<(WorkerConfig, WorkerFunc)>) -> Arc<Self> {
		let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
		let shutdown = CancellationToken::new();
		let mut defs = HashMap::new();
		for (config, func) in workers {
			let (tx, rx) = async_channel::bounded(QUEUE_CAPACITY);
			debug!(target: "job", worker = %config.worker_type, concurrency = config.concurrency, "registering worker");
			for _ in 0..config.concurrency.max(1) {
				tokio::spawn(worker::worker_loop(
					config.clone(),
					func.clone(),
					rx.clone(),
					tx.clone(),
					feedback_tx.clone(),
					shutdown.clone(),
				));
			}
			defs.insert(config.worker_type.clone(), WorkerDef { config, tx });
		}
		Arc::new(Self {
			workers: defs,
			feedback_tx,
			feedback_rx: Mutex::new(Some(feedback_rx)),
			shutdown,
		})
	}

	pub fn worker_defined(&self, worker_type: &str) -> bool {
		self.workers.contains_key(worker_type)
	}

	pub fn worker_config(&self, worker_type: &str) -> Option<&WorkerConfig> {
		self.workers.get(worker_type).map(|d| &d.config)
	}

	/// Persists a queued job and signals the matching worker queue.
	pub async fn push_job(
		&self,
		instance: &Arc<Instance>,
		req: JobRequest,
	) -> Result<Job, JobError> {
		if self.shutdown.is_cancelled() {
			return Err(JobError::Shutdown);
		}
		let def = self
			.workers
			.get(&req.worker_type)
			.ok_or_else(|| JobError::UnknownWorker(req.worker_type.clone()))?;
		let mut job = Job {
			doc_id: String::new(),
			doc_rev: String::new(),
			domain: instance.domain.clone(),
			worker_type: req.worker_type,
			trigger_id: req.trigger_id,
			message: req.message,
			event: req.event,
			manual: req.manual,
			options: req.options,
			state: State::Queued,
			queued_at: Utc::now(),
			started_at: None,
			finished_at: None,
			error: None,
			exec_count: 0,
		};
		instance.create_doc(&mut job).await?;
		debug!(target: "job", id = %job.doc_id, worker = %job.worker_type, "queued job");
		def.tx
			.send(QueueItem {
				instance: instance.clone(),
				job_id: job.doc_id.clone(),
			})
			.await
			.map_err(|_| JobError::Shutdown)?;
		Ok(job)
	}

	/// Marks a manual job as cancelled; the worker observes the state at
	/// its next suspension point through the job document.
	pub async fn cancel_job(&self, instance: &Arc<Instance>, job_id: &str) -> Result<(), JobError> {
		let mut job: Job = instance.get_doc(job_id).await?;
		if job.state == State::Queued || job.state == State::Running {
			job.state = State::Cancelled;
			job.finished_at = Some(Utc::now());
			instance.update_doc(&mut job).await?;
		}
		Ok(())
	}

	pub(crate) fn feedback_sender(&self) -> mpsc::UnboundedSender<TriggerFeedback> {
		self.feedback_tx.clone()
	}

	/// Hands the feedback stream to the scheduler; can only be taken once.
	pub async fn take_feedback(&self) -> Option<mpsc::UnboundedReceiver<TriggerFeedback>> {
		self.feedback_rx.lock().await.take()
	}

	/// Stops taking jobs and releases the worker pools.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		for def in self.workers.values() {
			def.tx.close();
		}
	}
}

/// The event payload attached to a job fired with a debounced trigger.
pub fn combined_event(mode: &str, payloads: Vec<Value>) -> Option<Value> {
	match mode {
		// Keep the first payload, drop later ones.
		"original" => payloads.into_iter().next().filter(|p| !p.is_null()),
		// Fire with no payload at all.
		"recreate" => None,
		// Fire with the accumulated payloads, in order.
		_ => Some(Value::Array(payloads)),
	}
}
