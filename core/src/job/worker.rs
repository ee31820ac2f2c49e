//! The worker loop: pops queued jobs, runs the worker function with a
//! cancellable context, and publishes the outcome.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::instance::Instance;

use super::{
	broker::{QueueItem, TriggerFeedback, WorkerConfig},
	Job, JobCtx, JobError, State, WorkerFunc,
};

pub(crate) async fn worker_loop(
	config: WorkerConfig,
	func: WorkerFunc,
	rx: async_channel::Receiver<QueueItem>,
	requeue_tx: async_channel::Sender<QueueItem>,
	feedback: mpsc::UnboundedSender<TriggerFeedback>,
	shutdown: CancellationToken,
) {
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => break,
			item = rx.recv() => match item {
				Err(_) => break,
				Ok(item) => run_one(&config, &func, item, &requeue_tx, &feedback).await,
			},
		}
	}
}

async fn run_one(
	config: &WorkerConfig,
	func: &WorkerFunc,
	item: QueueItem,
	requeue_tx: &async_channel::Sender<QueueItem>,
	feedback: &mpsc::UnboundedSender<TriggerFeedback>,
) {
	let instance = item.instance;
	let mut job: Job = match instance.get_doc(&item.job_id).await {
		Ok(job) => job,
		Err(e) => {
			warn!(target: "job", id = %item.job_id, "cannot load job: {e}");
			return;
		}
	};
	if job.state == State::Cancelled {
		return;
	}

	job.state = State::Running;
	job.started_at = Some(Utc::now());
	job.exec_count += 1;
	if let Err(e) = save(&instance, &mut job).await {
		warn!(target: "job", id = %job.doc_id, "cannot update job: {e}");
		return;
	}

	let ctx = JobCtx {
		instance: instance.clone(),
		job_id: job.doc_id.clone(),
		trigger_id: job.trigger_id.clone(),
		message: job.message.clone(),
		event: job.event.clone(),
		attempt: job.exec_count,
		cancel: CancellationToken::new(),
	};
	let timeout = job
		.options
		.and_then(|o| o.timeout)
		.map(Duration::from_secs)
		.unwrap_or(config.timeout);

	debug!(target: "job", id = %job.doc_id, worker = %job.worker_type, attempt = job.exec_count, "running job");
	let result = tokio::select! {
		res = func(ctx.clone()) => res,
		_ = tokio::time::sleep(timeout) => {
			// The context signals the deadline; in-flight work is aborted.
			ctx.cancel.cancel();
			Err(crate::Error::Job(JobError::DeadlineExceeded))
		}
	};

	// A manual cancellation may have landed while we were running.
	if let Ok(current) = instance.get_doc::<Job>(&job.doc_id).await {
		if current.state == State::Cancelled {
			info!(target: "job", id = %job.doc_id, "job was cancelled");
			return;
		}
		job.doc_rev = current.doc_rev;
	}

	match result {
		Ok(()) => {
			job.state = State::Done;
			job.error = None;
			job.finished_at = Some(Utc::now());
			if let Err(e) = save(&instance, &mut job).await {
				warn!(target: "job", id = %job.doc_id, "cannot update job: {e}");
			}
			send_feedback(feedback, &instance, &job, false);
		}
		Err(e) => {
			let bad_trigger = matches!(&e, crate::Error::Job(JobError::BadTrigger(_)));
			job.error = Some(e.to_string());
			let max = job
				.options
				.and_then(|o| o.max_exec_count)
				.unwrap_or(config.max_exec_count);
			if !bad_trigger && job.exec_count < max {
				warn!(target: "job", id = %job.doc_id, "job errored, will retry: {e}");
				job.state = State::Queued;
				if let Err(e) = save(&instance, &mut job).await {
					warn!(target: "job", id = %job.doc_id, "cannot update job: {e}");
					return;
				}
				requeue_later(
					requeue_tx.clone(),
					QueueItem {
						instance: instance.clone(),
						job_id: job.doc_id.clone(),
					},
					backoff(config.retry_delay, job.exec_count),
				);
			} else {
				error!(target: "job", id = %job.doc_id, "job errored: {e}");
				job.state = State::Errored;
				job.finished_at = Some(Utc::now());
				if let Err(e) = save(&instance, &mut job).await {
					warn!(target: "job", id = %job.doc_id, "cannot update job: {e}");
				}
				send_feedback(feedback, &instance, &job, bad_trigger);
			}
		}
	}
}

async fn save(instance: &Arc<Instance>, job: &mut Job) -> Result<(), JobError> {
	match instance.update_doc(job).await {
		Err(e) if e.is_conflict() => {
			let current: Job = instance.get_doc(&job.doc_id).await?;
			job.doc_rev = current.doc_rev;
			Ok(instance.update_doc(job).await?)
		}
		other => Ok(other?),
	}
}

fn send_feedback(
	feedback: &mpsc::UnboundedSender<TriggerFeedback>,
	instance: &Arc<Instance>,
	job: &Job,
	bad_trigger: bool,
) {
	let Some(trigger_id) = &job.trigger_id else {
		return;
	};
	let _ = feedback.send(TriggerFeedback {
		instance: instance.clone(),
		trigger_id: trigger_id.clone(),
		job: job.clone(),
		bad_trigger,
	});
}

/// Exponential backoff with jitter.
fn backoff(initial: Duration, attempt: u32) -> Duration {
	let factor = 1u32 << (attempt.saturating_sub(1)).min(8);
	let base = initial * factor;
	let jitter = rand::thread_rng().gen_range(1.0..1.5);
	base.mul_f64(jitter)
}

fn requeue_later(tx: async_channel::Sender<QueueItem>, item: QueueItem, delay: Duration) {
	tokio::spawn(async move {
		tokio::time::sleep(delay).await;
		let _ = tx.send(item).await;
	});
}
