//! The trigger scheduler: registers triggers, debounces their fires and
//! dispatches job requests to the broker.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	couch::{Selector, Store, JOBS},
	instance::Instance,
	realtime::Event,
};

use super::{
	broker::combined_event, trigger::TriggerKind, Broker, Job, JobError, State, TriggerInfos,
	TriggerState,
};

struct Entry {
	instance: Arc<Instance>,
	infos: TriggerInfos,
	kind: TriggerKind,
	next_at: Option<DateTime<Utc>>,
	tasks: Vec<tokio::task::JoinHandle<()>>,
	debounce_tx: Option<mpsc::UnboundedSender<Value>>,
}

pub struct Scheduler {
	broker: Arc<Broker>,
	entries: Mutex<HashMap<String, Entry>>,
	shutdown: CancellationToken,
}

impl Scheduler {
	/// Starts the scheduler on the given broker: a periodic poll for the
	/// time-based triggers, and a consumer for the worker feedback.
	pub fn start(broker: Arc<Broker>, poll_interval: Duration) -> Arc<Self> {
		let scheduler = Arc::new(Self {
			broker,
			entries: Mutex::new(HashMap::new()),
			shutdown: CancellationToken::new(),
		});

		let poller = scheduler.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(poll_interval);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = poller.shutdown.cancelled() => break,
					_ = tick.tick() => poller.poll(Utc::now()).await,
				}
			}
		});

		let feedback = scheduler.clone();
		tokio::spawn(async move {
			let Some(mut rx) = feedback.broker.take_feedback().await else {
				return;
			};
			loop {
				tokio::select! {
					_ = feedback.shutdown.cancelled() => break,
					msg = rx.recv() => match msg {
						None => break,
						Some(fb) => feedback.handle_feedback(fb).await,
					},
				}
			}
		});

		scheduler
	}

	/// Registers a trigger, persisting its document when new.
	pub async fn add_trigger(
		&self,
		instance: &Arc<Instance>,
		mut infos: TriggerInfos,
	) -> Result<TriggerInfos, JobError> {
		let now = Utc::now();
		let kind = TriggerKind::parse(&infos, now)?;
		if !self.broker.worker_defined(&infos.worker_type) {
			return Err(JobError::UnknownWorker(infos.worker_type.clone()));
		}
		if infos.doc_rev.is_empty() {
			instance.create_doc(&mut infos).await?;
		}
		debug!(target: "job", id = %infos.doc_id, kind = %infos.kind, worker = %infos.worker_type, "adding trigger");

		let mut entry = Entry {
			instance: instance.clone(),
			infos: infos.clone(),
			kind: kind.clone(),
			next_at: kind.next_at(now),
			tasks: Vec::new(),
			debounce_tx: None,
		};

		if let Some(interval) = infos.debounce_duration() {
			let (tx, rx) = mpsc::unbounded_channel();
			entry.debounce_tx = Some(tx);
			entry.tasks.push(tokio::spawn(debouncer(
				self.broker.clone(),
				instance.clone(),
				infos.clone(),
				interval,
				rx,
			)));
		}

		if let TriggerKind::Event(filters) = &kind {
			// Subscribe before returning, so no event published after
			// registration can be missed.
			let rx = instance.realtime.subscribe();
			entry.tasks.push(tokio::spawn(event_subscription(
				self.broker.clone(),
				instance.clone(),
				infos.clone(),
				filters.clone(),
				rx,
				entry.debounce_tx.clone(),
				self.shutdown.child_token(),
			)));
		}

		self.entries.lock().await.insert(infos.doc_id.clone(), entry);
		Ok(infos)
	}

	pub async fn get_trigger(&self, id: &str) -> Result<TriggerInfos, JobError> {
		let entries = self.entries.lock().await;
		entries
			.get(id)
			.map(|e| e.infos.clone())
			.ok_or_else(|| JobError::TriggerNotFound(id.to_owned()))
	}

	/// Changes the schedule of a cron-like trigger.
	pub async fn update_cron(
		&self,
		instance: &Arc<Instance>,
		id: &str,
		arguments: &str,
	) -> Result<(), JobError> {
		let mut entries = self.entries.lock().await;
		let entry = entries
			.get_mut(id)
			.ok_or_else(|| JobError::TriggerNotFound(id.to_owned()))?;
		let mut infos = entry.infos.clone();
		infos.arguments = arguments.to_owned();
		let kind = TriggerKind::parse(&infos, Utc::now())?;
		instance.update_doc(&mut infos).await?;
		entry.next_at = kind.next_at(Utc::now());
		entry.kind = kind;
		entry.infos = infos;
		Ok(())
	}

	/// Unregisters a trigger and deletes its document.
	pub async fn delete_trigger(&self, instance: &Arc<Instance>, id: &str) -> Result<(), JobError> {
		if let Some(entry) = self.entries.lock().await.remove(id) {
			for task in entry.tasks {
				task.abort();
			}
		}
		match instance.get_doc::<TriggerInfos>(id).await {
			Ok(infos) => {
				instance.delete_doc(&infos).await?;
				Ok(())
			}
			Err(e) if e.is_not_found() => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// All the registered triggers of an instance, optionally filtered by
	/// worker type.
	pub async fn get_all_triggers(
		&self,
		instance: &Arc<Instance>,
		worker_type: Option<&str>,
	) -> Vec<TriggerInfos> {
		let entries = self.entries.lock().await;
		entries
			.values()
			.filter(|e| e.instance.domain == instance.domain)
			.filter(|e| worker_type.map_or(true, |w| e.infos.worker_type == w))
			.map(|e| e.infos.clone())
			.collect()
	}

	/// One poll round: fires every time-based trigger that is due and
	/// recomputes its next occurrence. One-shot triggers are deleted after
	/// firing.
	pub async fn poll(&self, now: DateTime<Utc>) {
		let mut due = Vec::new();
		{
			let mut entries = self.entries.lock().await;
			for (id, entry) in entries.iter_mut() {
				let Some(next) = entry.next_at else { continue };
				if next > now {
					continue;
				}
				due.push((id.clone(), entry.instance.clone(), entry.infos.clone()));
				entry.next_at = if entry.kind.is_one_shot() {
					None
				} else {
					entry.kind.next_at(now)
				};
			}
		}
		for (id, instance, infos) in due {
			info!(target: "job", id = %id, kind = %infos.kind, "trigger fired");
			fire(&self.broker, &instance, &infos, None).await;
			let one_shot = {
				let entries = self.entries.lock().await;
				entries.get(&id).map(|e| e.kind.is_one_shot()).unwrap_or(false)
			};
			if one_shot {
				if let Err(e) = self.delete_trigger(&instance, &id).await {
					warn!(target: "job", id = %id, "cannot delete one-shot trigger: {e}");
				}
			}
		}
	}

	/// Fires a `@webhook` trigger from an external HTTP POST.
	pub async fn fire_webhook(&self, id: &str, payload: Value) -> Result<(), JobError> {
		let (instance, infos, debounce_tx) = {
			let entries = self.entries.lock().await;
			let entry = entries
				.get(id)
				.ok_or_else(|| JobError::TriggerNotFound(id.to_owned()))?;
			if !matches!(entry.kind, TriggerKind::Webhook) {
				return Err(JobError::InvalidTrigger("not a webhook trigger".to_owned()));
			}
			(entry.instance.clone(), entry.infos.clone(), entry.debounce_tx.clone())
		};
		match debounce_tx {
			Some(tx) => {
				let _ = tx.send(payload);
			}
			None => fire(&self.broker, &instance, &infos, Some(payload)).await,
		}
		Ok(())
	}

	/// Launches a job for a trigger outside of its own schedule (`@client`
	/// triggers only ever fire this way).
	pub async fn launch(&self, id: &str) -> Result<Job, JobError> {
		let (instance, infos) = {
			let entries = self.entries.lock().await;
			let entry = entries
				.get(id)
				.ok_or_else(|| JobError::TriggerNotFound(id.to_owned()))?;
			(entry.instance.clone(), entry.infos.clone())
		};
		let mut req = infos.job_request();
		req.manual = true;
		self.broker.push_job(&instance, req).await
	}

	async fn handle_feedback(&self, fb: super::TriggerFeedback) {
		if fb.bad_trigger {
			warn!(target: "job", id = %fb.trigger_id, "deactivating bad trigger");
			if let Err(e) = self.delete_trigger(&fb.instance, &fb.trigger_id).await {
				warn!(target: "job", id = %fb.trigger_id, "cannot delete trigger: {e}");
			}
			return;
		}
		let mut entries = self.entries.lock().await;
		let Some(entry) = entries.get_mut(&fb.trigger_id) else {
			return;
		};
		let mut state = entry.infos.current_state.clone().unwrap_or_default();
		state.trigger_id = fb.trigger_id.clone();
		state.record(&fb.job);
		entry.infos.current_state = Some(state);
		let mut infos = entry.infos.clone();
		match fb.instance.update_doc(&mut infos).await {
			Ok(()) => entry.infos = infos,
			Err(e) => warn!(target: "job", id = %fb.trigger_id, "cannot update trigger state: {e}"),
		}
	}

	/// Stops taking fires and releases the handle on the broker.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		let mut entries = self.entries.lock().await;
		for (_, entry) in entries.drain() {
			for task in entry.tasks {
				task.abort();
			}
		}
	}
}

async fn fire(
	broker: &Arc<Broker>,
	instance: &Arc<Instance>,
	infos: &TriggerInfos,
	event: Option<Value>,
) {
	let mut req = infos.job_request();
	req.event = event;
	if let Err(e) = broker.push_job(instance, req).await {
		warn!(target: "job", trigger = %infos.doc_id, "cannot push job: {e}");
	}
}

fn event_payload(event: &Event) -> Value {
	json!({
		"domain": event.domain,
		"verb": event.verb,
		"doctype": event.doctype,
		"id": event.id,
		"doc": event.doc,
		"old": event.old_doc,
	})
}

async fn event_subscription(
	broker: Arc<Broker>,
	instance: Arc<Instance>,
	infos: TriggerInfos,
	filters: Vec<super::trigger::EventFilter>,
	mut rx: tokio::sync::broadcast::Receiver<Arc<crate::realtime::Event>>,
	debounce_tx: Option<mpsc::UnboundedSender<Value>>,
	shutdown: CancellationToken,
) {
	loop {
		let event = tokio::select! {
			_ = shutdown.cancelled() => break,
			event = rx.recv() => match event {
				Ok(event) => event,
				Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
					warn!(target: "job", trigger = %infos.doc_id, "event subscription lagged by {n}");
					continue;
				}
				Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
			},
		};
		if !filters.iter().any(|f| f.matches(&event)) {
			continue;
		}
		let payload = event_payload(&event);
		match &debounce_tx {
			Some(tx) => {
				if tx.send(payload).is_err() {
					break;
				}
			}
			None => fire(&broker, &instance, &infos, Some(payload)).await,
		}
	}
}

/// Coalesces fires happening within the debounce interval: the job is
/// pushed once the stream of fires has been quiet for the interval.
async fn debouncer(
	broker: Arc<Broker>,
	instance: Arc<Instance>,
	infos: TriggerInfos,
	interval: Duration,
	mut rx: mpsc::UnboundedReceiver<Value>,
) {
	while let Some(first) = rx.recv().await {
		let mut payloads = vec![first];
		loop {
			tokio::select! {
				more = rx.recv() => match more {
					Some(payload) => payloads.push(payload),
					None => break,
				},
				_ = tokio::time::sleep(interval) => break,
			}
		}
		let event = combined_event(infos.combine_mode(), payloads);
		fire(&broker, &instance, &infos, event).await;
	}
}

/// Recomputes the state of a trigger from the jobs it launched.
pub async fn get_trigger_state(
	instance: &Arc<Instance>,
	trigger_id: &str,
) -> Result<TriggerState, JobError> {
	let docs = instance
		.store
		.find(JOBS, &Selector::Eq("trigger_id".into(), json!(trigger_id)), 0)
		.await?;
	let mut jobs: Vec<Job> = docs
		.into_iter()
		.filter_map(|doc| serde_json::from_value(doc).ok())
		.collect();
	jobs.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));

	let mut state = TriggerState {
		trigger_id: trigger_id.to_owned(),
		status: Some(State::Done),
		..Default::default()
	};
	for job in &jobs {
		if job.state == State::Done || job.state == State::Errored {
			state.record(job);
		}
	}
	Ok(state)
}
