//! Triggers turn an external stimulus (time, event, HTTP) into a job
//! request.

use std::{
	collections::hash_map::DefaultHasher,
	hash::{Hash, Hasher},
	str::FromStr,
	time::Duration,
};

use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
	couch::{impl_doc, TRIGGERS},
	realtime::{Event, Verb},
};

use super::{Job, JobError, JobOptions, JobRequest, State};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerInfos {
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	pub doc_id: String,
	#[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
	pub doc_rev: String,
	pub domain: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(rename = "worker")]
	pub worker_type: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub arguments: String,
	/// Debounce interval, e.g. `2s`. Empty disables debouncing.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub debounce: String,
	/// How debounced fires are combined: `original`, `recreate` or
	/// `append`. Empty picks the default for the trigger kind.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub combine: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub options: Option<JobOptions>,
	#[serde(default, skip_serializing_if = "Value::is_null")]
	pub message: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub current_state: Option<TriggerState>,
}

impl_doc!(TriggerInfos, TRIGGERS);

impl TriggerInfos {
	pub fn new(
		domain: impl Into<String>,
		kind: &str,
		worker_type: &str,
		arguments: impl Into<String>,
		message: Value,
	) -> Self {
		Self {
			doc_id: String::new(),
			doc_rev: String::new(),
			domain: domain.into(),
			kind: kind.to_owned(),
			worker_type: worker_type.to_owned(),
			arguments: arguments.into(),
			debounce: String::new(),
			combine: String::new(),
			options: None,
			message: Value::Null,
			current_state: None,
		}
		.with_message(message)
	}

	fn with_message(mut self, message: Value) -> Self {
		self.message = message;
		self
	}

	pub fn job_request(&self) -> JobRequest {
		JobRequest {
			worker_type: self.worker_type.clone(),
			trigger_id: Some(self.doc_id.clone()),
			message: self.message.clone(),
			event: None,
			manual: false,
			options: self.options,
		}
	}

	pub fn debounce_duration(&self) -> Option<Duration> {
		if self.debounce.is_empty() {
			return None;
		}
		parse_duration(&self.debounce).ok()
	}

	/// The combination mode for debounced fires.
	pub fn combine_mode(&self) -> &str {
		if !self.combine.is_empty() {
			return &self.combine;
		}
		match self.kind.as_str() {
			"@event" => "append",
			"@webhook" => "original",
			_ => "recreate",
		}
	}
}

/// The current state of a trigger, recomputed from the jobs it launched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerState {
	#[serde(rename = "trigger_id", default)]
	pub trigger_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<State>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_success: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub last_successful_job_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_execution: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub last_executed_job_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_failure: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub last_failed_job_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub last_error: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_manual_execution: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub last_manual_job_id: String,
}

impl TriggerState {
	pub fn record(&mut self, job: &Job) {
		let at = job.started_at;
		self.status = Some(job.state);
		self.last_execution = at;
		self.last_executed_job_id = job.doc_id.clone();
		if job.manual {
			self.last_manual_execution = at;
			self.last_manual_job_id = job.doc_id.clone();
		}
		match job.state {
			State::Done => {
				self.last_success = at;
				self.last_successful_job_id = job.doc_id.clone();
			}
			State::Errored => {
				self.last_failure = at;
				self.last_failed_job_id = job.doc_id.clone();
				self.last_error = job.error.clone().unwrap_or_default();
			}
			_ => {}
		}
	}
}

/// A selector for `@event` triggers: `doctype` or `doctype:VERB1,VERB2`,
/// several selectors separated by spaces.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
	pub doctype: String,
	pub verbs: Vec<Verb>,
}

impl EventFilter {
	pub fn matches(&self, event: &Event) -> bool {
		if event.doctype != self.doctype {
			return false;
		}
		self.verbs.is_empty() || self.verbs.contains(&event.verb)
	}
}

/// The parsed, tagged form of a trigger.
#[derive(Debug, Clone)]
pub enum TriggerKind {
	/// Fires once at the given instant (`@at` and `@in`).
	At(DateTime<Utc>),
	/// Fires on a cron schedule (`@cron`, `@hourly`, `@daily`, `@weekly`,
	/// `@monthly`).
	Cron(Box<Schedule>),
	/// Fires periodically from registration.
	Every(Duration),
	/// Fires on matching realtime events.
	Event(Vec<EventFilter>),
	/// Fires on an external HTTP POST.
	Webhook,
	/// Never fires by itself; jobs are launched and driven by a client.
	Client,
}

impl TriggerKind {
	pub fn parse(infos: &TriggerInfos, now: DateTime<Utc>) -> Result<Self, JobError> {
		let args = infos.arguments.as_str();
		let invalid = |e: &dyn std::fmt::Display| JobError::InvalidTrigger(format!("{args}: {e}"));
		match infos.kind.as_str() {
			"@at" => {
				let at = DateTime::parse_from_rfc3339(args).map_err(|e| invalid(&e))?;
				Ok(TriggerKind::At(at.with_timezone(&Utc)))
			}
			"@in" => {
				let delay = parse_duration(args).map_err(|e| invalid(&e))?;
				let delay =
					chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
				Ok(TriggerKind::At(now + delay))
			}
			"@every" => Ok(TriggerKind::Every(parse_duration(args).map_err(|e| invalid(&e))?)),
			"@cron" => {
				let schedule = Schedule::from_str(args).map_err(|e| invalid(&e))?;
				Ok(TriggerKind::Cron(Box::new(schedule)))
			}
			"@hourly" | "@daily" | "@weekly" | "@monthly" => {
				let expr = spread_cron_expr(&infos.kind, &infos.domain);
				let schedule = Schedule::from_str(&expr).map_err(|e| invalid(&e))?;
				Ok(TriggerKind::Cron(Box::new(schedule)))
			}
			"@event" => {
				let mut filters = Vec::new();
				for part in args.split_whitespace() {
					let (doctype, verbs) = match part.split_once(':') {
						Some((doctype, verbs)) => {
							let verbs = verbs
								.split(',')
								.map(parse_verb)
								.collect::<Result<Vec<_>, _>>()
								.map_err(|e| invalid(&e))?;
							(doctype, verbs)
						}
						None => (part, Vec::new()),
					};
					filters.push(EventFilter {
						doctype: doctype.to_owned(),
						verbs,
					});
				}
				if filters.is_empty() {
					return Err(JobError::InvalidTrigger("empty event selector".to_owned()));
				}
				Ok(TriggerKind::Event(filters))
			}
			"@webhook" => Ok(TriggerKind::Webhook),
			"@client" => Ok(TriggerKind::Client),
			other => Err(JobError::UnknownTrigger(other.to_owned())),
		}
	}

	/// The next fire instant after `after`, `None` for non-time kinds.
	pub fn next_at(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
		match self {
			TriggerKind::At(at) => Some(*at),
			TriggerKind::Cron(schedule) => schedule
				.after(&after.with_timezone(&Local))
				.next()
				.map(|t| t.with_timezone(&Utc)),
			TriggerKind::Every(d) => Some(
				after + chrono::Duration::from_std(*d).unwrap_or_else(|_| chrono::Duration::zero()),
			),
			_ => None,
		}
	}

	pub fn is_one_shot(&self) -> bool {
		matches!(self, TriggerKind::At(_))
	}
}

fn parse_verb(s: &str) -> Result<Verb, String> {
	match s {
		"CREATED" => Ok(Verb::Created),
		"UPDATED" => Ok(Verb::Updated),
		"DELETED" => Ok(Verb::Deleted),
		other => Err(format!("unknown verb {other:?}")),
	}
}

/// Expands `@hourly`/`@daily`/`@weekly`/`@monthly` into a 6-field cron
/// expression whose slots are picked from a hash of the instance domain,
/// so a fleet of instances does not fire at the same instant.
fn spread_cron_expr(kind: &str, domain: &str) -> String {
	let mut hasher = DefaultHasher::new();
	domain.hash(&mut hasher);
	let h = hasher.finish();
	let sec = h % 60;
	let min = (h / 60) % 60;
	let hour = (h / 3600) % 6;
	let dow = (h / 7) % 7;
	let dom = 1 + (h / 31) % 28;
	match kind {
		"@hourly" => format!("{sec} {min} * * * *"),
		"@daily" => format!("{sec} {min} {hour} * * *"),
		"@weekly" => format!("{sec} {min} {hour} * * {dow}"),
		_ => format!("{sec} {min} {hour} {dom} * *"),
	}
}

/// Parses a duration like `300ms`, `10s`, `2m`, `1h30m` or `7d`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
	let mut total = Duration::ZERO;
	let mut num = String::new();
	let mut chars = s.chars().peekable();
	if s.is_empty() {
		return Err("empty duration".to_owned());
	}
	while let Some(c) = chars.next() {
		if c.is_ascii_digit() {
			num.push(c);
			continue;
		}
		let value: u64 = num.parse().map_err(|_| format!("invalid duration {s:?}"))?;
		num.clear();
		let unit = match c {
			'd' => Duration::from_secs(24 * 3600),
			'h' => Duration::from_secs(3600),
			's' => Duration::from_secs(1),
			'm' if chars.peek() == Some(&'s') => {
				chars.next();
				Duration::from_millis(1)
			}
			'm' => Duration::from_secs(60),
			_ => return Err(format!("invalid duration {s:?}")),
		};
		total += unit * value as u32;
	}
	if !num.is_empty() {
		// A bare number is seconds.
		let value: u64 = num.parse().map_err(|_| format!("invalid duration {s:?}"))?;
		total += Duration::from_secs(value);
	}
	Ok(total)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn infos(kind: &str, args: &str) -> TriggerInfos {
		TriggerInfos::new("alice.example.net", kind, "worker", args, Value::Null)
	}

	#[test]
	fn parse_durations() {
		assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
		assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
		assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
		assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
		assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
		assert!(parse_duration("nope").is_err());
	}

	#[test]
	fn parse_event_selectors() {
		let t = infos("@event", "io.cozy.files:CREATED,UPDATED io.cozy.shared");
		let kind = TriggerKind::parse(&t, Utc::now()).unwrap();
		let TriggerKind::Event(filters) = kind else {
			panic!("expected an event trigger");
		};
		assert_eq!(filters.len(), 2);
		assert_eq!(filters[0].doctype, "io.cozy.files");
		assert_eq!(filters[0].verbs, vec![Verb::Created, Verb::Updated]);
		assert!(filters[1].verbs.is_empty());
	}

	#[test]
	fn at_and_in_are_one_shot() {
		let now = Utc::now();
		let t = infos("@in", "10m");
		let kind = TriggerKind::parse(&t, now).unwrap();
		assert!(kind.is_one_shot());
		let next = kind.next_at(now).unwrap();
		assert_eq!(next - now, chrono::Duration::minutes(10));
	}

	#[test]
	fn spread_slots_are_deterministic() {
		let a = spread_cron_expr("@daily", "alice.example.net");
		let b = spread_cron_expr("@daily", "alice.example.net");
		assert_eq!(a, b);
		assert!(Schedule::from_str(&a).is_ok());
		assert!(Schedule::from_str(&spread_cron_expr("@hourly", "bob.example.net")).is_ok());
		assert!(Schedule::from_str(&spread_cron_expr("@weekly", "bob.example.net")).is_ok());
		assert!(Schedule::from_str(&spread_cron_expr("@monthly", "bob.example.net")).is_ok());
	}

	#[test]
	fn combine_mode_defaults() {
		assert_eq!(infos("@event", "io.cozy.files").combine_mode(), "append");
		assert_eq!(infos("@webhook", "").combine_mode(), "original");
		assert_eq!(infos("@every", "1m").combine_mode(), "recreate");
	}
}
