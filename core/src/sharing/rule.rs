//! Sharing rules: predicates over documents governing what is shared and
//! with what verbs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::couch::{self, FILES};

use super::SharingError;

/// Verb allowing a change to propagate in both directions.
pub const VERB_SYNC: &str = "sync";
/// Verb allowing a change to propagate from the owner only.
pub const VERB_PUSH: &str = "push";
/// Verb blocking propagation.
pub const VERB_NONE: &str = "none";

/// The `referenced_by` selector.
pub const SELECTOR_REFERENCED_BY: &str = "referenced_by";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
	pub title: String,
	pub doctype: String,
	/// Empty for an explicit id list, `referenced_by`, or a document
	/// field.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub selector: String,
	pub values: Vec<String>,
	/// Local rules are not replicated to the peers.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub local: bool,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub add: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub update: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub remove: String,
}

impl Rule {
	/// A rule sharing the files under one directory, both ways.
	pub fn files_by_id(title: impl Into<String>, dir_id: impl Into<String>) -> Self {
		Self {
			title: title.into(),
			doctype: FILES.to_owned(),
			selector: String::new(),
			values: vec![dir_id.into()],
			local: false,
			add: VERB_SYNC.to_owned(),
			update: VERB_SYNC.to_owned(),
			remove: VERB_SYNC.to_owned(),
		}
	}

	pub fn is_files(&self) -> bool {
		self.doctype == FILES
	}

	/// True when a change on the recipient can be propagated back.
	pub fn has_sync(&self) -> bool {
		self.add == VERB_SYNC || self.update == VERB_SYNC || self.remove == VERB_SYNC
	}

	pub fn has_push(&self) -> bool {
		self.add == VERB_PUSH || self.update == VERB_PUSH || self.remove == VERB_PUSH
	}

	/// Decides whether a document is covered by this rule.
	pub fn accept(&self, doctype: &str, doc: &Value) -> bool {
		if self.local || doctype != self.doctype {
			return false;
		}
		let id = couch::doc_id(doc);
		if self.is_files() {
			// Files match by their own id, their parent directory, or a
			// reference.
			if self.selector.is_empty() || self.selector == "id" {
				if self.values.iter().any(|v| v == id) {
					return true;
				}
				if let Some(dir_id) = doc.get("dir_id").and_then(Value::as_str) {
					return self.values.iter().any(|v| v == dir_id);
				}
				return false;
			}
		}
		match self.selector.as_str() {
			"" | "id" => self.values.iter().any(|v| v == id),
			SELECTOR_REFERENCED_BY => doc
				.get("referenced_by")
				.and_then(Value::as_array)
				.map_or(false, |refs| {
					refs.iter().any(|r| {
						let key = format!(
							"{}/{}",
							r.get("type").and_then(Value::as_str).unwrap_or_default(),
							r.get("id").and_then(Value::as_str).unwrap_or_default()
						);
						self.values.contains(&key)
					})
				}),
			field => doc
				.get(field)
				.and_then(Value::as_str)
				.map_or(false, |v| self.values.iter().any(|val| val == v)),
		}
	}
}

/// Validates the rules of a sharing before it is created.
pub fn validate_rules(rules: &[Rule]) -> Result<(), SharingError> {
	if rules.is_empty() {
		return Err(SharingError::InvalidRules);
	}
	for rule in rules {
		if rule.doctype.is_empty() || rule.values.is_empty() {
			return Err(SharingError::InvalidRules);
		}
		for verb in [&rule.add, &rule.update, &rule.remove] {
			if !verb.is_empty() && verb != VERB_SYNC && verb != VERB_PUSH && verb != VERB_NONE {
				return Err(SharingError::InvalidRules);
			}
		}
		if rule.is_files() && rule.selector != SELECTOR_REFERENCED_BY && !rule.selector.is_empty()
		{
			// A files rule is rooted on explicit ids or references.
			return Err(SharingError::InvalidRules);
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn files_rule_accepts_by_id_and_parent() {
		let rule = Rule::files_by_id("Docs", "dir123");
		assert!(rule.accept(FILES, &json!({"_id": "dir123", "type": "directory"})));
		assert!(rule.accept(FILES, &json!({"_id": "f1", "dir_id": "dir123"})));
		assert!(!rule.accept(FILES, &json!({"_id": "f2", "dir_id": "elsewhere"})));
		assert!(!rule.accept("io.cozy.contacts", &json!({"_id": "dir123"})));
	}

	#[test]
	fn referenced_by_selector() {
		let rule = Rule {
			title: "photos".to_owned(),
			doctype: FILES.to_owned(),
			selector: SELECTOR_REFERENCED_BY.to_owned(),
			values: vec!["io.cozy.photos.albums/album1".to_owned()],
			local: false,
			add: VERB_SYNC.to_owned(),
			update: VERB_SYNC.to_owned(),
			remove: VERB_SYNC.to_owned(),
		};
		let doc = json!({
			"_id": "f1",
			"referenced_by": [{"type": "io.cozy.photos.albums", "id": "album1"}],
		});
		assert!(rule.accept(FILES, &doc));
	}

	#[test]
	fn validation() {
		assert!(validate_rules(&[]).is_err());
		assert!(validate_rules(&[Rule::files_by_id("Docs", "dir1")]).is_ok());
		let mut bad = Rule::files_by_id("Docs", "dir1");
		bad.add = "teleport".to_owned();
		assert!(validate_rules(&[bad]).is_err());
	}
}
