//! Revision arithmetic and revision trees.
//!
//! A revision is a string of the form `<generation>-<opaque>`. A document's
//! history is a rooted tree of revisions; the winner is the tip of the
//! longest chain, ties broken by the lexicographically higher revision.

use std::{
	collections::hash_map::DefaultHasher,
	hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

/// Extracts the generation number of a revision, i.e. `3` for `3-abc`.
pub fn generation(rev: &str) -> u64 {
	rev.split_once('-')
		.and_then(|(gen, _)| gen.parse().ok())
		.unwrap_or(0)
}

/// Extracts the opaque part of a revision, i.e. `abc` for `3-abc`.
pub fn body(rev: &str) -> &str {
	rev.split_once('-').map(|(_, body)| body).unwrap_or(rev)
}

/// Orders two revisions by generation, then lexicographically.
pub fn compare(a: &str, b: &str) -> std::cmp::Ordering {
	generation(a)
		.cmp(&generation(b))
		.then_with(|| body(a).cmp(body(b)))
}

/// The `_revisions` field of a replicated document: the ids are the opaque
/// parts of the revisions, from the tip down to the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsStruct {
	pub start: u64,
	pub ids: Vec<String>,
}

impl RevsStruct {
	/// Builds a `_revisions` struct from a chain ordered root to tip.
	pub fn from_chain(chain: &[String]) -> Self {
		let start = chain.last().map(|rev| generation(rev)).unwrap_or(0);
		let ids = chain.iter().rev().map(|rev| body(rev).to_owned()).collect();
		Self { start, ids }
	}

	/// Rebuilds the chain, ordered from root to tip.
	pub fn to_chain(&self) -> Vec<String> {
		self.ids
			.iter()
			.enumerate()
			.map(|(i, id)| format!("{}-{}", self.start - i as u64, id))
			.rev()
			.collect()
	}

	/// The tip revision, or `None` for an empty struct.
	pub fn tip(&self) -> Option<String> {
		self.ids.first().map(|id| format!("{}-{}", self.start, id))
	}
}

/// Outcome of comparing an incoming change against the local tip, from the
/// point of view of the incoming change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
	/// The incoming chain extends the local tip (or is already known).
	None,
	/// The incoming change wins: it is applied at the original id and the
	/// current local content is preserved aside.
	Won,
	/// The incoming change loses: it is diverted to a conflict copy.
	Lost,
}

/// Compares the local tip with an incoming chain (root to tip).
pub fn detect_conflict(local_tip: &str, chain: &[String]) -> Conflict {
	let Some(tip) = chain.last() else {
		return Conflict::None;
	};
	if chain.iter().any(|rev| rev == local_tip) {
		return Conflict::None;
	}
	match compare(tip, local_tip) {
		std::cmp::Ordering::Greater => Conflict::Won,
		_ => Conflict::Lost,
	}
}

/// A revision tree. Serialized as nested `{rev, branches}` objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevTree {
	pub rev: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub branches: Vec<RevTree>,
}

impl RevTree {
	pub fn new(rev: impl Into<String>) -> Self {
		Self {
			rev: rev.into(),
			branches: Vec::new(),
		}
	}

	/// Builds a linear tree from a chain ordered root to tip.
	pub fn chain(revs: &[String]) -> Option<Self> {
		let mut iter = revs.iter().rev();
		let mut node = Self::new(iter.next()?.clone());
		for rev in iter {
			node = Self {
				rev: rev.clone(),
				branches: vec![node],
			};
		}
		Some(node)
	}

	/// Finds the subtree rooted at the given revision.
	pub fn find(&self, rev: &str) -> Option<&RevTree> {
		if self.rev == rev {
			return Some(self);
		}
		self.branches.iter().find_map(|b| b.find(rev))
	}

	fn find_mut(&mut self, rev: &str) -> Option<&mut RevTree> {
		if self.rev == rev {
			return Some(self);
		}
		self.branches.iter_mut().find_map(|b| b.find_mut(rev))
	}

	/// All the leaf revisions of the tree.
	pub fn leaves(&self) -> Vec<&str> {
		if self.branches.is_empty() {
			return vec![&self.rev];
		}
		self.branches.iter().flat_map(|b| b.leaves()).collect()
	}

	/// The winning revision: the tip of the longest chain, ties broken by
	/// the lexicographically higher revision.
	pub fn winner(&self) -> &str {
		self.leaves()
			.into_iter()
			.max_by(|a, b| compare(a, b))
			.expect("a revision tree always has at least one leaf")
	}

	/// Merges a chain (root to tip) into the tree, grafting it after the
	/// deepest revision both sides know. A chain with no common revision is
	/// attached as a new branch of the root.
	pub fn insert_chain(&mut self, chain: &[String]) {
		let mut idx = 0;
		let mut anchor: Option<String> = None;
		for (i, rev) in chain.iter().enumerate() {
			if self.find(rev).is_some() {
				anchor = Some(rev.clone());
				idx = i + 1;
			}
		}
		let mut node = match anchor {
			Some(rev) => self.find_mut(&rev).expect("anchor was just found"),
			None => self,
		};
		for rev in &chain[idx.min(chain.len())..] {
			if let Some(pos) = node.branches.iter().position(|b| b.rev == *rev) {
				node = &mut node.branches[pos];
			} else {
				node.branches.push(RevTree::new(rev.clone()));
				let last = node.branches.len() - 1;
				node = &mut node.branches[last];
			}
		}
	}

	/// Inserts a single revision as a child of the given parent, falling
	/// back to a root branch when the parent is unknown.
	pub fn add(&mut self, rev: &str, parent: &str) {
		if self.find(rev).is_some() {
			return;
		}
		match self.find_mut(parent) {
			Some(node) => node.branches.push(RevTree::new(rev)),
			None => self.insert_chain(&[rev.to_owned()]),
		}
	}

	/// Appends a synthesized revision after the winner, bumping the
	/// generation by one. Used to override a tombstone the peer still
	/// believes in. Returns the new revision.
	pub fn increment(&mut self) -> String {
		let winner = self.winner().to_owned();
		let next = synthesize(generation(&winner) + 1, &winner);
		self.find_mut(&winner)
			.expect("winner is in the tree")
			.branches
			.push(RevTree::new(next.clone()));
		next
	}

	/// The chain from the root to the winning leaf.
	pub fn winner_chain(&self) -> Vec<String> {
		let winner = self.winner().to_owned();
		let mut chain = Vec::new();
		self.chain_to(&winner, &mut chain);
		chain
	}

	fn chain_to(&self, rev: &str, acc: &mut Vec<String>) -> bool {
		acc.push(self.rev.clone());
		if self.rev == rev {
			return true;
		}
		for b in &self.branches {
			if b.chain_to(rev, acc) {
				return true;
			}
		}
		acc.pop();
		false
	}
}

/// Builds a deterministic revision at the given generation, seeded by the
/// parent revision.
pub fn synthesize(generation: u64, parent: &str) -> String {
	let mut hasher = DefaultHasher::new();
	parent.hash(&mut hasher);
	generation.hash(&mut hasher);
	format!("{generation}-{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn revs(revs: &[&str]) -> Vec<String> {
		revs.iter().map(|r| r.to_string()).collect()
	}

	#[test]
	fn generation_and_body() {
		assert_eq!(generation("3-abc"), 3);
		assert_eq!(body("3-abc"), "abc");
		assert_eq!(generation("garbage"), 0);
	}

	#[test]
	fn revs_struct_round_trip() {
		let chain = revs(&["1-aaa", "2-bbb", "3-ccc"]);
		let s = RevsStruct::from_chain(&chain);
		assert_eq!(s.start, 3);
		assert_eq!(s.ids, vec!["ccc", "bbb", "aaa"]);
		assert_eq!(s.to_chain(), chain);
		assert_eq!(s.tip().unwrap(), "3-ccc");
	}

	#[test]
	fn winner_prefers_longest_chain_then_lex() {
		let mut tree = RevTree::chain(&revs(&["1-aaa", "2-bbb"])).unwrap();
		tree.insert_chain(&revs(&["1-aaa", "2-bbb", "3-ccc"]));
		assert_eq!(tree.winner(), "3-ccc");

		tree.insert_chain(&revs(&["1-aaa", "2-bbb", "3-bbb"]));
		assert_eq!(tree.leaves().len(), 2);
		assert_eq!(tree.winner(), "3-ccc");
	}

	#[test]
	fn insert_chain_grafts_on_common_prefix() {
		let mut tree = RevTree::chain(&revs(&["1-aaa", "2-bbb"])).unwrap();
		tree.insert_chain(&revs(&["2-bbb", "3-ccc", "4-ddd"]));
		assert_eq!(tree.winner(), "4-ddd");
		assert_eq!(
			tree.winner_chain(),
			revs(&["1-aaa", "2-bbb", "3-ccc", "4-ddd"])
		);
	}

	#[test]
	fn detect_conflict_cases() {
		// Remote extends the local tip.
		let chain = revs(&["1-aaa", "2-bbb"]);
		assert_eq!(detect_conflict("1-aaa", &chain), Conflict::None);
		// Echo: local tip is the remote tip.
		assert_eq!(detect_conflict("2-bbb", &chain), Conflict::None);
		// Remote went further.
		assert_eq!(detect_conflict("1-zzz", &chain), Conflict::Won);
		// Local went further.
		let short = revs(&["1-aaa"]);
		assert_eq!(detect_conflict("2-bbb", &short), Conflict::Lost);
		// Same generation: lexicographic tiebreak.
		let same = revs(&["1-aaa", "2-yyy"]);
		assert_eq!(detect_conflict("2-xxx", &same), Conflict::Won);
		let same = revs(&["1-aaa", "2-xxx"]);
		assert_eq!(detect_conflict("2-yyy", &same), Conflict::Lost);
	}

	#[test]
	fn increment_overrides_tombstone_generation() {
		let mut tree = RevTree::chain(&revs(&["1-aaa", "2-bbb"])).unwrap();
		let rev = tree.increment();
		assert_eq!(generation(&rev), 3);
		assert_eq!(tree.winner(), rev);
	}
}
