//! The write-intent a unit hands back to the scheduler.
//!
//! A unit never touches the store or the ledger itself: it returns a
//! `ProposedEffect` the scheduler routes through the policy gateway and, on
//! approval, commits atomically. The effect is owned exclusively by the
//! scheduler until committed or discarded.

use crate::ledger::EntryDraft;
use crate::store::DocId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEffect {
    /// Merge patches per document, applied as one atomic commit.
    pub state_deltas: BTreeMap<DocId, serde_json::Value>,
    /// Optional economic entry appended after the state commit.
    pub ledger_entry: Option<EntryDraft>,
    /// Human-readable account of what the unit did, for logs only.
    pub summary: String,
}

impl ProposedEffect {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            state_deltas: BTreeMap::new(),
            ledger_entry: None,
            summary: summary.into(),
        }
    }

    pub fn with_delta(mut self, doc: DocId, delta: serde_json::Value) -> Self {
        self.state_deltas.insert(doc, delta);
        self
    }

    pub fn with_ledger_entry(mut self, entry: EntryDraft) -> Self {
        self.ledger_entry = Some(entry);
        self
    }

    /// True when there is nothing to commit: no deltas, no ledger entry.
    pub fn is_noop(&self) -> bool {
        self.state_deltas.is_empty() && self.ledger_entry.is_none()
    }
}
