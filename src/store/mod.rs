//! Versioned, integrity-checked document store (the "honeycomb").
//!
//! All reads are point-in-time snapshots; all writes are atomic
//! multi-document commits with optimistic concurrency. Each document
//! persists as `{version, integrity_tag, payload}` and the tag is verified
//! on every load — a mismatch flags the document corrupt and refuses
//! further commits to it until an operator restores it from backup.

use crate::error::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

mod integrity;
pub use integrity::IntegrityKeyer;


// ── Document identity ────────────────────────────────────────────

/// The closed set of honeycomb documents. Names are never constructed from
/// external input, so there is no traversal surface to sanitize.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DocId {
    /// Operational state: scheduler bookkeeping, health, quarantines.
    State,
    /// Work queue drafted by producer units.
    Tasks,
    /// Observations gathered by scout units.
    Intel,
}

impl DocId {
    pub fn all() -> [DocId; 3] {
        [DocId::State, DocId::Tasks, DocId::Intel]
    }

    fn file_name(self) -> &'static str {
        match self {
            DocId::State => "state.json",
            DocId::Tasks => "tasks.json",
            DocId::Intel => "intel.json",
        }
    }
}

// ── Persisted shape ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedDoc {
    version: u64,
    integrity_tag: String,
    payload: serde_json::Value,
}

#[derive(Debug, Clone)]
struct StateDocument {
    version: u64,
    payload: serde_json::Value,
    integrity_tag: String,
}

// ── Snapshot ─────────────────────────────────────────────────────

/// Immutable point-in-time copy of every document. Units execute against a
/// snapshot, never the live store.
#[derive(Debug, Clone)]
pub struct Snapshot {
    docs: BTreeMap<DocId, (u64, serde_json::Value)>,
    taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn payload(&self, doc: DocId) -> &serde_json::Value {
        &self.docs[&doc].1
    }

    pub fn version(&self, doc: DocId) -> u64 {
        self.docs[&doc].0
    }

    /// Expected-version map covering the given documents, for an optimistic
    /// commit computed from this snapshot.
    pub fn expected_versions<'a>(
        &self,
        docs: impl IntoIterator<Item = &'a DocId>,
    ) -> BTreeMap<DocId, u64> {
        docs.into_iter().map(|d| (*d, self.version(*d))).collect()
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

// ── Store ────────────────────────────────────────────────────────

struct Inner {
    docs: BTreeMap<DocId, StateDocument>,
    corrupt: BTreeSet<DocId>,
}

pub struct StateStore {
    dir: PathBuf,
    keyer: IntegrityKeyer,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Open the honeycomb directory, loading and verifying every document.
    ///
    /// Missing documents start at version 0 with an empty object payload.
    /// Documents whose integrity tag does not verify are flagged corrupt and
    /// excluded from commits; their on-disk bytes are left untouched for
    /// forensics.
    pub fn open(dir: &Path, keyer: IntegrityKeyer) -> Result<Self, StateError> {
        std::fs::create_dir_all(dir)?;

        let mut docs = BTreeMap::new();
        let mut corrupt = BTreeSet::new();

        for id in DocId::all() {
            let path = dir.join(id.file_name());
            if path.exists() {
                let raw = std::fs::read_to_string(&path)?;
                match serde_json::from_str::<PersistedDoc>(&raw) {
                    Ok(persisted)
                        if keyer.verify(
                            &id.to_string(),
                            persisted.version,
                            &persisted.payload,
                            &persisted.integrity_tag,
                        ) =>
                    {
                        docs.insert(
                            id,
                            StateDocument {
                                version: persisted.version,
                                payload: persisted.payload,
                                integrity_tag: persisted.integrity_tag,
                            },
                        );
                    }
                    Ok(_) => {
                        tracing::error!(doc = %id, "integrity tag mismatch, document flagged corrupt");
                        corrupt.insert(id);
                        // Serve as empty; commits are refused anyway and the
                        // on-disk bytes stay for forensics.
                        docs.insert(id, Self::empty_doc(&keyer, id));
                    }
                    Err(err) => {
                        // Corruption is per-document: an unreadable file must
                        // not keep unrelated documents from loading.
                        tracing::error!(doc = %id, error = %err, "unparseable document flagged corrupt");
                        corrupt.insert(id);
                        docs.insert(id, Self::empty_doc(&keyer, id));
                    }
                }
            } else {
                docs.insert(id, Self::empty_doc(&keyer, id));
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            keyer,
            inner: Mutex::new(Inner { docs, corrupt }),
        })
    }

    fn empty_doc(keyer: &IntegrityKeyer, id: DocId) -> StateDocument {
        let payload = serde_json::json!({});
        let integrity_tag = keyer.tag(&id.to_string(), 0, &payload);
        StateDocument {
            version: 0,
            payload,
            integrity_tag,
        }
    }

    /// Point-in-time copy of all documents, taken under a short lock.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().expect("state store lock poisoned");
        Snapshot {
            docs: inner
                .docs
                .iter()
                .map(|(id, doc)| (*id, (doc.version, doc.payload.clone())))
                .collect(),
            taken_at: Utc::now(),
        }
    }

    /// Apply a multi-document merge-patch commit, all-or-nothing.
    ///
    /// Fails with `Conflict` if any touched document's current version
    /// differs from `expected`, and with `Corrupt` if any touched document
    /// is flagged. On success every touched document gets a bumped version,
    /// a fresh integrity tag, `_meta` provenance, and an atomic
    /// write-temp-then-rename persist.
    pub fn commit(
        &self,
        deltas: &BTreeMap<DocId, serde_json::Value>,
        expected: &BTreeMap<DocId, u64>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        if deltas.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock().expect("state store lock poisoned");

        // Validate everything up front so the write phase cannot half-apply.
        for (id, delta) in deltas {
            if inner.corrupt.contains(id) {
                return Err(StateError::Corrupt { doc: *id });
            }
            if !delta.is_object() {
                return Err(StateError::InvalidDelta { doc: *id });
            }
            let current = inner.docs[id].version;
            let wanted = expected.get(id).copied().unwrap_or(current);
            if current != wanted {
                return Err(StateError::Conflict {
                    doc: *id,
                    expected: wanted,
                    actual: current,
                });
            }
        }

        let mut staged: Vec<(DocId, StateDocument)> = Vec::with_capacity(deltas.len());
        for (id, delta) in deltas {
            let mut payload = inner.docs[id].payload.clone();
            merge_patch(&mut payload, delta);
            stamp_meta(&mut payload, actor, now);
            let version = inner.docs[id].version + 1;
            let integrity_tag = self.keyer.tag(&id.to_string(), version, &payload);
            staged.push((
                *id,
                StateDocument {
                    version,
                    payload,
                    integrity_tag,
                },
            ));
        }

        // Stage all temp files before any rename so an IO failure leaves the
        // previous generation intact.
        let mut renames: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(staged.len());
        for (id, doc) in &staged {
            let persisted = PersistedDoc {
                version: doc.version,
                integrity_tag: doc.integrity_tag.clone(),
                payload: doc.payload.clone(),
            };
            let final_path = self.dir.join(id.file_name());
            let tmp_path = self.dir.join(format!("{}.tmp", id.file_name()));
            std::fs::write(&tmp_path, serde_json::to_vec_pretty(&persisted)?)?;
            renames.push((tmp_path, final_path));
        }
        for (tmp, dest) in renames {
            std::fs::rename(&tmp, &dest)?;
        }

        for (id, doc) in staged {
            inner.docs.insert(id, doc);
        }

        Ok(())
    }

    /// Re-read the document from disk and check its integrity tag.
    ///
    /// Returns false on mismatch (or unreadable file) and flags the document
    /// corrupt, halting further commits to it.
    pub fn verify(&self, doc: DocId) -> bool {
        let path = self.dir.join(doc.file_name());
        let ok = if path.exists() {
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<PersistedDoc>(&raw).ok())
                .is_some_and(|p| {
                    self.keyer
                        .verify(&doc.to_string(), p.version, &p.payload, &p.integrity_tag)
                })
        } else {
            // Never persisted: consistent only while still at version 0.
            let inner = self.inner.lock().expect("state store lock poisoned");
            inner.docs[&doc].version == 0
        };

        if !ok {
            let mut inner = self.inner.lock().expect("state store lock poisoned");
            if inner.corrupt.insert(doc) {
                tracing::error!(doc = %doc, "integrity verification failed, commits halted");
            }
        }
        ok
    }

    /// Documents currently flagged corrupt.
    pub fn corrupt_docs(&self) -> Vec<DocId> {
        let inner = self.inner.lock().expect("state store lock poisoned");
        inner.corrupt.iter().copied().collect()
    }
}

// ── Merge patch ──────────────────────────────────────────────────

/// RFC 7386-style merge: objects merge recursively, `null` removes a key,
/// anything else replaces. This is the delta format every `ProposedEffect`
/// carries.
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    if let serde_json::Value::Object(patch_map) = patch {
        if !target.is_object() {
            *target = serde_json::json!({});
        }
        let target_map = target.as_object_mut().expect("target coerced to object");
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else if value.is_object() {
                let entry = target_map
                    .entry(key.clone())
                    .or_insert_with(|| serde_json::json!({}));
                merge_patch(entry, value);
            } else {
                target_map.insert(key.clone(), value.clone());
            }
        }
    } else {
        *target = patch.clone();
    }
}

fn stamp_meta(payload: &mut serde_json::Value, actor: &str, now: DateTime<Utc>) {
    let meta = serde_json::json!({
        "_meta": {
            "last_updated": now.to_rfc3339(),
            "last_updated_by": actor,
        }
    });
    merge_patch(payload, &meta);
}
