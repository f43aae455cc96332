use crate::store::DocId;
use thiserror::Error;

// ─── Error hierarchy ─────────────────────────────────────────────────────────
//
// One enum per subsystem. Callers match on these to decide recovery
// strategy; application glue uses `anyhow::Result` for ad-hoc context
// chains instead of a top-level roll-up.

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── State store errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StateError {
    /// Optimistic concurrency failure: a touched document moved underneath
    /// the committer. Retry with a fresh snapshot.
    #[error("version conflict on {doc}: expected v{expected}, found v{actual}")]
    Conflict {
        doc: DocId,
        expected: u64,
        actual: u64,
    },

    /// Integrity tag mismatch. The document is refused for writes until an
    /// operator resets it from a trusted backup.
    #[error("document {doc} failed integrity verification")]
    Corrupt { doc: DocId },

    #[error("delta for {doc} is not a JSON object")]
    InvalidDelta { doc: DocId },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

// ─── Ledger errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The persisted event log violates an append-only invariant
    /// (missing genesis, sequence gap, duplicate idempotency key).
    #[error("ledger integrity: {0}")]
    Integrity(String),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

// ─── Scheduler errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("unit {0} is quarantined")]
    Quarantined(String),

    /// Commit kept conflicting after the bounded retry budget.
    #[error("commit contention for unit {unit} after {attempts} attempts")]
    CommitContention { unit: String, attempts: u32 },
}
