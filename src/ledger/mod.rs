//! Append-only economic ledger.
//!
//! One JSON record per line, strictly append-ordered. Balance is never
//! stored: it is the fold of all events in sequence order, so replay is the
//! audit. Append is the only mutation primitive; there is no update or
//! delete path.

use crate::error::LedgerError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};


// ── Events ───────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Genesis,
    Credit,
    Debit,
}

/// Immutable once appended. Amounts are integer cents so replay never drifts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub seq: u64,
    pub idempotency_key: String,
    pub kind: EventKind,
    pub amount_cents: i64,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

/// An entry as proposed by a unit, before the ledger assigns a sequence
/// number and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub idempotency_key: String,
    pub kind: EventKind,
    pub amount_cents: i64,
    pub actor: String,
}

/// Outcome of an append. A replayed idempotency key is success-no-op so
/// retried requests stay safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Committed(u64),
    Duplicate,
}

// ── Recent-key index ─────────────────────────────────────────────

/// Bounded index of recently appended idempotency keys, the hot path for
/// duplicate detection at append time. The full key set is the authority;
/// this window just keeps the common retry case from touching it.
#[derive(Debug)]
struct RecentKeys {
    cap: usize,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl RecentKeys {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    fn insert(&mut self, key: String) {
        if self.set.insert(key.clone()) {
            self.order.push_back(key);
            while self.order.len() > self.cap {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                }
            }
        }
    }
}

// ── Budget health ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BudgetStatus {
    Healthy,
    Warning,
    Critical,
}

/// Sustainability summary derived from recent debits.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetHealth {
    pub balance_cents: i64,
    pub burn_rate_cents_per_day: i64,
    pub runway_days: Option<f64>,
    pub status: BudgetStatus,
}

// ── Ledger ───────────────────────────────────────────────────────

pub struct Ledger {
    path: PathBuf,
    events: Vec<LedgerEvent>,
    /// Every idempotency key in the log. Appends must dedup against the
    /// whole history, or replay would reject a log this process wrote.
    keys: HashSet<String>,
    recent: RecentKeys,
}

impl Ledger {
    /// Open (or create) the ledger file and replay it.
    ///
    /// Replay enforces the append-only invariants: `genesis` first,
    /// contiguous sequence numbers, no duplicate idempotency key anywhere in
    /// the log. A fresh ledger gets its genesis event written immediately.
    pub fn open(path: &Path, recent_key_window: usize) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut ledger = Self {
            path: path.to_path_buf(),
            events: Vec::new(),
            keys: HashSet::new(),
            recent: RecentKeys::new(recent_key_window),
        };

        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            for (line_no, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let event: LedgerEvent = serde_json::from_str(line).map_err(|e| {
                    LedgerError::Integrity(format!("line {}: {e}", line_no + 1))
                })?;

                let expected_seq = ledger.events.len() as u64;
                if event.seq != expected_seq {
                    return Err(LedgerError::Integrity(format!(
                        "sequence gap: expected {expected_seq}, found {}",
                        event.seq
                    )));
                }
                if expected_seq == 0 && event.kind != EventKind::Genesis {
                    return Err(LedgerError::Integrity(
                        "log does not start with a genesis event".into(),
                    ));
                }
                if expected_seq > 0 && event.kind == EventKind::Genesis {
                    return Err(LedgerError::Integrity(format!(
                        "unexpected genesis event at seq {expected_seq}"
                    )));
                }
                if !ledger.keys.insert(event.idempotency_key.clone()) {
                    return Err(LedgerError::Integrity(format!(
                        "duplicate idempotency key: {}",
                        event.idempotency_key
                    )));
                }
                ledger.recent.insert(event.idempotency_key.clone());
                ledger.events.push(event);
            }
        }

        if ledger.events.is_empty() {
            ledger.write_event(&LedgerEvent {
                seq: 0,
                idempotency_key: "genesis".into(),
                kind: EventKind::Genesis,
                amount_cents: 0,
                actor: "hivecore".into(),
                timestamp: Utc::now(),
            })?;
        }

        Ok(ledger)
    }

    /// Append an entry. Rejects genesis drafts and non-positive amounts;
    /// a duplicate idempotency key is success-no-op.
    pub fn append(&mut self, draft: &EntryDraft, now: DateTime<Utc>) -> Result<Appended, LedgerError> {
        if draft.kind == EventKind::Genesis {
            return Err(LedgerError::InvalidEntry(
                "genesis can only be written by the ledger itself".into(),
            ));
        }
        if draft.amount_cents <= 0 {
            return Err(LedgerError::InvalidEntry(format!(
                "amount must be positive, got {}",
                draft.amount_cents
            )));
        }
        if draft.idempotency_key.is_empty() {
            return Err(LedgerError::InvalidEntry("empty idempotency key".into()));
        }

        if self.recent.contains(&draft.idempotency_key) || self.keys.contains(&draft.idempotency_key)
        {
            tracing::debug!(key = %draft.idempotency_key, "duplicate ledger entry, no-op");
            return Ok(Appended::Duplicate);
        }

        let event = LedgerEvent {
            seq: self.events.len() as u64,
            idempotency_key: draft.idempotency_key.clone(),
            kind: draft.kind,
            amount_cents: draft.amount_cents,
            actor: draft.actor.clone(),
            timestamp: now,
        };
        let seq = event.seq;
        self.write_event(&event)?;
        Ok(Appended::Committed(seq))
    }

    fn write_event(&mut self, event: &LedgerEvent) -> Result<(), LedgerError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        self.keys.insert(event.idempotency_key.clone());
        self.recent.insert(event.idempotency_key.clone());
        self.events.push(event.clone());
        Ok(())
    }

    /// Balance after folding events `[0..=seq]`. Pure function of the event
    /// list; out-of-range `seq` folds the whole log.
    pub fn balance_as_of(&self, seq: u64) -> i64 {
        fold_balance(self.events.iter().take_while(|e| e.seq <= seq))
    }

    pub fn balance(&self) -> i64 {
        fold_balance(self.events.iter())
    }

    /// Would this debit keep the balance at or above the reserve floor?
    /// Used by the policy gateway, never by units directly.
    pub fn reserve_check(&self, proposed_debit_cents: i64, reserve_floor_cents: i64) -> bool {
        self.balance() - proposed_debit_cents >= reserve_floor_cents
    }

    /// Burn-rate summary over the trailing seven days of debits.
    pub fn budget_health(&self, now: DateTime<Utc>) -> BudgetHealth {
        let window_start = now - Duration::days(7);
        let spent: i64 = self
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Debit && e.timestamp >= window_start)
            .map(|e| e.amount_cents)
            .sum();
        let burn_rate = spent / 7;
        let balance = self.balance();

        let runway_days = if burn_rate > 0 {
            Some(balance as f64 / burn_rate as f64)
        } else {
            None
        };
        let status = match runway_days {
            Some(d) if d < 3.0 => BudgetStatus::Critical,
            Some(d) if d < 7.0 => BudgetStatus::Warning,
            _ => BudgetStatus::Healthy,
        };

        BudgetHealth {
            balance_cents: balance,
            burn_rate_cents_per_day: burn_rate,
            runway_days,
            status,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }
}

fn fold_balance<'a>(events: impl Iterator<Item = &'a LedgerEvent>) -> i64 {
    events.fold(0, |acc, e| match e.kind {
        EventKind::Genesis | EventKind::Credit => acc + e.amount_cents,
        EventKind::Debit => acc - e.amount_cents,
    })
}
