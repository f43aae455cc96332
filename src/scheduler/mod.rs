//! The queen: decides what runs when, enforces concurrency caps, routes
//! every proposed effect through the policy gateway, and commits only what
//! survives it.
//!
//! One coordinating loop (`tick`) plus spawned workers. Workers may block on
//! external I/O; the loop never waits on one synchronously — completions
//! come back over a channel and are folded in at the start of the next tick
//! (or awaited explicitly by `drain`).

use crate::config::Config;
use crate::effect::ProposedEffect;
use crate::error::{SchedError, StateError};
use crate::events::EventBus;
use crate::ledger::{Appended, Ledger};
use crate::policy::{Decision, PolicyContext, PolicyGateway};
use crate::registry::{ConcurrencyClass, TaskRegistry, Unit};
use crate::store::{DocId, StateStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod workers;


/// Actor name used for the scheduler's own bookkeeping commits.
const SCHEDULER_ACTOR: &str = "queen";

// ── Run requests ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum TriggerReason {
    Timer,
    Event {
        name: String,
        payload: serde_json::Value,
    },
}

impl TriggerReason {
    pub fn label(&self) -> &str {
        match self {
            TriggerReason::Timer => "timer",
            TriggerReason::Event { name, .. } => name,
        }
    }
}

/// One scheduled instance of a unit. Ephemeral: destroyed on completion or
/// exhaustion of retries.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub id: Uuid,
    pub unit: Arc<Unit>,
    pub trigger: TriggerReason,
    /// 1-based; compared against `scheduler.max_attempts`.
    pub attempt: u32,
    pub due_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

// ── Failures ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network-ish: worth a backoff retry.
    Transient,
    /// Wrong input or broken invariant: retrying cannot help.
    Fatal,
    /// Deadline expired; retried like a transient failure.
    TimedOut,
}

impl FailureKind {
    pub fn retryable(self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::TimedOut)
    }
}

#[derive(Debug, Clone)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RunFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::TimedOut,
            message: message.into(),
        }
    }
}

// ── Quarantine ───────────────────────────────────────────────────

/// A unit excluded from scheduling after repeated failure. Recorded in the
/// state document and never auto-cleared; an operator re-admits explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub reason: String,
    pub at: DateTime<Utc>,
    pub attempts: u32,
}

// ── Completion plumbing ──────────────────────────────────────────

struct Completion {
    request: RunRequest,
    outcome: Result<ProposedEffect, RunFailure>,
}

/// What one tick did, for logs and the `once` command.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub dispatched: usize,
    pub committed: usize,
    pub blocked: usize,
    pub failed: usize,
}

// ── Scheduler ────────────────────────────────────────────────────

pub struct Scheduler {
    config: Arc<Config>,
    registry: Arc<TaskRegistry>,
    store: Arc<StateStore>,
    ledger: Arc<tokio::sync::Mutex<Ledger>>,
    gateway: Arc<PolicyGateway>,
    bus: Arc<EventBus>,

    queue: Vec<RunRequest>,
    running: BTreeMap<ConcurrencyClass, usize>,
    in_flight: usize,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,

    quarantined: BTreeMap<String, QuarantineRecord>,
    /// Re-admitted units whose persisted record still needs deleting.
    /// Merge patches only delete via explicit nulls, so removals must be
    /// remembered until a bookkeeping commit lands.
    cleared_quarantines: BTreeSet<String>,
    last_runs: BTreeMap<String, DateTime<Utc>>,
}

impl Scheduler {
    /// Build the scheduler, recovering bookkeeping (last run times,
    /// quarantine records) from the state document so a restart does not
    /// re-fire every schedule or forget a quarantine.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<TaskRegistry>,
        store: Arc<StateStore>,
        ledger: Arc<tokio::sync::Mutex<Ledger>>,
        gateway: Arc<PolicyGateway>,
        bus: Arc<EventBus>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let snapshot = store.snapshot();
        let bookkeeping = snapshot.payload(DocId::State).get("scheduler");
        let last_runs = bookkeeping
            .and_then(|s| s.get("last_runs"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let quarantined = bookkeeping
            .and_then(|s| s.get("quarantined"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        Self {
            config,
            registry,
            store,
            ledger,
            gateway,
            bus,
            queue: Vec::new(),
            running: BTreeMap::new(),
            in_flight: 0,
            completion_tx,
            completion_rx,
            quarantined,
            cleared_quarantines: BTreeSet::new(),
            last_runs,
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn quarantined(&self) -> &BTreeMap<String, QuarantineRecord> {
        &self.quarantined
    }

    // ── Tick ─────────────────────────────────────────────────────

    /// One coordination cycle: fold in finished workers, wake event
    /// subscribers, wake due schedules, dispatch up to capacity, persist
    /// bookkeeping.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        while let Ok(completion) = self.completion_rx.try_recv() {
            self.handle_completion(completion, &mut report).await;
        }

        self.enqueue_events(now);
        self.enqueue_due_timers(now);
        report.dispatched = self.dispatch_eligible(now);

        self.persist_bookkeeping(now);
        report
    }

    /// Wait for every in-flight worker to finish and fold in the results.
    /// Used by `once` and `spawn` so the process exits with settled state.
    pub async fn drain(&mut self) -> TickReport {
        let mut report = TickReport::default();
        while self.in_flight > 0 {
            let Some(completion) = self.completion_rx.recv().await else {
                break;
            };
            self.handle_completion(completion, &mut report).await;
            // A retry scheduled with backoff must still get a chance to run.
            let now = Utc::now();
            report.dispatched += self.dispatch_eligible_ignoring_backoff(now);
        }
        self.persist_bookkeeping(Utc::now());
        report
    }

    /// Force-dispatch a unit outside its schedule (the `spawn` command).
    pub fn force_dispatch(
        &mut self,
        unit_id: &str,
        payload: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedError> {
        let unit = self
            .registry
            .get(unit_id)
            .ok_or_else(|| SchedError::UnknownUnit(unit_id.to_string()))?;
        if self.quarantined.contains_key(unit_id) {
            return Err(SchedError::Quarantined(unit_id.to_string()));
        }
        let trigger = match payload {
            Some(payload) => TriggerReason::Event {
                name: "manual".into(),
                payload,
            },
            None => TriggerReason::Timer,
        };
        let request = self.make_request(Arc::clone(unit), trigger, now);
        self.queue.push(request);
        self.dispatch_eligible(now);
        Ok(())
    }

    /// Operator re-admission ("exorcism"): clears the quarantine record so
    /// the unit is scheduled again. Never happens automatically.
    pub fn readmit(&mut self, unit_id: &str) -> bool {
        let removed = self.quarantined.remove(unit_id).is_some();
        if removed {
            self.cleared_quarantines.insert(unit_id.to_string());
            tracing::info!(unit = unit_id, "unit re-admitted from quarantine");
            self.persist_bookkeeping(Utc::now());
        }
        removed
    }

    // ── Request creation ─────────────────────────────────────────

    fn make_request(
        &self,
        unit: Arc<Unit>,
        trigger: TriggerReason,
        now: DateTime<Utc>,
    ) -> RunRequest {
        RunRequest {
            id: Uuid::new_v4(),
            unit,
            trigger,
            attempt: 1,
            due_at: now,
            deadline: now + Duration::seconds(self.config.scheduler.run_timeout_secs as i64),
        }
    }

    fn enqueue_events(&mut self, now: DateTime<Utc>) {
        for event in self.bus.drain() {
            if event.coalesced > 1 {
                tracing::debug!(
                    event = %event.name,
                    publishes = event.coalesced,
                    "coalesced event burst"
                );
            }
            for unit in self.registry.subscribers(&event.name) {
                if self.quarantined.contains_key(&unit.id) {
                    continue;
                }
                let request = self.make_request(
                    unit,
                    TriggerReason::Event {
                        name: event.name.clone(),
                        payload: event.payload.clone(),
                    },
                    now,
                );
                self.queue.push(request);
            }
        }
    }

    fn enqueue_due_timers(&mut self, now: DateTime<Utc>) {
        let due: Vec<Arc<Unit>> = self
            .registry
            .iter()
            .filter(|unit| !self.quarantined.contains_key(&unit.id))
            .filter(|unit| {
                unit.schedule.due(self.last_runs.get(&unit.id).copied(), now)
            })
            .cloned()
            .collect();

        for unit in due {
            // Only timer wakes advance the schedule; event- and spawn-driven
            // runs must not postpone the next timer fire.
            self.last_runs.insert(unit.id.clone(), now);
            let request = self.make_request(unit, TriggerReason::Timer, now);
            self.queue.push(request);
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────

    fn has_capacity(&self, class: ConcurrencyClass) -> bool {
        let running = self.running.get(&class).copied().unwrap_or(0);
        running < self.config.scheduler.caps.cap(class)
    }

    /// Strict tiers: while any Critical/High request is queued and its class
    /// has free capacity, no lower-tier request is dispatched. Within a
    /// tier: FIFO by due time, ties broken by unit id.
    fn dispatch_eligible(&mut self, now: DateTime<Utc>) -> usize {
        self.dispatch_pass(now, false)
    }

    /// Variant used while draining: backoff delays are honored by due time,
    /// but a drain must not spin forever waiting for wall-clock time, so
    /// pending retries run as soon as their predecessors settle.
    fn dispatch_eligible_ignoring_backoff(&mut self, now: DateTime<Utc>) -> usize {
        self.dispatch_pass(now, true)
    }

    fn dispatch_pass(&mut self, now: DateTime<Utc>, ignore_due_time: bool) -> usize {
        self.queue.sort_by(|a, b| {
            a.unit
                .tier
                .cmp(&b.unit.tier)
                .then(a.due_at.cmp(&b.due_at))
                .then(a.unit.id.cmp(&b.unit.id))
        });

        let mut dispatched = 0;
        // Two passes: urgent tiers first. After the first pass any urgent
        // request still queued is capacity-blocked (or not yet due), which
        // is exactly when lower tiers may proceed.
        for urgent_pass in [true, false] {
            let pending = std::mem::take(&mut self.queue);
            for request in pending {
                let due = ignore_due_time || request.due_at <= now;
                if request.unit.tier.is_urgent() != urgent_pass
                    || !due
                    || !self.has_capacity(request.unit.class)
                {
                    self.queue.push(request);
                    continue;
                }
                if self.quarantined.contains_key(&request.unit.id) {
                    tracing::warn!(
                        unit = %request.unit.id,
                        "dropping queued request for quarantined unit"
                    );
                    continue;
                }
                self.spawn_worker(request);
                dispatched += 1;
            }
        }
        dispatched
    }

    fn spawn_worker(&mut self, request: RunRequest) {
        *self.running.entry(request.unit.class).or_insert(0) += 1;
        self.in_flight += 1;

        tracing::info!(
            unit = %request.unit.id,
            kind = %request.unit.kind,
            trigger = request.trigger.label(),
            attempt = request.attempt,
            "dispatching"
        );

        // Read-only snapshot taken at dispatch time, never the live store.
        let snapshot = self.store.snapshot();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let now = Utc::now();
            let budget = (request.deadline - now).to_std().unwrap_or_default();
            let outcome =
                match tokio::time::timeout(budget, workers::execute(&request, &snapshot, now))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RunFailure::timed_out(format!(
                        "deadline {} expired",
                        request.deadline.to_rfc3339()
                    ))),
                };
            // Receiver dropped means the scheduler is gone; nothing to do.
            let _ = tx.send(Completion { request, outcome });
        });
    }

    // ── Completion handling ──────────────────────────────────────

    async fn handle_completion(&mut self, completion: Completion, report: &mut TickReport) {
        let Completion { request, outcome } = completion;
        if let Some(count) = self.running.get_mut(&request.unit.class) {
            *count = count.saturating_sub(1);
        }
        self.in_flight = self.in_flight.saturating_sub(1);

        match outcome {
            Ok(effect) => match self.commit_effect(&request, &effect).await {
                Ok(CommitOutcome::Committed) => {
                    report.committed += 1;
                    tracing::info!(unit = %request.unit.id, summary = %effect.summary, "committed");
                }
                Ok(CommitOutcome::Blocked) => {
                    report.blocked += 1;
                }
                Ok(CommitOutcome::Dropped) => {
                    report.failed += 1;
                }
                Err(err) => {
                    report.failed += 1;
                    self.note_failure(request, RunFailure::transient(err.to_string()));
                }
            },
            Err(failure) => {
                report.failed += 1;
                self.note_failure(request, failure);
            }
        }
    }

    async fn commit_effect(
        &mut self,
        request: &RunRequest,
        effect: &ProposedEffect,
    ) -> Result<CommitOutcome, SchedError> {
        if effect.is_noop() {
            return Ok(CommitOutcome::Committed);
        }

        let retries = self.config.scheduler.commit_retries.max(1);
        for _ in 0..retries {
            let snapshot = self.store.snapshot();
            let now = Utc::now();
            // The guard is held through the append so the balance the
            // gateway judged is the balance the entry lands on.
            let mut ledger = self.ledger.lock().await;
            let verdict = {
                let ctx = PolicyContext {
                    snapshot: &snapshot,
                    ledger: &ledger,
                    now,
                };
                self.gateway.evaluate(effect, &ctx)
            };
            let reasons: Vec<String> = verdict
                .reasons
                .iter()
                .map(|c| format!("{}: {}", c.rule, c.reason))
                .collect();

            let Some(approved) = verdict.effect_to_commit(effect) else {
                tracing::warn!(
                    unit = %request.unit.id,
                    reasons = reasons.join("; "),
                    "effect blocked by policy gateway"
                );
                return Ok(CommitOutcome::Blocked);
            };
            if verdict.decision == Decision::Modify {
                tracing::info!(
                    unit = %request.unit.id,
                    reasons = reasons.join("; "),
                    "effect corrected by policy gateway"
                );
            }

            let expected = snapshot.expected_versions(approved.state_deltas.keys());
            match self
                .store
                .commit(&approved.state_deltas, &expected, &request.unit.id, now)
            {
                Ok(()) => {
                    if let Some(entry) = &approved.ledger_entry {
                        let appended = ledger
                            .append(entry, now)
                            .map_err(|e| {
                                tracing::error!(unit = %request.unit.id, error = %e, "ledger append failed");
                                SchedError::CommitContention {
                                    unit: request.unit.id.clone(),
                                    attempts: 1,
                                }
                            })?;
                        if appended == Appended::Duplicate {
                            tracing::info!(
                                unit = %request.unit.id,
                                key = %entry.idempotency_key,
                                "duplicate ledger entry treated as success"
                            );
                        }
                    }
                    return Ok(CommitOutcome::Committed);
                }
                Err(StateError::Conflict { doc, .. }) => {
                    tracing::debug!(unit = %request.unit.id, doc = %doc, "commit conflict, retrying with fresh snapshot");
                    continue;
                }
                Err(StateError::Corrupt { doc }) => {
                    // The unit did nothing wrong; the document is poisoned.
                    // Drop the effect and leave the unit unquarantined.
                    tracing::error!(
                        unit = %request.unit.id,
                        doc = %doc,
                        "effect dropped: target document is corrupt"
                    );
                    return Ok(CommitOutcome::Dropped);
                }
                Err(err) => {
                    tracing::error!(unit = %request.unit.id, error = %err, "commit failed");
                    return Ok(CommitOutcome::Dropped);
                }
            }
        }

        Err(SchedError::CommitContention {
            unit: request.unit.id.clone(),
            attempts: retries,
        })
    }

    // ── Failure / quarantine ─────────────────────────────────────

    fn note_failure(&mut self, request: RunRequest, failure: RunFailure) {
        let unit_id = request.unit.id.clone();
        tracing::warn!(
            unit = %unit_id,
            attempt = request.attempt,
            kind = ?failure.kind,
            error = %failure.message,
            "run failed"
        );

        if failure.kind.retryable() && request.attempt < self.config.scheduler.max_attempts {
            let delay = self.backoff_delay(request.attempt);
            let retry = RunRequest {
                attempt: request.attempt + 1,
                due_at: Utc::now() + delay,
                deadline: Utc::now()
                    + delay
                    + Duration::seconds(self.config.scheduler.run_timeout_secs as i64),
                ..request
            };
            self.queue.push(retry);
        } else {
            self.quarantine(&unit_id, &failure.message, request.attempt);
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.scheduler.backoff_base_ms.max(1);
        let cap = self.config.scheduler.backoff_cap_ms.max(base);
        let exp = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        Duration::milliseconds(exp.min(cap) as i64)
    }

    fn quarantine(&mut self, unit_id: &str, reason: &str, attempts: u32) {
        tracing::error!(
            unit = unit_id,
            attempts,
            reason,
            "unit quarantined; re-admit explicitly or replace it"
        );
        self.cleared_quarantines.remove(unit_id);
        self.quarantined.insert(
            unit_id.to_string(),
            QuarantineRecord {
                reason: reason.to_string(),
                at: Utc::now(),
                attempts,
            },
        );
        // Drop queued work for the unit; in-flight runs may finish.
        self.queue.retain(|r| r.unit.id != unit_id);
    }

    // ── Bookkeeping ──────────────────────────────────────────────

    /// Commit scheduler state (last runs, quarantines, heartbeat) so a
    /// restart recovers it. Conflicts are retried a few times; a corrupt
    /// state document only costs bookkeeping, not unit execution.
    fn persist_bookkeeping(&mut self, now: DateTime<Utc>) {
        // A merge patch never deletes by omission, so re-admitted units get
        // an explicit null to remove their persisted record.
        let mut quarantined = serde_json::Map::new();
        for (unit, record) in &self.quarantined {
            quarantined.insert(unit.clone(), serde_json::json!(record));
        }
        for unit in &self.cleared_quarantines {
            quarantined.insert(unit.clone(), serde_json::Value::Null);
        }

        let payload = serde_json::json!({
            "scheduler": {
                "last_tick": now.to_rfc3339(),
                "last_runs": self.last_runs,
                "quarantined": quarantined,
            }
        });
        let mut deltas = BTreeMap::new();
        deltas.insert(DocId::State, payload);

        for _ in 0..3 {
            let snapshot = self.store.snapshot();
            let expected = snapshot.expected_versions(deltas.keys());
            match self.store.commit(&deltas, &expected, SCHEDULER_ACTOR, now) {
                Ok(()) => {
                    self.cleared_quarantines.clear();
                    return;
                }
                Err(StateError::Conflict { .. }) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "scheduler bookkeeping commit failed");
                    return;
                }
            }
        }
        tracing::warn!("scheduler bookkeeping commit kept conflicting, skipped this tick");
    }
}

enum CommitOutcome {
    Committed,
    Blocked,
    Dropped,
}
