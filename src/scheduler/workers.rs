//! Per-kind execution strategies. A worker is a pure planner: it reads the
//! snapshot it was handed and returns a [`ProposedEffect`]; it never touches
//! the store or the ledger directly.

use super::{RunFailure, RunRequest, TriggerReason};
use crate::effect::ProposedEffect;
use crate::ledger::{EntryDraft, EventKind};
use crate::registry::UnitKind;
use crate::store::{DocId, Snapshot};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

/// Entry point invoked by the scheduler's spawned task. Blocking external
/// work (feeds, APIs, renderers) belongs behind this seam, which is why it
/// is async even though the built-in strategies compute synchronously.
pub async fn execute(
    request: &RunRequest,
    snapshot: &Snapshot,
    now: DateTime<Utc>,
) -> Result<ProposedEffect, RunFailure> {
    match request.unit.kind {
        UnitKind::Scout => scout(request, now),
        UnitKind::Producer => producer(request, snapshot, now),
        UnitKind::Evaluator => evaluator(request, snapshot, now),
    }
}

// ── Scout ────────────────────────────────────────────────────────
//
// Gathers signals into the intel document: event payloads become
// observations, timer wakes record a sweep.

fn scout(request: &RunRequest, now: DateTime<Utc>) -> Result<ProposedEffect, RunFailure> {
    match &request.trigger {
        TriggerReason::Event { name, payload } => Ok(ProposedEffect::new(format!(
            "{}: observed {name}",
            request.unit.id
        ))
        .with_delta(
            DocId::Intel,
            json!({
                "observations": {
                    name: {
                        "payload": payload,
                        "seen_at": now.to_rfc3339(),
                        "via": request.unit.id,
                    }
                }
            }),
        )),
        TriggerReason::Timer => Ok(ProposedEffect::new(format!(
            "{}: sweep complete",
            request.unit.id
        ))
        .with_delta(
            DocId::Intel,
            json!({ "last_sweep": { &request.unit.id: now.to_rfc3339() } }),
        )),
    }
}

// ── Producer ─────────────────────────────────────────────────────
//
// Turns requests into work items in the tasks document. A publish_request
// becomes a publish proposal; a sponsored one also appends to the rolling
// mention log the rate-limit rule reads.

fn producer(
    request: &RunRequest,
    snapshot: &Snapshot,
    now: DateTime<Utc>,
) -> Result<ProposedEffect, RunFailure> {
    match &request.trigger {
        TriggerReason::Event { name, payload } if name == "publish_request" => {
            let Some(text) = payload.get("text").and_then(Value::as_str) else {
                return Err(RunFailure::fatal("publish_request payload missing text"));
            };
            let sponsored = payload
                .get("sponsored")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let mut effect = ProposedEffect::new(format!(
                "{}: drafted publish ({} chars{})",
                request.unit.id,
                text.len(),
                if sponsored { ", sponsored" } else { "" }
            ))
            .with_delta(
                DocId::Tasks,
                json!({
                    "publish": {
                        "text": text,
                        "sponsored": sponsored,
                        "proposed_at": now.to_rfc3339(),
                        "proposed_by": request.unit.id,
                    }
                }),
            );

            if sponsored {
                effect = effect.with_delta(
                    DocId::State,
                    json!({ "sponsored_mentions": mention_log(snapshot, now) }),
                );
            }
            Ok(effect)
        }
        TriggerReason::Event { name, payload } => {
            let id = Uuid::new_v4();
            Ok(
                ProposedEffect::new(format!("{}: queued task for {name}", request.unit.id))
                    .with_delta(
                        DocId::Tasks,
                        json!({
                            "pending": {
                                id.to_string(): {
                                    "source": name,
                                    "payload": payload,
                                    "created_at": now.to_rfc3339(),
                                    "created_by": request.unit.id,
                                }
                            }
                        }),
                    ),
            )
        }
        TriggerReason::Timer => Ok(ProposedEffect::new(format!(
            "{}: nothing to produce",
            request.unit.id
        ))),
    }
}

/// Current mention timestamps still inside the rate-limit horizon, plus one
/// for this proposal. Arrays replace wholesale on merge, so pruning here
/// keeps the log from growing without bound.
fn mention_log(snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<String> {
    let horizon = now - Duration::hours(1);
    let mut log: Vec<String> = snapshot
        .payload(DocId::State)
        .get("sponsored_mentions")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .filter(|raw| {
                    DateTime::parse_from_rfc3339(raw)
                        .map(|t| t.with_timezone(&Utc) > horizon)
                        .unwrap_or(false)
                })
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    log.push(now.to_rfc3339());
    log
}

// ── Evaluator ────────────────────────────────────────────────────
//
// Assesses outcomes: confirmed payments become ledger credits, timer wakes
// write a health summary of the other documents.

fn evaluator(
    request: &RunRequest,
    snapshot: &Snapshot,
    now: DateTime<Utc>,
) -> Result<ProposedEffect, RunFailure> {
    match &request.trigger {
        TriggerReason::Event { name, payload } if name == "payment_received" => {
            let Some(payment_id) = payload.get("payment_id").and_then(Value::as_str) else {
                return Err(RunFailure::fatal("payment_received missing payment_id"));
            };
            let Some(amount_cents) = payload.get("amount_cents").and_then(Value::as_i64) else {
                return Err(RunFailure::fatal("payment_received missing amount_cents"));
            };
            if amount_cents <= 0 {
                return Err(RunFailure::fatal(format!(
                    "payment {payment_id} has non-positive amount {amount_cents}"
                )));
            }
            let from = payload
                .get("from")
                .and_then(Value::as_str)
                .unwrap_or("unknown");

            Ok(ProposedEffect::new(format!(
                "{}: credit {amount_cents}c from {from}",
                request.unit.id
            ))
            .with_ledger_entry(EntryDraft {
                idempotency_key: format!("payment:{payment_id}"),
                kind: EventKind::Credit,
                amount_cents,
                actor: request.unit.id.clone(),
            })
            .with_delta(
                DocId::State,
                json!({
                    "treasury": {
                        "last_payment": {
                            "payment_id": payment_id,
                            "amount_cents": amount_cents,
                            "from": from,
                            "recorded_at": now.to_rfc3339(),
                        }
                    }
                }),
            ))
        }
        TriggerReason::Event { name, .. } => Err(RunFailure::fatal(format!(
            "{} cannot evaluate event {name}",
            request.unit.id
        ))),
        TriggerReason::Timer => {
            let pending = snapshot
                .payload(DocId::Tasks)
                .get("pending")
                .and_then(Value::as_object)
                .map(|m| m.len())
                .unwrap_or(0);
            let observations = snapshot
                .payload(DocId::Intel)
                .get("observations")
                .and_then(Value::as_object)
                .map(|m| m.len())
                .unwrap_or(0);

            Ok(ProposedEffect::new(format!(
                "{}: health summary ({pending} pending, {observations} observations)",
                request.unit.id
            ))
            .with_delta(
                DocId::State,
                json!({
                    "health": {
                        "pending_tasks": pending,
                        "observations": observations,
                        "checked_at": now.to_rfc3339(),
                        "checked_by": request.unit.id,
                    }
                }),
            ))
        }
    }
}
