use super::*;
use crate::effect::ProposedEffect;
use crate::ledger::{EntryDraft, EventKind, Ledger};
use crate::store::{DocId, IntegrityKeyer, Snapshot, StateStore};
use chrono::Duration;
use serde_json::json;
use std::collections::BTreeMap;
use tempfile::TempDir;

fn gateway() -> PolicyGateway {
    PolicyGateway::new(vec![
        Box::new(MinimumShare::new(0.50)),
        Box::new(DisclosureTag::new("[PARTNER]")),
        Box::new(ReserveFloor::new(2000)),
        Box::new(SponsorRateLimit::new(1)),
    ])
}

fn snapshot_with_state(state: serde_json::Value) -> Snapshot {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path(), IntegrityKeyer::new(b"test")).unwrap();
    let mut deltas = BTreeMap::new();
    deltas.insert(DocId::State, state);
    let snap = store.snapshot();
    store
        .commit(&deltas, &snap.expected_versions(deltas.keys()), "fixture", Utc::now())
        .unwrap();
    store.snapshot()
}

fn empty_snapshot() -> Snapshot {
    snapshot_with_state(json!({}))
}

fn ledger_with_balance(cents: i64) -> (TempDir, Ledger) {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::open(&dir.path().join("ledger.jsonl"), 64).unwrap();
    if cents > 0 {
        let seed = EntryDraft {
            idempotency_key: "seed".into(),
            kind: EventKind::Credit,
            amount_cents: cents,
            actor: "fixture".into(),
        };
        ledger.append(&seed, Utc::now()).unwrap();
    }
    (dir, ledger)
}

fn empty_ledger() -> (TempDir, Ledger) {
    ledger_with_balance(0)
}

fn ctx<'a>(snapshot: &'a Snapshot, ledger: &'a Ledger, now: DateTime<Utc>) -> PolicyContext<'a> {
    PolicyContext {
        snapshot,
        ledger,
        now,
    }
}

fn publish_effect(text: &str, sponsored: bool) -> ProposedEffect {
    ProposedEffect::new("publish").with_delta(
        DocId::Tasks,
        json!({"publish": {"text": text, "sponsored": sponsored}}),
    )
}

// ── aggregation ──────────────────────────────────────────

#[test]
fn clean_effect_is_approved() {
    let snap = empty_snapshot();
    let (_dir, ledger) = empty_ledger();
    let effect = ProposedEffect::new("noop").with_delta(DocId::Intel, json!({"seen": 1}));
    let verdict = gateway().evaluate(&effect, &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Approve);
    assert!(verdict.reasons.is_empty());
    assert!(verdict.corrected.is_none());
}

#[test]
fn verdict_is_deterministic() {
    let snap = empty_snapshot();
    let (_dir, ledger) = empty_ledger();
    let effect = publish_effect("new episode out", true);
    let now = Utc::now();
    let gw = gateway();
    let first = gw.evaluate(&effect, &ctx(&snap, &ledger, now));
    for _ in 0..5 {
        let again = gw.evaluate(&effect, &ctx(&snap, &ledger, now));
        assert_eq!(first.decision, again.decision);
        assert_eq!(first.reasons, again.reasons);
        assert_eq!(first.corrected, again.corrected);
    }
}

#[test]
fn block_reports_citation_chain() {
    let snap = empty_snapshot();
    let (_dir, ledger) = empty_ledger();
    let effect = ProposedEffect::new("payout").with_delta(
        DocId::State,
        json!({"payout": {"total_revenue_cents": 10_000, "artist_cents": 3_000}}),
    );
    let verdict = gateway().evaluate(&effect, &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Block);
    assert_eq!(verdict.reasons.len(), 1);
    assert_eq!(verdict.reasons[0].rule, "minimum-share");
    assert!(verdict.effect_to_commit(&effect).is_none());
}

// ── minimum-share ────────────────────────────────────────

#[test]
fn payout_at_minimum_share_passes() {
    let snap = empty_snapshot();
    let (_dir, ledger) = empty_ledger();
    let effect = ProposedEffect::new("payout").with_delta(
        DocId::State,
        json!({"payout": {"total_revenue_cents": 10_000, "artist_cents": 5_000}}),
    );
    let verdict = gateway().evaluate(&effect, &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Approve);
}

// ── disclosure-tag ───────────────────────────────────────

#[test]
fn sponsored_publish_without_tag_is_corrected() {
    let snap = empty_snapshot();
    let (_dir, ledger) = empty_ledger();
    let effect = publish_effect("try our sponsor", true);
    let verdict = gateway().evaluate(&effect, &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Modify);

    let corrected = verdict.effect_to_commit(&effect).unwrap();
    let text = corrected.state_deltas[&DocId::Tasks]["publish"]["text"]
        .as_str()
        .unwrap();
    assert_eq!(text, "[PARTNER] try our sponsor");
}

#[test]
fn tagged_sponsored_publish_is_approved_unchanged() {
    let snap = empty_snapshot();
    let (_dir, ledger) = empty_ledger();
    let effect = publish_effect("[PARTNER] try our sponsor", true);
    let verdict = gateway().evaluate(&effect, &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Approve);
}

#[test]
fn unsponsored_publish_needs_no_tag() {
    let snap = empty_snapshot();
    let (_dir, ledger) = empty_ledger();
    let effect = publish_effect("regular update", false);
    let verdict = gateway().evaluate(&effect, &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Approve);
}

#[test]
fn correction_happens_at_most_once() {
    // Two correcting checkers: only the first may apply, the second is
    // downgraded to a (soft) failure citation.
    let gw = PolicyGateway::new(vec![
        Box::new(DisclosureTag::new("[PARTNER]")),
        Box::new(DisclosureTag::new("[AD]")),
    ]);
    let snap = empty_snapshot();
    let (_dir, ledger) = empty_ledger();
    let effect = publish_effect("spot", true);
    let verdict = gw.evaluate(&effect, &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Modify);
    assert_eq!(verdict.reasons.len(), 2);
    let text = verdict.corrected.unwrap().state_deltas[&DocId::Tasks]["publish"]["text"]
        .as_str()
        .unwrap()
        .to_string();
    // Only the first correction was applied.
    assert_eq!(text, "[PARTNER] spot");
}

// ── reserve-floor ────────────────────────────────────────

fn debit_effect(cents: i64) -> ProposedEffect {
    ProposedEffect::new("debit").with_ledger_entry(EntryDraft {
        idempotency_key: "d1".into(),
        kind: EventKind::Debit,
        amount_cents: cents,
        actor: "test".into(),
    })
}

#[test]
fn debit_below_reserve_is_blocked() {
    let snap = empty_snapshot();
    let (_dir, ledger) = ledger_with_balance(2500);
    // balance=$25, reserve=$20, debit=$10 → Block
    let verdict = gateway().evaluate(&debit_effect(1000), &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Block);
    assert_eq!(verdict.reasons[0].rule, "reserve-floor");
}

#[test]
fn debit_landing_on_reserve_is_approved() {
    let snap = empty_snapshot();
    let (_dir, ledger) = ledger_with_balance(2500);
    let verdict = gateway().evaluate(&debit_effect(500), &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Approve);
}

#[test]
fn credits_ignore_the_reserve_floor() {
    let snap = empty_snapshot();
    let (_dir, ledger) = empty_ledger();
    let effect = ProposedEffect::new("credit").with_ledger_entry(EntryDraft {
        idempotency_key: "c1".into(),
        kind: EventKind::Credit,
        amount_cents: 100,
        actor: "test".into(),
    });
    let verdict = gateway().evaluate(&effect, &ctx(&snap, &ledger, Utc::now()));
    assert_eq!(verdict.decision, Decision::Approve);
}

// ── rate-limit ───────────────────────────────────────────

#[test]
fn sponsored_publish_over_hourly_limit_is_blocked() {
    let now = Utc::now();
    let snap = snapshot_with_state(json!({
        "sponsored_mentions": [(now - Duration::minutes(10)).to_rfc3339()]
    }));
    let (_dir, ledger) = empty_ledger();
    let effect = publish_effect("[PARTNER] another spot", true);
    let verdict = gateway().evaluate(&effect, &ctx(&snap, &ledger, now));
    assert_eq!(verdict.decision, Decision::Block);
    assert_eq!(verdict.reasons[0].rule, "rate-limit");
}

#[test]
fn stale_mentions_fall_out_of_the_window() {
    let now = Utc::now();
    let snap = snapshot_with_state(json!({
        "sponsored_mentions": [(now - Duration::hours(2)).to_rfc3339()]
    }));
    let (_dir, ledger) = empty_ledger();
    let effect = publish_effect("[PARTNER] fresh hour", true);
    let verdict = gateway().evaluate(&effect, &ctx(&snap, &ledger, now));
    assert_eq!(verdict.decision, Decision::Approve);
}
