//! Built-in rule checkers.
//!
//! Effects carry well-known shapes the checkers look for:
//! a `payout` object (`total_revenue_cents`, `artist_cents`) in any delta,
//! a `publish` object (`text`, `sponsored`) in any delta, and the
//! `sponsored_mentions` timestamp list the state document accumulates.

use super::{CheckOutcome, PolicyContext, RuleChecker};
use crate::effect::ProposedEffect;
use crate::ledger::EventKind;
use crate::store::DocId;
use chrono::{DateTime, Duration, Utc};

// ── minimum-share ────────────────────────────────────────────────

/// Artist-first rule: a payout must route at least the configured fraction
/// of total revenue to the artist.
pub struct MinimumShare {
    min_share: f64,
}

impl MinimumShare {
    pub fn new(min_share: f64) -> Self {
        Self { min_share }
    }
}

impl RuleChecker for MinimumShare {
    fn name(&self) -> &'static str {
        "minimum-share"
    }

    fn check(&self, effect: &ProposedEffect, _ctx: &PolicyContext<'_>) -> CheckOutcome {
        for delta in effect.state_deltas.values() {
            let Some(payout) = delta.get("payout") else {
                continue;
            };
            let total = payout
                .get("total_revenue_cents")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0);
            let artist = payout
                .get("artist_cents")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0);
            if total <= 0 {
                continue;
            }
            let share = artist as f64 / total as f64;
            if share < self.min_share {
                return CheckOutcome::Fail(format!(
                    "artist share {:.0}% is below minimum {:.0}%",
                    share * 100.0,
                    self.min_share * 100.0
                ));
            }
        }
        CheckOutcome::Pass
    }
}

// ── disclosure-tag ───────────────────────────────────────────────

/// Transparency rule: sponsored publishes must carry the disclosure tag.
/// Soft and correcting: a missing tag is prepended rather than blocked.
pub struct DisclosureTag {
    tag: String,
}

impl DisclosureTag {
    pub fn new(tag: &str) -> Self {
        Self { tag: tag.to_string() }
    }
}

impl RuleChecker for DisclosureTag {
    fn name(&self) -> &'static str {
        "disclosure-tag"
    }

    fn hard(&self) -> bool {
        false
    }

    fn check(&self, effect: &ProposedEffect, _ctx: &PolicyContext<'_>) -> CheckOutcome {
        let mut patched = effect.clone();
        let mut fixed = 0u32;

        for delta in patched.state_deltas.values_mut() {
            let Some(publish) = delta.get_mut("publish") else {
                continue;
            };
            let sponsored = publish
                .get("sponsored")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if !sponsored {
                continue;
            }
            let text = publish
                .get("text")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            if !text.contains(&self.tag) {
                let tagged = format!("{} {text}", self.tag);
                publish["text"] = serde_json::Value::String(tagged);
                fixed += 1;
            }
        }

        if fixed > 0 {
            CheckOutcome::Correct(
                patched,
                format!("added missing {} tag to sponsored content", self.tag),
            )
        } else {
            CheckOutcome::Pass
        }
    }
}

// ── reserve-floor ────────────────────────────────────────────────

/// A debit may never take the balance below the emergency reserve.
pub struct ReserveFloor {
    floor_cents: i64,
}

impl ReserveFloor {
    pub fn new(floor_cents: i64) -> Self {
        Self { floor_cents }
    }
}

impl RuleChecker for ReserveFloor {
    fn name(&self) -> &'static str {
        "reserve-floor"
    }

    fn check(&self, effect: &ProposedEffect, ctx: &PolicyContext<'_>) -> CheckOutcome {
        let Some(entry) = &effect.ledger_entry else {
            return CheckOutcome::Pass;
        };
        if entry.kind != EventKind::Debit {
            return CheckOutcome::Pass;
        }
        if !ctx.ledger.reserve_check(entry.amount_cents, self.floor_cents) {
            return CheckOutcome::Fail(format!(
                "debit of {} cents would leave {} cents, below the {} cent reserve",
                entry.amount_cents,
                ctx.ledger.balance() - entry.amount_cents,
                self.floor_cents
            ));
        }
        CheckOutcome::Pass
    }
}

// ── rate-limit ───────────────────────────────────────────────────

/// Ad-free integrity rule: at most N sponsored publishes per rolling hour.
/// The mention history lives in the state document, so the check is a pure
/// function of (effect, context).
pub struct SponsorRateLimit {
    max_per_hour: u32,
}

impl SponsorRateLimit {
    pub fn new(max_per_hour: u32) -> Self {
        Self { max_per_hour }
    }

    fn proposes_sponsored_publish(effect: &ProposedEffect) -> bool {
        effect.state_deltas.values().any(|delta| {
            delta
                .get("publish")
                .and_then(|p| p.get("sponsored"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
        })
    }

    fn mentions_in_window(ctx: &PolicyContext<'_>) -> u32 {
        let cutoff = ctx.now - Duration::hours(1);
        ctx.snapshot
            .payload(DocId::State)
            .get("sponsored_mentions")
            .and_then(serde_json::Value::as_array)
            .map_or(0, |mentions| {
                mentions
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .filter_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .filter(|t| *t > cutoff && *t <= ctx.now)
                    .count() as u32
            })
    }
}

impl RuleChecker for SponsorRateLimit {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn check(&self, effect: &ProposedEffect, ctx: &PolicyContext<'_>) -> CheckOutcome {
        if !Self::proposes_sponsored_publish(effect) {
            return CheckOutcome::Pass;
        }
        let recent = Self::mentions_in_window(ctx);
        if recent >= self.max_per_hour {
            return CheckOutcome::Fail(format!(
                "{recent} sponsored publish(es) in the last hour, limit {}",
                self.max_per_hour
            ));
        }
        CheckOutcome::Pass
    }
}
