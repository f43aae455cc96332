//! Policy gateway — the synchronous chokepoint every proposed effect with
//! externally-visible consequences must pass before commit.
//!
//! The gateway evaluates an ordered list of independent rule checkers.
//! Verdicts are deterministic: the same (effect, context) pair always yields
//! the same verdict. Anything time-dependent reads the clock from the
//! context, never from the wall.

use crate::effect::ProposedEffect;
use crate::ledger::Ledger;
use crate::store::Snapshot;
use chrono::{DateTime, Utc};

mod checkers;
pub use checkers::{DisclosureTag, MinimumShare, ReserveFloor, SponsorRateLimit};

#[cfg(test)]
mod tests;

// ── Verdict ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Decision {
    Block,
    Modify,
    Approve,
}

/// Which rule said what. Ordered by evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCitation {
    pub rule: &'static str,
    pub reason: String,
}

/// Never persisted as state; only its occurrence is logged.
#[derive(Debug, Clone)]
pub struct PolicyVerdict {
    pub decision: Decision,
    pub reasons: Vec<RuleCitation>,
    /// Present only on `Modify`: the effect as the gateway corrected it.
    pub corrected: Option<ProposedEffect>,
}

impl PolicyVerdict {
    /// The effect to commit, if any: the corrected one on `Modify`, the
    /// original otherwise. `None` on `Block`.
    pub fn effect_to_commit<'a>(&'a self, original: &'a ProposedEffect) -> Option<&'a ProposedEffect> {
        match self.decision {
            Decision::Block => None,
            Decision::Modify => self.corrected.as_ref(),
            Decision::Approve => Some(original),
        }
    }
}

// ── Checker interface ────────────────────────────────────────────

/// Everything a checker may consult. Built by the scheduler from the same
/// snapshot and ledger the commit will be validated against.
pub struct PolicyContext<'a> {
    pub snapshot: &'a Snapshot,
    pub ledger: &'a Ledger,
    pub now: DateTime<Utc>,
}

pub enum CheckOutcome {
    Pass,
    Fail(String),
    Correct(ProposedEffect, String),
}

pub trait RuleChecker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hard checkers block on failure; soft ones only record a citation.
    fn hard(&self) -> bool {
        true
    }

    fn check(&self, effect: &ProposedEffect, ctx: &PolicyContext<'_>) -> CheckOutcome;
}

// ── Gateway ──────────────────────────────────────────────────────

pub struct PolicyGateway {
    checkers: Vec<Box<dyn RuleChecker>>,
}

impl PolicyGateway {
    pub fn new(checkers: Vec<Box<dyn RuleChecker>>) -> Self {
        Self { checkers }
    }

    /// The built-in rule set, thresholds from config.
    pub fn with_default_rules(policy: &crate::config::PolicyConfig) -> Self {
        Self::new(vec![
            Box::new(MinimumShare::new(policy.artist_min_share)),
            Box::new(DisclosureTag::new(&policy.disclosure_tag)),
            Box::new(ReserveFloor::new(policy.reserve_floor_cents)),
            Box::new(SponsorRateLimit::new(policy.max_sponsored_per_hour)),
        ])
    }

    /// Evaluate the effect against all checkers in order.
    ///
    /// Any hard `Fail` → `Block`. The first `Correct` is applied and the
    /// remaining checkers re-run against the corrected effect; at most one
    /// correction is applied per evaluation, so a further `Correct` is
    /// treated as a failure of its checker (no oscillation).
    pub fn evaluate(&self, effect: &ProposedEffect, ctx: &PolicyContext<'_>) -> PolicyVerdict {
        let mut reasons = Vec::new();
        let mut current = effect.clone();
        let mut corrected = false;

        for checker in &self.checkers {
            let outcome = checker.check(&current, ctx);
            let outcome = match outcome {
                CheckOutcome::Correct(patched, reason) if corrected => {
                    // Correction budget spent; the rule still found a problem.
                    let _ = patched;
                    CheckOutcome::Fail(reason)
                }
                other => other,
            };

            match outcome {
                CheckOutcome::Pass => {}
                CheckOutcome::Fail(reason) => {
                    let hard = checker.hard();
                    reasons.push(RuleCitation {
                        rule: checker.name(),
                        reason,
                    });
                    if hard {
                        return PolicyVerdict {
                            decision: Decision::Block,
                            reasons,
                            corrected: None,
                        };
                    }
                }
                CheckOutcome::Correct(patched, reason) => {
                    reasons.push(RuleCitation {
                        rule: checker.name(),
                        reason,
                    });
                    current = patched;
                    corrected = true;
                }
            }
        }

        if corrected {
            PolicyVerdict {
                decision: Decision::Modify,
                reasons,
                corrected: Some(current),
            }
        } else {
            PolicyVerdict {
                decision: Decision::Approve,
                reasons,
                corrected: None,
            }
        }
    }
}
