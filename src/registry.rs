//! Catalog of runnable unit definitions.
//!
//! Units are registered once at process start from configuration and never
//! mutated at runtime. Iteration is in id order so scheduling tie-breaks are
//! deterministic.

use crate::error::ConfigError;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// ── Kind / tier / class ──────────────────────────────────────────

/// Closed set of execution strategies. Behavior is selected by match, never
/// by open-ended subclassing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UnitKind {
    /// Gathers observations into the intel document.
    Scout,
    /// Drafts work items and publish proposals into the tasks document.
    Producer,
    /// Assesses hive health and converts payment events into ledger credits.
    Evaluator,
}

/// Strict priority tiers. Ordering is scheduling order: `Critical` sorts
/// before everything else.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PriorityTier {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl PriorityTier {
    /// Critical and High starve every lower tier while queued and
    /// capacity-eligible.
    pub fn is_urgent(self) -> bool {
        matches!(self, PriorityTier::Critical | PriorityTier::High)
    }
}

impl Default for PriorityTier {
    fn default() -> Self {
        PriorityTier::Normal
    }
}

/// Concurrency classes carry independent caps. The ledger class is capped
/// at 1 so appends stay single-writer without any locking protocol.
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
pub enum ConcurrencyClass {
    Ledger,
    Content,
    Research,
}

// ── Schedule spec ────────────────────────────────────────────────

/// When a unit becomes due. `Manual` units only run via `spawn` or an event
/// subscription.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Every(Duration),
    Cron(Box<Schedule>),
    Manual,
}

impl ScheduleSpec {
    /// Whether a timer run is due at `now` given the last run time.
    /// A unit that has never run is due immediately (interval) or at its
    /// first cron occurrence after process start.
    pub fn due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            ScheduleSpec::Every(interval) => {
                last_run.is_none_or(|last| now - last >= *interval)
            }
            ScheduleSpec::Cron(schedule) => match last_run {
                None => true,
                Some(last) => schedule.after(&last).next().is_some_and(|due| due <= now),
            },
            ScheduleSpec::Manual => false,
        }
    }
}

// ── Unit ─────────────────────────────────────────────────────────

/// A runnable task definition. Immutable once registered.
#[derive(Debug, Clone)]
pub struct Unit {
    pub id: String,
    pub kind: UnitKind,
    pub tier: PriorityTier,
    pub schedule: ScheduleSpec,
    pub class: ConcurrencyClass,
    /// Event names this unit wakes on. Static, declared at registration.
    pub subscribes: Vec<String>,
}

// ── Registry ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TaskRegistry {
    units: BTreeMap<String, Arc<Unit>>,
}

impl TaskRegistry {
    pub fn new(units: Vec<Unit>) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for unit in units {
            if unit.id.is_empty() {
                return Err(ConfigError::Validation("unit with empty id".into()));
            }
            let id = unit.id.clone();
            if map.insert(id.clone(), Arc::new(unit)).is_some() {
                return Err(ConfigError::Validation(format!("duplicate unit id: {id}")));
            }
        }
        Ok(Self { units: map })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Unit>> {
        self.units.get(id)
    }

    /// Units in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Unit>> {
        self.units.values()
    }

    /// Units subscribed to the named event, in id order.
    pub fn subscribers(&self, event: &str) -> Vec<Arc<Unit>> {
        self.units
            .values()
            .filter(|u| u.subscribes.iter().any(|e| e == event))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn unit(id: &str) -> Unit {
        Unit {
            id: id.into(),
            kind: UnitKind::Scout,
            tier: PriorityTier::Normal,
            schedule: ScheduleSpec::Every(Duration::minutes(5)),
            class: ConcurrencyClass::Research,
            subscribes: vec!["mention".into()],
        }
    }

    #[test]
    fn duplicate_unit_id_is_rejected() {
        let err = TaskRegistry::new(vec![unit("a"), unit("a")]).unwrap_err();
        assert!(err.to_string().contains("duplicate unit id"));
    }

    #[test]
    fn iteration_is_id_ordered() {
        let registry = TaskRegistry::new(vec![unit("b"), unit("a"), unit("c")]).unwrap();
        let ids: Vec<&str> = registry.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn subscribers_match_event_name() {
        let mut silent = unit("quiet");
        silent.subscribes.clear();
        let registry = TaskRegistry::new(vec![unit("loud"), silent]).unwrap();
        let subs = registry.subscribers("mention");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, "loud");
        assert!(registry.subscribers("unknown").is_empty());
    }

    #[test]
    fn interval_schedule_due_semantics() {
        let spec = ScheduleSpec::Every(Duration::minutes(10));
        let now = Utc::now();
        assert!(spec.due(None, now));
        assert!(!spec.due(Some(now - Duration::minutes(5)), now));
        assert!(spec.due(Some(now - Duration::minutes(10)), now));
    }

    #[test]
    fn cron_schedule_due_semantics() {
        use chrono::TimeZone;
        // Every minute, on the minute.
        let schedule = Schedule::from_str("0 * * * * *").unwrap();
        let spec = ScheduleSpec::Cron(Box::new(schedule));
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 10).unwrap();
        assert!(spec.due(None, t));
        // Last ran two minutes ago: a boundary has passed since.
        assert!(spec.due(Some(t - Duration::minutes(2)), t));
        // Last ran ten seconds ago: next boundary (12:01:00) not reached yet.
        assert!(!spec.due(Some(t), t + Duration::seconds(20)));
    }

    #[test]
    fn manual_schedule_never_due() {
        let spec = ScheduleSpec::Manual;
        assert!(!spec.due(None, Utc::now()));
    }

    #[test]
    fn tier_ordering_is_scheduling_order() {
        assert!(PriorityTier::Critical < PriorityTier::High);
        assert!(PriorityTier::High < PriorityTier::Normal);
        assert!(PriorityTier::Background > PriorityTier::Low);
        assert!(PriorityTier::Critical.is_urgent());
        assert!(!PriorityTier::Normal.is_urgent());
    }
}
