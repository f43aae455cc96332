//! In-process event bus.
//!
//! Producers publish named events; units declare static subscriptions at
//! registration. Delivery happens on the next scheduler tick, at most once
//! per RunRequest creation: a burst of identical events before a tick
//! collapses to one queued event carrying the latest payload, so event
//! storms cannot blow past concurrency caps.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub name: String,
    pub payload: serde_json::Value,
    pub first_seen: DateTime<Utc>,
    /// How many publishes collapsed into this entry.
    pub coalesced: u32,
}

#[derive(Default)]
pub struct EventBus {
    // BTreeMap keyed by event name: coalescing and deterministic drain order.
    queue: Mutex<BTreeMap<String, QueuedEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue for the next tick. Re-publishing an already-queued name
    /// replaces the payload with the latest one.
    pub fn publish(&self, name: &str, payload: serde_json::Value, now: DateTime<Utc>) {
        let mut queue = self.queue.lock().expect("event bus lock poisoned");
        match queue.entry(name.to_string()) {
            Entry::Occupied(mut queued) => {
                let queued = queued.get_mut();
                queued.payload = payload;
                queued.coalesced += 1;
            }
            Entry::Vacant(slot) => {
                slot.insert(QueuedEvent {
                    name: name.to_string(),
                    payload,
                    first_seen: now,
                    coalesced: 1,
                });
            }
        }
    }

    /// Take everything queued since the last drain, in name order.
    pub fn drain(&self) -> Vec<QueuedEvent> {
        let mut queue = self.queue.lock().expect("event bus lock poisoned");
        std::mem::take(&mut *queue).into_values().collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("event bus lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn burst_coalesces_to_latest_payload() {
        let bus = EventBus::new();
        let now = Utc::now();
        bus.publish("payment_received", json!({"id": 1}), now);
        bus.publish("payment_received", json!({"id": 2}), now);
        bus.publish("payment_received", json!({"id": 3}), now);

        let drained = bus.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, json!({"id": 3}));
        assert_eq!(drained[0].coalesced, 3);
    }

    #[test]
    fn distinct_events_stay_separate_and_ordered() {
        let bus = EventBus::new();
        let now = Utc::now();
        bus.publish("mention", json!({}), now);
        bus.publish("donation", json!({}), now);

        let names: Vec<String> = bus.drain().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["donation", "mention"]);
    }

    #[test]
    fn drain_empties_the_queue() {
        let bus = EventBus::new();
        bus.publish("mention", json!({}), Utc::now());
        assert_eq!(bus.pending(), 1);
        bus.drain();
        assert_eq!(bus.pending(), 0);
        assert!(bus.drain().is_empty());
    }
}
