//! In-process event bus used to shortcut poll latency.
//!
//! Agents remain correct with nothing but catalog polling; events are a
//! hint that a row changed, letting the interested agent poll it on its
//! next cycle instead of waiting out `next_poll_at`. Events for the same
//! (type, id) pair coalesce into one entry with a merge counter, and
//! draining hands back the longest-waiting entries first.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// What changed. Each variant maps to the agent that consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    UpdateRequest,
    NewTransform,
    UpdateTransform,
    NewProcessing,
    UpdateProcessing,
}

/// A coalesced change notification for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    /// Id of the row the event refers to.
    pub actual_id: u64,
    /// How many publishes were merged into this entry.
    pub counter: u32,
    pub first_published_at: DateTime<Utc>,
    pub last_published_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct EventBus {
    pending: Mutex<HashMap<(EventType, u64), Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(EventType, u64), Event>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a change notification; merges with any pending event for the
    /// same row.
    pub fn publish(&self, event_type: EventType, actual_id: u64) {
        let now = Utc::now();
        self.lock()
            .entry((event_type, actual_id))
            .and_modify(|e| {
                e.counter += 1;
                e.last_published_at = now;
            })
            .or_insert(Event {
                event_type,
                actual_id,
                counter: 1,
                first_published_at: now,
                last_published_at: now,
            });
    }

    /// Take up to `limit` pending events of one type, longest-waiting first.
    pub fn drain(&self, event_type: EventType, limit: usize) -> Vec<Event> {
        let mut pending = self.lock();
        let mut keys: Vec<(DateTime<Utc>, u64)> = pending
            .values()
            .filter(|e| e.event_type == event_type)
            .map(|e| (e.first_published_at, e.actual_id))
            .collect();
        keys.sort();
        keys.truncate(limit);
        keys.into_iter()
            .filter_map(|(_, id)| pending.remove(&(event_type, id)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
