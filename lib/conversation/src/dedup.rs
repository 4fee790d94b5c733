//! Inbound event deduplication.
//!
//! The same event can reach the process more than once (webhook retries,
//! inline and deferred delivery racing). [`MessageDeduplicator::register`]
//! admits each event id exactly once.
//!
//! The seen-set lives in memory for the life of the process. A restart
//! forgets it, so at-most-once holds per process, not across restarts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use switchboard_core::{EventId, Identity};
use tracing::debug;

/// Process-lifetime seen-set of event ids.
#[derive(Debug, Default)]
pub struct MessageDeduplicator {
    seen: DashMap<EventId, Instant>,
}

impl MessageDeduplicator {
    /// Creates an empty deduplicator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the first registration of `event_id`, false after.
    ///
    /// The check-and-insert happens under the lock of the map shard that
    /// owns `event_id`, so unrelated ids do not contend on one lock.
    pub fn register(&self, event_id: &EventId) -> bool {
        match self.seen.entry(event_id.clone()) {
            Entry::Occupied(_) => {
                debug!(event_id = %event_id, "duplicate event");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    /// Forgets `event_id`, so a redelivery of it is admitted again.
    pub fn forget(&self, event_id: &EventId) {
        self.seen.remove(event_id);
    }

    /// Forgets ids first seen more than `retention` ago. Returns how many
    /// were dropped.
    pub fn prune(&self, retention: Duration) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| seen_at.elapsed() < retention);
        before.saturating_sub(self.seen.len())
    }

    /// Returns the number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns whether no ids are remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Derives an event id for events that arrive without one.
///
/// Built from the sender, the channel timestamp when there is one, and a
/// hash of the text. Two genuinely different messages with the same text
/// collapse into one when they share a second, or at any time when the
/// channel sends no timestamp, so this is a weaker guarantee than a
/// channel-assigned id.
#[must_use]
pub fn fallback_event_id(from: &Identity, timestamp: Option<DateTime<Utc>>, text: &str) -> EventId {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let digest = hasher.finish();
    match timestamp {
        Some(at) => {
            EventId::derived("fallback", format!("{from}:{}:{digest:016x}", at.timestamp()))
        }
        None => EventId::derived("fallback", format!("{from}:{digest:016x}")),
    }
}
