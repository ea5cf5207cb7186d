use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use palisade_instance::{EventLogEntry, EventOutcome, OperationKind};
use tokio::sync::broadcast;

use crate::support;

const FOLLOW_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct EventLogInner {
    next_seq: u64,
    max_entries: usize,
    entries: VecDeque<EventLogEntry>,
}

/// Append-only event sequence for one instance.
///
/// Entries are never rewritten. Replay is cursor-based over the retained
/// window; live followers get a broadcast stream on top of the replay
/// snapshot. The retained window is capped (see `PALISADE_EVENTS_MAX`);
/// sequence numbers stay stable across eviction.
#[derive(Debug)]
pub struct EventLog {
    inner: Mutex<EventLogInner>,
    follow_tx: broadcast::Sender<EventLogEntry>,
}

impl Default for EventLog {
    fn default() -> Self {
        let (follow_tx, _) = broadcast::channel(FOLLOW_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(EventLogInner {
                next_seq: 1,
                max_entries: support::events_max(),
                entries: VecDeque::new(),
            }),
            follow_tx,
        }
    }
}

impl EventLog {
    pub fn append(
        &self,
        operation: OperationKind,
        outcome: EventOutcome,
        detail: impl Into<String>,
    ) -> EventLogEntry {
        let entry = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let entry = EventLogEntry {
                seq: inner.next_seq,
                at: Utc::now(),
                operation,
                outcome,
                detail: detail.into(),
            };
            inner.next_seq = inner.next_seq.saturating_add(1);
            inner.entries.push_back(entry.clone());
            while inner.entries.len() > inner.max_entries {
                inner.entries.pop_front();
            }
            entry
        };

        // No receivers is fine; replay still sees the entry.
        let _ = self.follow_tx.send(entry.clone());
        entry
    }

    /// Entries with `seq > cursor`, oldest first. Cursor 0 replays the full
    /// retained window.
    pub fn replay_after(&self, cursor: u64) -> Vec<EventLogEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect()
    }

    /// Replay snapshot plus a live receiver for everything appended after it.
    ///
    /// The receiver is subscribed before the snapshot is taken, so entries
    /// appended in between show up in both; followers dedup on `seq`.
    pub fn subscribe(&self, cursor: u64) -> (Vec<EventLogEntry>, broadcast::Receiver<EventLogEntry>) {
        let rx = self.follow_tx.subscribe();
        (self.replay_after(cursor), rx)
    }

    pub fn last_seq(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_seq.saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
