//! Append-only message log with built-in deduplication.
//!
//! The log and the seen-id set are guarded by one mutex so the membership
//! check and the append happen in a single critical section.  Workers on
//! any thread can call into it; the append-only, duplicate-free ordering
//! holds regardless of how many transports are delivering at once.

use std::collections::HashSet;

use parking_lot::Mutex;
use uuid::Uuid;

use cm_protocol::ChatFrame;

use crate::types::Message;

/// Shared, process-lifetime message timeline.
///
/// Seen ids are never evicted: the dedup set grows for as long as the
/// process runs.  That matches the source behavior this client preserves;
/// long-running hosts should be aware of it.
#[derive(Default)]
pub struct MessageLog {
    inner: Mutex<LogInner>,
}

#[derive(Default)]
struct LogInner {
    entries: Vec<Message>,
    seen: HashSet<String>,
    duplicates_dropped: u64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the message built by `make` unless `key` has been seen
    /// before.  Returns whether the message was appended.  Duplicates are
    /// counted but never stored.
    pub fn append_if_new(&self, key: &str, make: impl FnOnce() -> Message) -> bool {
        let mut inner = self.inner.lock();
        if inner.seen.contains(key) {
            inner.duplicates_dropped += 1;
            return false;
        }
        inner.seen.insert(key.to_string());
        let message = make();
        inner.entries.push(message);
        true
    }

    /// Ordered copy of the full timeline.
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// How many inbound frames were dropped as duplicates.
    pub fn duplicates_dropped(&self) -> u64 {
        self.inner.lock().duplicates_dropped
    }
}

/// Compute the dedup key for a decoded chat frame.
///
/// Preference order: the server-assigned `message_id`; else the
/// concatenation of sender, text, and creation time; else a random key.
/// The random branch can never collide with anything, so frames landing
/// there are never deduplicated — a deliberate never-drop fallback rather
/// than an attempt at exactly-once.
pub fn dedup_key(frame: &ChatFrame) -> String {
    if let Some(id) = &frame.message_id {
        return id.clone();
    }
    if frame.created_at.is_some() || !frame.sender.is_empty() || !frame.text.is_empty() {
        return format!(
            "{}-{}-{}",
            frame.sender,
            frame.text,
            frame.created_at.as_deref().unwrap_or("")
        );
    }
    format!("msg-{}", Uuid::new_v4())
}
