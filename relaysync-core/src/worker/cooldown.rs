//! Anti-loop suppression: a change the worker just wrote to a node must not
//! be treated as a fresh source event when that same node's webhook echoes
//! it back.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::SyncEventType;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// `(node, user_id, item_key, field) -> deadline`.
#[derive(Default)]
pub struct CooldownSet {
    window: Duration,
    entries: Mutex<HashMap<(String, String, String, SyncEventType), Instant>>,
}

impl CooldownSet {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Called right after the worker applies `event_type` to `item_key` for
    /// `user_id` on `node`, so an echoed webhook from that node is
    /// recognized as our own write rather than a new source event.
    pub fn record_apply(
        &self,
        node: &str,
        user_id: &str,
        item_key: &str,
        event_type: SyncEventType,
        now: Instant,
    ) {
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        entries.insert(
            (node.to_string(), user_id.to_string(), item_key.to_string(), event_type),
            now + self.window,
        );
        entries.retain(|_, deadline| *deadline > now);
    }

    /// True if `(node, user_id, item_key, event_type)` is within an active
    /// cooldown window — the pipeline should skip this event as a self-echo.
    pub fn is_cooling_down(
        &self,
        node: &str,
        user_id: &str,
        item_key: &str,
        event_type: SyncEventType,
        now: Instant,
    ) -> bool {
        let entries = self.entries.lock().expect("cooldown lock poisoned");
        entries
            .get(&(node.to_string(), user_id.to_string(), item_key.to_string(), event_type))
            .is_some_and(|deadline| now < *deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_within_window_and_expires() {
        let set = CooldownSet::new(Duration::from_secs(10));
        let t0 = Instant::now();
        set.record_apply("plex-a", "user-1", "/movies/a.mkv", SyncEventType::Watched, t0);
        assert!(set.is_cooling_down(
            "plex-a",
            "user-1",
            "/movies/a.mkv",
            SyncEventType::Watched,
            t0 + Duration::from_secs(2)
        ));
        assert!(!set.is_cooling_down(
            "plex-a",
            "user-1",
            "/movies/a.mkv",
            SyncEventType::Watched,
            t0 + Duration::from_secs(11)
        ));
    }

    #[test]
    fn distinct_fields_do_not_collide() {
        let set = CooldownSet::new(Duration::from_secs(30));
        let t0 = Instant::now();
        set.record_apply("plex-a", "user-1", "/movies/a.mkv", SyncEventType::Watched, t0);
        assert!(!set.is_cooling_down(
            "plex-a",
            "user-1",
            "/movies/a.mkv",
            SyncEventType::Favorite,
            t0
        ));
    }
}
