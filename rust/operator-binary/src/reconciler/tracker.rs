//! Last-seen tracking for service-user versions.
//!
//! Timestamps are caller-supplied integers (Unix seconds) rather than
//! `DateTime<Utc>` so the tracker has no direct dependency on wall-clock
//! reads, keeping it trivially testable and usable from a single tick-wide
//! "now" snapshot.

use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    service: String,
    host: String,
    version: String,
}

/// `tracker[service][host][version] = lastSeen`.
#[derive(Default)]
pub struct LastSeenTracker {
    entries: RwLock<BTreeMap<Key, i64>>,
}

impl LastSeenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-stamps `lastSeen` for `(service, host, version)`, as both pod
    /// observation and ground-truth reconstruction do.
    pub fn observe(&self, service: &str, host: &str, version: &str, timestamp: i64) {
        let key = Key {
            service: service.to_string(),
            host: host.to_string(),
            version: version.to_string(),
        };
        self.entries
            .write()
            .expect("tracker lock poisoned")
            .insert(key, timestamp);
    }

    pub fn last_seen(&self, service: &str, host: &str, version: &str) -> Option<i64> {
        let key = Key {
            service: service.to_string(),
            host: host.to_string(),
            version: version.to_string(),
        };
        self.entries.read().expect("tracker lock poisoned").get(&key).copied()
    }

    /// Removes the tracker entry, e.g. once its version has been deleted
    /// from the target.
    pub fn remove(&self, service: &str, host: &str, version: &str) {
        let key = Key {
            service: service.to_string(),
            host: host.to_string(),
            version: version.to_string(),
        };
        self.entries.write().expect("tracker lock poisoned").remove(&key);
    }

    /// All versions currently tracked for `(service, host)`, for stale-user
    /// sweeps.
    pub fn versions_for(&self, service: &str, host: &str) -> Vec<String> {
        self.entries
            .read()
            .expect("tracker lock poisoned")
            .keys()
            .filter(|key| key.service == service && key.host == host)
            .map(|key| key.version.clone())
            .collect()
    }

    /// Whether `now - lastSeen > maxTimeNotSeen`, i.e. STALE → DELETED.
    pub fn is_stale(&self, service: &str, host: &str, version: &str, now: i64, max_time_not_seen: i64) -> bool {
        match self.last_seen(service, host, version) {
            Some(last_seen) => now - last_seen > max_time_not_seen,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observing_then_reading_round_trips() {
        let tracker = LastSeenTracker::new();
        tracker.observe("nova", "vc-ba123", "1", 42);
        assert_eq!(tracker.last_seen("nova", "vc-ba123", "1"), Some(42));
        assert_eq!(tracker.last_seen("nova", "vc-ba123", "2"), None);
    }

    #[test]
    fn removing_clears_the_entry() {
        let tracker = LastSeenTracker::new();
        tracker.observe("nova", "vc-ba123", "1", 42);
        tracker.remove("nova", "vc-ba123", "1");
        assert_eq!(tracker.last_seen("nova", "vc-ba123", "1"), None);
    }

    #[test]
    fn is_stale_past_the_max_time_not_seen_window() {
        let tracker = LastSeenTracker::new();
        tracker.observe("nova", "vc-ba123", "1", 0);
        assert!(!tracker.is_stale("nova", "vc-ba123", "1", 100, 200));
        assert!(tracker.is_stale("nova", "vc-ba123", "1", 300, 200));
    }

    #[test]
    fn versions_for_filters_to_the_requested_service_and_host() {
        let tracker = LastSeenTracker::new();
        tracker.observe("nova", "vc-ba123", "1", 0);
        tracker.observe("nova", "vc-ba123", "2", 0);
        tracker.observe("nova", "vc-other", "1", 0);
        let mut versions = tracker.versions_for("nova", "vc-ba123");
        versions.sort();
        assert_eq!(versions, vec!["1".to_string(), "2".to_string()]);
    }
}
