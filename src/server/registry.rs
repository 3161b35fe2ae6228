//! Session registry: live sessions and traffic per target.
//!
//! Keyed by the target `host:port`. An entry exists exactly while at least
//! one session to that target is open; the count update and the
//! insert/remove happen under one lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::policy::{PolicyStore, BYTESLIST};
use crate::proxy::FrameObserver;

/// Accounting for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry {
    /// Open sessions, always at least 1
    pub count: i64,
    /// Frame bytes received from upstream
    pub bytes: i64,
    /// Unix time the first of the current sessions opened
    pub first_seen_unix: i64,
}

/// Thread-safe table of open sessions.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new session to `key`. Returns the new count.
    pub fn open(&self, key: &str) -> i64 {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| SessionEntry {
            count: 0,
            bytes: 0,
            first_seen_unix: chrono::Utc::now().timestamp(),
        });
        entry.count += 1;
        entry.count
    }

    /// Record a closed session to `key`, removing the entry at zero.
    /// Returns the remaining count.
    pub fn close(&self, key: &str) -> i64 {
        let mut entries = self.entries.lock();
        let remaining = match entries.get_mut(key) {
            Some(entry) => {
                entry.count -= 1;
                entry.count
            }
            None => return 0,
        };
        if remaining <= 0 {
            entries.remove(key);
        }
        remaining.max(0)
    }

    /// Add received bytes to an open entry. Unknown keys are ignored.
    pub fn add_bytes(&self, key: &str, bytes: i64) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.bytes += bytes;
        }
    }

    pub fn get(&self, key: &str) -> Option<SessionEntry> {
        self.entries.lock().get(key).copied()
    }

    /// Number of targets with open sessions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// All entries, busiest target first.
    pub fn snapshot(&self) -> Vec<(String, SessionEntry)> {
        let mut all: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        all.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
        all
    }
}

/// Holds one open session in the registry and closes it on drop.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    key: String,
}

impl SessionGuard {
    pub fn new(registry: Arc<SessionRegistry>, key: impl Into<String>) -> Self {
        let key = key.into();
        registry.open(&key);
        Self { registry, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current entry for this session's target.
    pub fn entry(&self) -> Option<SessionEntry> {
        self.registry.get(&self.key)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.close(&self.key);
    }
}

/// Feeds received frame lengths into the registry and the byte ledger.
pub struct TrafficAccounting {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn PolicyStore>,
    key: String,
}

impl TrafficAccounting {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<dyn PolicyStore>, key: String) -> Self {
        Self {
            registry,
            store,
            key,
        }
    }
}

#[async_trait]
impl FrameObserver for TrafficAccounting {
    async fn on_frame(&self, frame_len: usize) {
        let bytes = frame_len as i64;
        self.registry.add_bytes(&self.key, bytes);
        if let Err(e) = self.store.increment(BYTESLIST, &self.key, bytes).await {
            tracing::warn!("byte ledger for {} not updated: {}", self.key, e);
        }
    }
}

/// Render a duration in seconds as e.g. `1d2h3m4s`; larger units are
/// omitted until the span exceeds them.
pub fn format_span(secs: i64) -> String {
    let mut span = String::new();
    if secs > 86_400 {
        span.push_str(&format!("{}d", secs / 86_400));
    }
    if secs > 3_600 {
        span.push_str(&format!("{}h", (secs % 86_400) / 3_600));
    }
    if secs > 60 {
        span.push_str(&format!("{}m", (secs % 3_600) / 60));
    }
    span.push_str(&format!("{}s", secs % 60));
    span
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MemoryPolicyStore;

    #[test]
    fn test_open_and_close_counts() {
        let registry = SessionRegistry::new();
        for _ in 0..5 {
            registry.open("example.com:443");
        }
        for _ in 0..3 {
            registry.close("example.com:443");
        }
        assert_eq!(registry.get("example.com:443").unwrap().count, 2);

        registry.close("example.com:443");
        assert_eq!(registry.close("example.com:443"), 0);
        assert!(registry.get("example.com:443").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_unknown_key() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.close("nowhere:1"), 0);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_concurrent_open_close() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        registry.open("busy:80");
                        registry.close("busy:80");
                    }
                    registry.open("busy:80");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.get("busy:80").unwrap().count, 8);
    }

    #[test]
    fn test_guard_closes_once() {
        let registry = Arc::new(SessionRegistry::new());
        let first = SessionGuard::new(Arc::clone(&registry), "example.com:80");
        let second = SessionGuard::new(Arc::clone(&registry), "example.com:80");
        assert_eq!(first.entry().unwrap().count, 2);
        assert_eq!(second.key(), "example.com:80");

        drop(first);
        assert_eq!(registry.get("example.com:80").unwrap().count, 1);
        drop(second);
        assert!(registry.get("example.com:80").is_none());
    }

    #[test]
    fn test_first_seen_kept_while_open() {
        let registry = SessionRegistry::new();
        registry.open("a:1");
        let first_seen = registry.get("a:1").unwrap().first_seen_unix;
        registry.open("a:1");
        assert_eq!(registry.get("a:1").unwrap().first_seen_unix, first_seen);
        assert!(first_seen > 0);
    }

    #[test]
    fn test_snapshot_order() {
        let registry = SessionRegistry::new();
        registry.open("quiet:1");
        registry.open("busy:1");
        registry.open("busy:1");

        let keys: Vec<_> = registry.snapshot().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["busy:1", "quiet:1"]);
    }

    #[tokio::test]
    async fn test_traffic_accounting() {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MemoryPolicyStore::new());
        let _guard = SessionGuard::new(Arc::clone(&registry), "example.com:443");
        let accounting = TrafficAccounting::new(
            Arc::clone(&registry),
            store.clone(),
            "example.com:443".to_string(),
        );

        accounting.on_frame(100).await;
        accounting.on_frame(28).await;

        assert_eq!(registry.get("example.com:443").unwrap().bytes, 128);
        assert_eq!(store.count(BYTESLIST, "example.com:443"), Some(128));
    }

    #[test]
    fn test_format_span() {
        assert_eq!(format_span(0), "0s");
        assert_eq!(format_span(59), "59s");
        assert_eq!(format_span(61), "1m1s");
        assert_eq!(format_span(3_661), "1h1m1s");
        assert_eq!(format_span(93_784), "1d2h3m4s");
    }
}
