use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

/// Process-local coordinator. Correct only while a single gateway instance
/// serves all traffic.
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    keys: RwLock<HashMap<String, Instant>>,
    counters: RwLock<HashMap<String, Counter>>,
}

impl MemoryCoordinator {
    pub(super) async fn set_if_absent(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut guard = self.keys.write().await;
        match guard.get(key) {
            Some(expires_at) if *expires_at > now => false,
            _ => {
                guard.insert(key.to_owned(), now + ttl);
                true
            }
        }
    }

    pub(super) async fn release(&self, key: &str) {
        self.keys.write().await.remove(key);
    }

    /// Returns the post-increment count and the time left in the window.
    pub(super) async fn increment_with_expiry(&self, key: &str, window: Duration) -> (u64, Duration) {
        let now = Instant::now();
        let mut guard = self.counters.write().await;
        let counter = guard
            .entry(key.to_owned())
            .or_insert(Counter { count: 0, expires_at: now + window });

        if counter.expires_at <= now {
            *counter = Counter { count: 0, expires_at: now + window };
        }
        counter.count = counter.count.saturating_add(1);

        (counter.count, counter.expires_at.saturating_duration_since(now))
    }

    pub(super) async fn evict_expired(&self) -> u64 {
        let now = Instant::now();
        let mut evicted = 0;
        {
            let mut keys = self.keys.write().await;
            let before = keys.len();
            keys.retain(|_, expires_at| *expires_at > now);
            evicted += before - keys.len();
        }
        {
            let mut counters = self.counters.write().await;
            let before = counters.len();
            counters.retain(|_, counter| counter.expires_at > now);
            evicted += before - counters.len();
        }
        evicted as u64
    }
}
