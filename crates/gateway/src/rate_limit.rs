//! Rate limiting and admission control: the IP token bucket used at the
//! upgrade boundary, the per-user and global connection ceilings, and the
//! per-client message token bucket enforced on every inbound frame.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::sync::RwLock;

use wsgate_config::RateLimitConfig;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A classic token bucket: `capacity` tokens, refilled at `rate_per_sec`,
/// consumed one at a time. `try_consume` is non-blocking and lock-free per
/// bucket (guarded by the caller holding the owning map's lock briefly).
pub struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    tokens: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    #[must_use]
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            capacity,
            rate_per_sec,
            tokens: capacity,
            last_refill_ms: now_ms(),
        }
    }

    fn refill(&mut self, at_ms: i64) {
        let elapsed_secs = ((at_ms - self.last_refill_ms).max(0) as f64) / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * self.rate_per_sec).min(self.capacity);
        self.last_refill_ms = at_ms;
    }

    /// Attempt to consume one token at time `at_ms`. Exposed with an
    /// explicit timestamp so tests can drive the bucket deterministically.
    pub fn try_consume_at(&mut self, at_ms: i64) -> bool {
        self.refill(at_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(now_ms())
    }
}

/// Per-IP admission buckets, swept periodically so IPs that stop
/// connecting don't accumulate forever.
struct IpBucketEntry {
    bucket: TokenBucket,
    last_seen_ms: i64,
}

pub struct RateLimiterTree {
    config: RateLimitConfig,
    /// New-connections-per-second admission cap, one bucket per source IP.
    max_conns_per_ip: u32,
    ip_buckets: RwLock<HashMap<String, IpBucketEntry>>,
    user_counts: RwLock<HashMap<String, usize>>,
    global_connections: AtomicUsize,
    hits: AtomicI64,
}

impl RateLimiterTree {
    #[must_use]
    pub fn new(config: RateLimitConfig, max_conns_per_ip: u32) -> Self {
        Self {
            config,
            max_conns_per_ip,
            ip_buckets: RwLock::new(HashMap::new()),
            user_counts: RwLock::new(HashMap::new()),
            global_connections: AtomicUsize::new(0),
            hits: AtomicI64::new(0),
        }
    }

    /// Admission check run before an upgrade is accepted: IP bucket, then
    /// global ceiling. Per-user concurrency is enforced separately, after
    /// auth, in `admit_user`.
    pub async fn admit_ip(&self, ip: &str) -> bool {
        let mut buckets = self.ip_buckets.write().await;
        let now = now_ms();
        let max_per_ip = self.max_conns_per_ip;
        let entry = buckets.entry(ip.to_string()).or_insert_with(|| IpBucketEntry {
            bucket: TokenBucket::new(f64::from(max_per_ip.max(1)), f64::from(max_per_ip.max(1))),
            last_seen_ms: now,
        });
        entry.last_seen_ms = now;
        let admitted = entry.bucket.try_consume_at(now);
        if !admitted {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    #[must_use]
    pub fn admit_global(&self) -> bool {
        let current = self.global_connections.load(Ordering::Relaxed);
        if current >= self.config.global_connections {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn note_connection_opened(&self) {
        self.global_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_connection_closed(&self) {
        self.global_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Per-user concurrency check, run at the point a session authenticates.
    pub async fn admit_user(&self, user_id: &str) -> bool {
        let mut counts = self.user_counts.write().await;
        let count = counts.entry(user_id.to_string()).or_insert(0);
        if *count >= self.config.connections_per_user {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        *count += 1;
        true
    }

    pub async fn release_user(&self, user_id: &str) {
        let mut counts = self.user_counts.write().await;
        if let Some(count) = counts.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(user_id);
            }
        }
    }

    /// Sweep IP buckets not touched within `ip_bucket_ttl_secs`.
    pub async fn cleanup_ip_buckets(&self) {
        let cutoff = now_ms() - (i64::from(self.config.ip_bucket_ttl_secs) * 1000);
        let mut buckets = self.ip_buckets.write().await;
        buckets.retain(|_, entry| entry.last_seen_ms >= cutoff);
    }

    #[must_use]
    pub fn total_hits(&self) -> i64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Per-client message bucket, owned by the session it throttles.
pub struct MessageBucket {
    bucket: Arc<tokio::sync::Mutex<TokenBucket>>,
}

impl MessageBucket {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            bucket: Arc::new(tokio::sync::Mutex::new(TokenBucket::new(
                f64::from(config.burst),
                config.messages_per_second,
            ))),
        }
    }

    pub async fn try_consume(&self) -> bool {
        self.bucket.lock().await.try_consume()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            messages_per_second: 20.0,
            burst: 40,
            connections_per_user: 2,
            global_connections: 3,
            ip_bucket_ttl_secs: 300,
        }
    }

    #[test]
    fn token_bucket_exhausts_and_refills() {
        let mut bucket = TokenBucket::new(2.0, 1.0);
        assert!(bucket.try_consume_at(0));
        assert!(bucket.try_consume_at(0));
        assert!(!bucket.try_consume_at(0));
        // 1 second later, one token back.
        assert!(bucket.try_consume_at(1000));
        assert!(!bucket.try_consume_at(1000));
    }

    #[tokio::test]
    async fn admit_global_respects_ceiling() {
        let tree = RateLimiterTree::new(test_config(), 20);
        for _ in 0..3 {
            assert!(tree.admit_global());
            tree.note_connection_opened();
        }
        assert!(!tree.admit_global());
    }

    #[tokio::test]
    async fn admit_user_enforces_per_user_cap() {
        let tree = RateLimiterTree::new(test_config(), 20);
        assert!(tree.admit_user("u1").await);
        assert!(tree.admit_user("u1").await);
        assert!(!tree.admit_user("u1").await);
        tree.release_user("u1").await;
        assert!(tree.admit_user("u1").await);
    }

    #[tokio::test]
    async fn cleanup_ip_buckets_evicts_stale_entries() {
        let cfg = test_config();
        let tree = RateLimiterTree::new(cfg, 20);
        tree.admit_ip("1.2.3.4").await;
        {
            let mut buckets = tree.ip_buckets.write().await;
            if let Some(entry) = buckets.get_mut("1.2.3.4") {
                entry.last_seen_ms = 0;
            }
        }
        tree.cleanup_ip_buckets().await;
        assert!(tree.ip_buckets.read().await.is_empty());
    }

    #[tokio::test]
    async fn three_upgrades_from_same_ip_in_one_second_third_is_rejected() {
        let mut cfg = test_config();
        cfg.global_connections = 10;
        let tree = RateLimiterTree::new(cfg, 2);
        assert!(tree.admit_ip("1.2.3.4").await);
        assert!(tree.admit_ip("1.2.3.4").await);
        assert!(!tree.admit_ip("1.2.3.4").await);
    }
}
