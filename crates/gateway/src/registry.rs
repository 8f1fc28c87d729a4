//! Sharded connection registry.
//!
//! Connections are assigned to a shard by `client_id` hash so that lookup,
//! add, and remove only ever take a lock on one shard's `RwLock`, keeping
//! contention bounded as connection count grows. Each shard tracks a
//! "primary" map (every connection currently assigned to the shard) and a
//! "secondary" index (authenticated connections, keyed by user id) which
//! is always a subset of the primary map's keys.

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use tokio::sync::{RwLock, mpsc};
use wsgate_protocol::CloseReason;

/// Handle held by the registry for one connected session: enough to push a
/// frame or a close signal without touching the session task directly.
///
/// A connection is admitted before it is authenticated, so `user_id` and
/// `device_id` start empty and are filled in exactly once, whenever
/// authentication succeeds; `OnceLock` gives lock-free reads afterwards
/// without requiring the handle to be rebuilt. `authenticated` is read far
/// more often than it changes (every dispatch checks it), so it gets a
/// plain atomic rather than sharing the `OnceLock`'s write-once semantics.
pub struct ConnectionHandle {
    pub client_id: u64,
    pub remote_ip: String,
    pub user_id: OnceLock<String>,
    pub device_id: OnceLock<String>,
    pub authenticated: AtomicBool,
    pub connected_at_ms: i64,
    pub last_activity_ms: Arc<std::sync::atomic::AtomicI64>,
    pub outbound: mpsc::Sender<OutboundItem>,
}

/// Something pushed into a session's outbound queue: either an application
/// frame to write, or an instruction to close with a given reason.
pub enum OutboundItem {
    Frame(String),
    Close(CloseReason),
}

impl ConnectionHandle {
    pub fn touch(&self, now_ms: i64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(String::as_str)
    }

    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.get().map(String::as_str)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Fill in the identity resolved for this connection and flip it
    /// authenticated. A no-op on fields already set, which can only happen
    /// if a session somehow re-authenticates; the first identity wins.
    pub fn mark_authenticated(&self, user_id: String, device_id: Option<String>) {
        let _ = self.user_id.set(user_id);
        if let Some(device_id) = device_id {
            let _ = self.device_id.set(device_id);
        }
        self.authenticated.store(true, Ordering::Relaxed);
    }

    /// Non-blocking enqueue; returns false if the queue was full or the
    /// session has already gone away.
    pub fn try_send_frame(&self, frame: String) -> bool {
        self.outbound.try_send(OutboundItem::Frame(frame)).is_ok()
    }

    pub fn try_close(&self, reason: CloseReason) {
        let _ = self.outbound.try_send(OutboundItem::Close(reason));
    }
}

#[derive(Default)]
struct Shard {
    primary: HashMap<u64, Arc<ConnectionHandle>>,
    /// user_id -> set of client_ids belonging to that user, within this shard.
    secondary: HashMap<String, Vec<u64>>,
}

pub struct ShardStats {
    pub shard_id: usize,
    pub connections: usize,
}

/// Sharded, concurrently-accessible table of live connections.
pub struct ConnectionRegistry {
    shards: Vec<RwLock<Shard>>,
    shard_count: usize,
    global_count: AtomicUsize,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let mut shards = Vec::with_capacity(shard_count);
        shards.resize_with(shard_count, || RwLock::new(Shard::default()));
        Self {
            shards,
            shard_count,
            global_count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Hash a client id to its shard index using FNV-1a, masked to a
    /// power-of-two shard count.
    #[must_use]
    pub fn shard_for(&self, client_id: u64) -> usize {
        (Self::fnv1a(&client_id.to_le_bytes()) as usize) & (self.shard_count - 1)
    }

    /// FNV-1a hash of a byte key. Used by `shard_for` to spread `client_id`s
    /// across shards — a plain mask over the raw id would clump shard
    /// assignment whenever ids are minted sequentially or share low bits.
    #[must_use]
    pub fn fnv1a(bytes: &[u8]) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }

    /// Register a newly-admitted (not yet authenticated) connection.
    pub async fn add(&self, handle: Arc<ConnectionHandle>) {
        let shard_idx = self.shard_for(handle.client_id);
        let mut shard = self.shards[shard_idx].write().await;
        shard.primary.insert(handle.client_id, handle);
        self.global_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a connection entirely (primary and secondary).
    pub async fn remove(&self, client_id: u64) -> Option<Arc<ConnectionHandle>> {
        let shard_idx = self.shard_for(client_id);
        let mut shard = self.shards[shard_idx].write().await;
        let removed = shard.primary.remove(&client_id);
        if let Some(handle) = &removed {
            if let Some(user_id) = handle.user_id() {
                if let Some(ids) = shard.secondary.get_mut(user_id) {
                    ids.retain(|id| *id != client_id);
                    if ids.is_empty() {
                        shard.secondary.remove(user_id);
                    }
                }
            }
            self.global_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    #[must_use]
    pub async fn lookup(&self, client_id: u64) -> Option<Arc<ConnectionHandle>> {
        let shard_idx = self.shard_for(client_id);
        let shard = self.shards[shard_idx].read().await;
        shard.primary.get(&client_id).cloned()
    }

    /// Mark a connection authenticated and index it by user id. If another
    /// session for the same `(user_id, device_id)` already exists, it is
    /// superseded: closed with `CloseReason::Superseded` and removed.
    ///
    /// Returns the client_id of the session that was superseded, if any.
    /// No-op (returns `None`) if `client_id` isn't currently registered —
    /// the connection may have dropped between admission and auth completing.
    pub async fn register_authenticated(
        &self,
        client_id: u64,
        user_id: String,
        device_id: Option<&str>,
    ) -> Option<u64> {
        let shard_idx = self.shard_for(client_id);
        let mut shard = self.shards[shard_idx].write().await;

        if !shard.primary.contains_key(&client_id) {
            return None;
        }

        let mut superseded = None;
        if let Some(device_id) = device_id {
            let existing_ids = shard.secondary.get(&user_id).cloned().unwrap_or_default();
            for existing_id in existing_ids {
                if existing_id == client_id {
                    continue;
                }
                if let Some(existing) = shard.primary.get(&existing_id)
                    && existing.device_id() == Some(device_id)
                {
                    existing.try_close(CloseReason::Superseded);
                    superseded = Some(existing_id);
                }
            }
        }

        if let Some(old_id) = superseded {
            if let Some(ids) = shard.secondary.get_mut(&user_id) {
                ids.retain(|id| *id != old_id);
            }
            shard.primary.remove(&old_id);
            self.global_count.fetch_sub(1, Ordering::Relaxed);
        }

        if let Some(handle) = shard.primary.get(&client_id) {
            handle.mark_authenticated(user_id.clone(), device_id.map(str::to_string));
        }
        shard.secondary.entry(user_id).or_default().push(client_id);
        superseded
    }

    /// All authenticated sessions for a user, across whichever shard they
    /// live in (a user's devices can land on different shards when sharded
    /// by `client_id`).
    #[must_use]
    pub async fn lookup_user(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let mut results = Vec::new();
        for shard_lock in &self.shards {
            let shard = shard_lock.read().await;
            if let Some(ids) = shard.secondary.get(user_id) {
                for id in ids {
                    if let Some(handle) = shard.primary.get(id) {
                        results.push(Arc::clone(handle));
                    }
                }
            }
        }
        results
    }

    /// Close and remove sessions whose `last_activity` predates `cutoff_ms`.
    /// Returns the number of sessions closed.
    pub async fn cleanup_stale(&self, cutoff_ms: i64) -> usize {
        let mut closed = 0;
        for shard_lock in &self.shards {
            let shard = shard_lock.read().await;
            for handle in shard.primary.values() {
                if handle.last_activity_ms() < cutoff_ms {
                    handle.try_close(CloseReason::HeartbeatTimeout);
                    closed += 1;
                }
            }
        }
        closed
    }

    #[must_use]
    pub fn global_connections(&self) -> usize {
        self.global_count.load(Ordering::Relaxed)
    }

    /// Every currently-registered connection handle, across all shards.
    /// Used by the lifecycle controller to broadcast a close signal.
    pub async fn all_handles(&self) -> Vec<Arc<ConnectionHandle>> {
        let mut out = Vec::with_capacity(self.global_connections());
        for shard_lock in &self.shards {
            let shard = shard_lock.read().await;
            out.extend(shard.primary.values().cloned());
        }
        out
    }

    pub async fn stats(&self) -> Vec<ShardStats> {
        let mut out = Vec::with_capacity(self.shards.len());
        for (shard_id, shard_lock) in self.shards.iter().enumerate() {
            let shard = shard_lock.read().await;
            out.push(ShardStats {
                shard_id,
                connections: shard.primary.len(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    fn handle(client_id: u64, user_id: Option<&str>, device_id: Option<&str>) -> Arc<ConnectionHandle> {
        let (tx, _rx) = mpsc::channel(8);
        let user_id_lock = OnceLock::new();
        if let Some(user_id) = user_id {
            let _ = user_id_lock.set(user_id.to_string());
        }
        let device_id_lock = OnceLock::new();
        if let Some(device_id) = device_id {
            let _ = device_id_lock.set(device_id.to_string());
        }
        Arc::new(ConnectionHandle {
            client_id,
            remote_ip: "127.0.0.1".into(),
            user_id: user_id_lock,
            device_id: device_id_lock,
            authenticated: AtomicBool::new(user_id.is_some()),
            connected_at_ms: 0,
            last_activity_ms: Arc::new(AtomicI64::new(0)),
            outbound: tx,
        })
    }

    #[tokio::test]
    async fn shard_count_is_rounded_to_power_of_two() {
        let registry = ConnectionRegistry::new(5);
        assert_eq!(registry.shard_count(), 8);
    }

    #[tokio::test]
    async fn add_lookup_remove_round_trip() {
        let registry = ConnectionRegistry::new(4);
        let h = handle(42, None, None);
        registry.add(Arc::clone(&h)).await;
        assert_eq!(registry.global_connections(), 1);
        assert!(registry.lookup(42).await.is_some());
        registry.remove(42).await;
        assert_eq!(registry.global_connections(), 0);
        assert!(registry.lookup(42).await.is_none());
    }

    #[tokio::test]
    async fn authenticating_second_device_supersedes_first() {
        let registry = ConnectionRegistry::new(4);
        let h1 = handle(1, None, Some("d1"));
        registry.add(Arc::clone(&h1)).await;
        registry
            .register_authenticated(1, "u1".into(), Some("d1"))
            .await;

        let h2 = handle(2, None, Some("d1"));
        registry.add(Arc::clone(&h2)).await;
        let superseded = registry
            .register_authenticated(2, "u1".into(), Some("d1"))
            .await;
        assert_eq!(superseded, Some(1));

        let sessions = registry.lookup_user("u1").await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].client_id, 2);
    }

    #[tokio::test]
    async fn lookup_user_finds_devices_across_shards() {
        let registry = ConnectionRegistry::new(4);
        for client_id in [0_u64, 1, 2, 3] {
            let h = handle(client_id, None, Some("dx"));
            registry.add(Arc::clone(&h)).await;
            registry
                .register_authenticated(client_id, "shared-user".into(), Some(&format!("d{client_id}")))
                .await;
        }
        let sessions = registry.lookup_user("shared-user").await;
        assert_eq!(sessions.len(), 4);
    }
}
