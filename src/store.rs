//! Coordination store — cross-pod tunnel ownership keys.
//!
//! Each live tunnel is registered as `tunnel:{tunnel_id} → pod_id` with a TTL.
//! The store is the arbiter of ownership: claims use an atomic set-if-absent
//! (`SET NX EX`), releases and refreshes compare the stored owner first (Lua
//! scripts), so two pods racing the same `tunnel_id` can never both win and a
//! pod can never delete a newer registration made by a peer. Plain
//! read-then-write is not acceptable here.
//!
//! Backends: Redis for real deployments, and an in-memory map with the same
//! conditional semantics for tests and single-pod development. Cloning a
//! memory store shares its map, so two "pods" in a test see one store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Outcome of a claim attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This pod now owns the tunnel key.
    Claimed,
    /// Another pod got there first.
    OwnedBy(String),
}

/// Errors from the store backend.
#[derive(Debug)]
pub enum StoreError {
    Redis(redis::RedisError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Redis(e) => write!(f, "redis error: {e}"),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Redis(e)
    }
}

fn tunnel_key(tunnel_id: &str) -> String {
    format!("tunnel:{tunnel_id}")
}

/// Compare-and-delete: remove the key only if this pod still owns it.
const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end";

/// Compare-and-refresh: extend the TTL while this pod owns the key, re-claim
/// it if it expired, refuse if another pod took it over.
const REFRESH_SCRIPT: &str = r"
local owner = redis.call('get', KEYS[1])
if owner == false then
    redis.call('set', KEYS[1], ARGV[1], 'EX', ARGV[2])
    return 1
elseif owner == ARGV[1] then
    redis.call('expire', KEYS[1], ARGV[2])
    return 1
else
    return 0
end";

/// Backing map for the in-memory backend. Cloned handles share entries.
#[derive(Clone, Default)]
pub struct MemoryMap {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

/// Key/value store with TTL and conditional writes.
#[derive(Clone)]
pub enum CoordinationStore {
    Redis(ConnectionManager),
    Memory(MemoryMap),
}

impl CoordinationStore {
    /// Connect to Redis at the given URL. The connection manager reconnects
    /// transparently after transient failures.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!(url, "Coordination store connected");
        Ok(CoordinationStore::Redis(manager))
    }

    /// In-memory backend with the same conditional-write semantics.
    pub fn in_memory() -> Self {
        CoordinationStore::Memory(MemoryMap::default())
    }

    /// Round-trip connectivity check for the readiness probe.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            CoordinationStore::Redis(manager) => {
                let mut conn = manager.clone();
                redis::cmd("PING").query_async::<String>(&mut conn).await?;
                Ok(())
            }
            CoordinationStore::Memory(_) => Ok(()),
        }
    }

    /// Atomically claim `tunnel:{tunnel_id}` for `pod_id` with a TTL.
    pub async fn try_claim(
        &self,
        tunnel_id: &str,
        pod_id: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let key = tunnel_key(tunnel_id);
        match self {
            CoordinationStore::Redis(manager) => {
                let mut conn = manager.clone();
                let set: Option<String> = redis::cmd("SET")
                    .arg(&key)
                    .arg(pod_id)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs())
                    .query_async(&mut conn)
                    .await?;
                if set.is_some() {
                    return Ok(ClaimOutcome::Claimed);
                }
                let owner: Option<String> =
                    redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
                // The key can expire between SET and GET; report what we saw.
                Ok(ClaimOutcome::OwnedBy(
                    owner.unwrap_or_else(|| "unknown".to_string()),
                ))
            }
            CoordinationStore::Memory(map) => {
                let mut entries = map.entries.lock().await;
                let now = Instant::now();
                match entries.get(&key) {
                    Some((owner, expires_at)) if *expires_at > now => {
                        Ok(ClaimOutcome::OwnedBy(owner.clone()))
                    }
                    _ => {
                        entries.insert(key, (pod_id.to_string(), now + ttl));
                        Ok(ClaimOutcome::Claimed)
                    }
                }
            }
        }
    }

    /// Delete the ownership key only if it still points at `pod_id`. Returns
    /// whether the key was removed.
    pub async fn release(&self, tunnel_id: &str, pod_id: &str) -> Result<bool, StoreError> {
        let key = tunnel_key(tunnel_id);
        match self {
            CoordinationStore::Redis(manager) => {
                let mut conn = manager.clone();
                let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
                    .key(&key)
                    .arg(pod_id)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(removed == 1)
            }
            CoordinationStore::Memory(map) => {
                let mut entries = map.entries.lock().await;
                let now = Instant::now();
                match entries.get(&key) {
                    Some((owner, expires_at)) if *expires_at > now && owner == pod_id => {
                        entries.remove(&key);
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
        }
    }

    /// Extend the TTL while `pod_id` owns the key (re-claiming it if it
    /// expired). Returns `false` when another pod owns the tunnel now.
    pub async fn refresh(
        &self,
        tunnel_id: &str,
        pod_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = tunnel_key(tunnel_id);
        match self {
            CoordinationStore::Redis(manager) => {
                let mut conn = manager.clone();
                let refreshed: i64 = redis::Script::new(REFRESH_SCRIPT)
                    .key(&key)
                    .arg(pod_id)
                    .arg(ttl.as_secs())
                    .invoke_async(&mut conn)
                    .await?;
                Ok(refreshed == 1)
            }
            CoordinationStore::Memory(map) => {
                let mut entries = map.entries.lock().await;
                let now = Instant::now();
                match entries.get(&key) {
                    Some((owner, expires_at)) if *expires_at > now && owner != pod_id => Ok(false),
                    _ => {
                        entries.insert(key, (pod_id.to_string(), now + ttl));
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Which pod owns the tunnel, if any.
    pub async fn owner(&self, tunnel_id: &str) -> Result<Option<String>, StoreError> {
        let key = tunnel_key(tunnel_id);
        match self {
            CoordinationStore::Redis(manager) => {
                let mut conn = manager.clone();
                let owner: Option<String> =
                    redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
                Ok(owner)
            }
            CoordinationStore::Memory(map) => {
                let entries = map.entries.lock().await;
                let now = Instant::now();
                Ok(entries
                    .get(&key)
                    .filter(|(_, expires_at)| *expires_at > now)
                    .map(|(owner, _)| owner.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = CoordinationStore::in_memory();
        assert_eq!(
            store.try_claim("t1", "pod-a", TTL).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.try_claim("t1", "pod-b", TTL).await.unwrap(),
            ClaimOutcome::OwnedBy("pod-a".to_string())
        );
    }

    #[tokio::test]
    async fn test_release_requires_ownership() {
        let store = CoordinationStore::in_memory();
        store.try_claim("t1", "pod-a", TTL).await.unwrap();

        // A different pod must not be able to delete the key
        assert!(!store.release("t1", "pod-b").await.unwrap());
        assert_eq!(store.owner("t1").await.unwrap().as_deref(), Some("pod-a"));

        assert!(store.release("t1", "pod-a").await.unwrap());
        assert!(store.owner("t1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_expires() {
        let store = CoordinationStore::in_memory();
        store.try_claim("t1", "pod-a", TTL).await.unwrap();

        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert!(store.owner("t1").await.unwrap().is_none());
        assert_eq!(
            store.try_claim("t1", "pod-b", TTL).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_and_guards() {
        let store = CoordinationStore::in_memory();
        store.try_claim("t1", "pod-a", TTL).await.unwrap();

        tokio::time::advance(TTL - Duration::from_secs(10)).await;
        assert!(store.refresh("t1", "pod-a", TTL).await.unwrap());

        // Well past the original expiry, the refreshed key still lives
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(store.owner("t1").await.unwrap().as_deref(), Some("pod-a"));

        // Another pod cannot refresh a live key it doesn't own
        assert!(!store.refresh("t1", "pod-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = CoordinationStore::in_memory();
        let peer = store.clone();
        store.try_claim("t1", "pod-a", TTL).await.unwrap();
        assert_eq!(peer.owner("t1").await.unwrap().as_deref(), Some("pod-a"));
    }
}
