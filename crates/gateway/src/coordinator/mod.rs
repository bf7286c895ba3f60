// Shared coordinator for admission state.
//
// Rate-limit counters and idempotency keys must be visible to every gateway
// instance, so they are never kept in process globals. Two backends exist:
// PostgreSQL for deployments and an in-memory map for single-node
// development and tests. Both expose the same two atomic primitives:
// set-if-absent-with-TTL and increment-with-expiry.

mod memory;
mod postgres;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::db::pool::{connect_coordinator_pool, PoolConfig};

pub use memory::MemoryCoordinator;

/// A token budget: at most `limit` tokens per `window`, refilled in full when
/// the window that started with the first withdrawal elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    pub limit: u32,
    pub window: Duration,
}

impl BucketSpec {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenDecision {
    Granted { remaining: u32 },
    Exhausted { retry_after: Duration },
}

impl TokenDecision {
    fn from_count(count: u64, bucket: BucketSpec, ttl: Duration) -> Self {
        if count <= u64::from(bucket.limit) {
            let remaining = u64::from(bucket.limit) - count;
            Self::Granted { remaining: remaining as u32 }
        } else {
            Self::Exhausted { retry_after: ttl.max(Duration::from_millis(1)) }
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

#[derive(Clone)]
pub enum Coordinator {
    Postgres(PgPool),
    Memory(Arc<MemoryCoordinator>),
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres(_) => f.write_str("Coordinator::Postgres"),
            Self::Memory(_) => f.write_str("Coordinator::Memory"),
        }
    }
}

impl Coordinator {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(MemoryCoordinator::default()))
    }

    pub async fn connect(database_url: Option<&str>) -> Result<Self> {
        match database_url {
            Some(url) => {
                let pool = connect_coordinator_pool(url, PoolConfig::from_env()).await?;
                Ok(Self::Postgres(pool))
            }
            None => {
                warn!("no coordinator database configured; admission state is local to this process");
                Ok(Self::in_memory())
            }
        }
    }

    /// Claim `key` for `ttl`. Returns `false` when an unexpired claim exists.
    pub async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        match self {
            Self::Postgres(pool) => postgres::set_if_absent(pool, key, ttl).await,
            Self::Memory(store) => Ok(store.set_if_absent(key, ttl).await),
        }
    }

    /// Drop a claim taken with [`Coordinator::set_if_absent`].
    pub async fn release(&self, key: &str) -> Result<()> {
        match self {
            Self::Postgres(pool) => postgres::release(pool, key).await,
            Self::Memory(store) => {
                store.release(key).await;
                Ok(())
            }
        }
    }

    /// Withdraw one token from the bucket stored at `key`.
    pub async fn take_token(&self, key: &str, bucket: BucketSpec) -> Result<TokenDecision> {
        let (count, ttl) = match self {
            Self::Postgres(pool) => postgres::increment_with_expiry(pool, key, bucket.window).await?,
            Self::Memory(store) => store.increment_with_expiry(key, bucket.window).await,
        };
        Ok(TokenDecision::from_count(count, bucket, ttl))
    }

    /// Purge expired keys and counters. Returns the number of records removed.
    pub async fn evict_expired(&self) -> Result<u64> {
        match self {
            Self::Postgres(pool) => postgres::evict_expired(pool).await,
            Self::Memory(store) => Ok(store.evict_expired().await),
        }
    }
}

/// Periodically purge expired coordinator records until the task is aborted.
pub fn spawn_sweeper(coordinator: Coordinator, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.reset();
        loop {
            ticker.tick().await;
            match coordinator.evict_expired().await {
                Ok(0) => {}
                Ok(evicted) => debug!(evicted, "swept expired coordinator records"),
                Err(error) => warn!(error = ?error, "coordinator sweep failed"),
            }
        }
    })
}

pub fn connection_bucket_key(ip: std::net::IpAddr) -> String {
    format!("rate:conn:{ip}")
}

pub fn message_bucket_key(user_id: &str) -> String {
    format!("rate:msg:{user_id}")
}

/// Length-prefixed so that user ids containing `:` cannot collide.
pub fn idempotency_key(user_id: &str, request_id: &str) -> String {
    format!("idem:{}:{user_id}:{request_id}", user_id.len())
}
