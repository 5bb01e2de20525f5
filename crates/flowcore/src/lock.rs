//! Keyed mutual exclusion.
//!
//! [`FlowLocks`] is the only synchronization primitive the engine needs.
//! Guards release on drop, so every exit path gives the key back.

use crate::LockError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

#[async_trait]
pub trait FlowLocks: Send + Sync {
    async fn acquire(&self, key: &str) -> Result<FlowLockGuard, LockError>;
}

/// Held lock; released when dropped.
pub struct FlowLockGuard {
    key: String,
    inner: GuardInner,
}

enum GuardInner {
    Local(#[allow(dead_code)] OwnedMutexGuard<()>),
    Distributed {
        provider: Arc<dyn DistributedLockProvider>,
        owner: String,
    },
}

impl FlowLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlowLockGuard {
    fn drop(&mut self) {
        if let GuardInner::Distributed { provider, owner } = &self.inner {
            let provider = provider.clone();
            let owner = owner.clone();
            let key = std::mem::take(&mut self.key);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = provider.unlock(&key, &owner).await {
                            tracing::warn!("Failed to release lock {}: {}", key, e);
                        }
                    });
                }
                Err(_) => tracing::warn!("Lock {} dropped outside a runtime; it will expire", key),
            }
        }
    }
}

/// Process-local locks keyed by string.
#[derive(Default)]
pub struct LocalFlowLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalFlowLocks {
    const PRUNE_THRESHOLD: usize = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    /// Drop keys nobody holds or waits on.
    fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[async_trait]
impl FlowLocks for LocalFlowLocks {
    async fn acquire(&self, key: &str) -> Result<FlowLockGuard, LockError> {
        if self.locks.len() > Self::PRUNE_THRESHOLD {
            self.prune();
        }
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        Ok(FlowLockGuard {
            key: key.to_string(),
            inner: GuardInner::Local(guard),
        })
    }
}

/// Cluster-wide lease-based lock, e.g. backed by Redis or a database row.
#[async_trait]
pub trait DistributedLockProvider: Send + Sync {
    /// Take or extend the lease on `key`. Re-entrant for the same owner.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release `key` if `owner` holds it.
    async fn unlock(&self, key: &str, owner: &str) -> Result<bool, LockError>;

    /// Current unexpired holder of `key`.
    async fn owner_of(&self, key: &str) -> Result<Option<String>, LockError>;
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Lock provider shared in-process; stands in for the cluster backend.
#[derive(Default)]
pub struct InMemoryLockProvider {
    leases: DashMap<String, Lease>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLockProvider for InMemoryLockProvider {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entry = self.leases.entry(key.to_string()).or_insert_with(|| Lease {
            owner: owner.to_string(),
            expires_at: now,
        });
        if entry.owner == owner || entry.expires_at <= now {
            *entry = Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            };
            return Ok(true);
        }
        Ok(false)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.owner == owner)
            .is_some())
    }

    async fn owner_of(&self, key: &str) -> Result<Option<String>, LockError> {
        let now = Instant::now();
        Ok(self
            .leases
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.owner.clone()))
    }
}

/// [`FlowLocks`] on top of a [`DistributedLockProvider`], polling until the
/// lease is granted or `timeout` elapses.
pub struct DistributedFlowLocks {
    provider: Arc<dyn DistributedLockProvider>,
    owner: String,
    ttl: Duration,
    poll_interval: Duration,
    timeout: Duration,
}

impl DistributedFlowLocks {
    pub fn new(provider: Arc<dyn DistributedLockProvider>, owner: impl Into<String>) -> Self {
        Self {
            provider,
            owner: owner.into(),
            ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FlowLocks for DistributedFlowLocks {
    async fn acquire(&self, key: &str) -> Result<FlowLockGuard, LockError> {
        let deadline = Instant::now() + self.timeout;
        // Leases are re-entrant per owner, so each acquisition gets its own token.
        let token = format!("{}:{}", self.owner, uuid::Uuid::new_v4());
        loop {
            if self.provider.try_lock(key, &token, self.ttl).await? {
                return Ok(FlowLockGuard {
                    key: key.to_string(),
                    inner: GuardInner::Distributed {
                        provider: self.provider.clone(),
                        owner: token,
                    },
                });
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout(key.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
