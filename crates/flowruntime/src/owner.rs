//! Cluster-wide trace ownership.
//!
//! A trace is driven by exactly one worker at a time. Ownership is a lease
//! in the [`DistributedLockProvider`]; this worker remembers which traces it
//! holds so `is_own` stays a local lookup.

use dashmap::DashSet;
use flowcore::{DistributedLockProvider, LockError};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

pub struct TraceOwnerService {
    provider: Arc<dyn DistributedLockProvider>,
    worker_id: String,
    ttl: Duration,
    owned: DashSet<String>,
}

impl TraceOwnerService {
    pub fn new(provider: Arc<dyn DistributedLockProvider>, worker_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            provider,
            worker_id: worker_id.into(),
            ttl,
            owned: DashSet::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn lease_key(trace_id: &str) -> String {
        format!("flow-trace-owner:{}", trace_id)
    }

    /// Whether this worker currently holds the trace.
    pub fn is_own(&self, trace_id: &str) -> bool {
        self.owned.contains(trace_id)
    }

    /// Claim `trace_id` for `lease_owner`. Re-claiming a held lease extends
    /// it. Only claims made for this worker are tracked locally.
    pub async fn try_own(&self, trace_id: &str, lease_owner: &str) -> Result<bool, LockError> {
        let acquired = self
            .provider
            .try_lock(&Self::lease_key(trace_id), lease_owner, self.ttl)
            .await?;
        if acquired && lease_owner == self.worker_id {
            self.owned.insert(trace_id.to_string());
            tracing::debug!("Worker {} owns trace {}", self.worker_id, trace_id);
        }
        Ok(acquired)
    }

    /// Claim `trace_id` for this worker.
    pub async fn own(&self, trace_id: &str) -> Result<bool, LockError> {
        self.try_own(trace_id, &self.worker_id).await
    }

    /// Give up the trace. Returns whether this worker held it.
    pub async fn release(&self, trace_id: &str) -> Result<bool, LockError> {
        let held = self.owned.remove(trace_id).is_some();
        self.provider
            .unlock(&Self::lease_key(trace_id), &self.worker_id)
            .await?;
        if held {
            tracing::debug!("Worker {} released trace {}", self.worker_id, trace_id);
        }
        Ok(held)
    }

    /// Extend every held lease. Traces whose lease could not be renewed are
    /// dropped locally; returns their ids.
    pub async fn renew_owned(&self) -> Vec<String> {
        let owned = self.owned_traces();
        let renewals = join_all(owned.iter().map(|trace_id| async move {
            let key = Self::lease_key(trace_id);
            self.provider.try_lock(&key, &self.worker_id, self.ttl).await
        }))
        .await;

        let mut lost = Vec::new();
        for (trace_id, renewed) in owned.into_iter().zip(renewals) {
            match renewed {
                Ok(true) => continue,
                Ok(false) => {
                    tracing::warn!("Worker {} lost ownership of trace {}", self.worker_id, trace_id);
                }
                Err(e) => {
                    tracing::warn!("Failed to renew ownership of trace {}: {}", trace_id, e);
                }
            }
            self.owned.remove(&trace_id);
            lost.push(trace_id);
        }
        lost
    }

    pub fn owned_traces(&self) -> Vec<String> {
        self.owned.iter().map(|id| id.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::InMemoryLockProvider;

    fn services(ttl: Duration) -> (TraceOwnerService, TraceOwnerService) {
        let provider: Arc<dyn DistributedLockProvider> = Arc::new(InMemoryLockProvider::new());
        (
            TraceOwnerService::new(provider.clone(), "worker-a", ttl),
            TraceOwnerService::new(provider, "worker-b", ttl),
        )
    }

    #[tokio::test]
    async fn test_single_owner_until_release() {
        let (a, b) = services(Duration::from_secs(30));

        assert!(a.own("t1").await.unwrap());
        assert!(a.is_own("t1"));
        assert!(!b.own("t1").await.unwrap());
        assert!(!b.is_own("t1"));

        assert!(a.release("t1").await.unwrap());
        assert!(b.own("t1").await.unwrap());
        assert!(b.is_own("t1"));
    }

    #[tokio::test]
    async fn test_renew_drops_lost_leases() {
        tokio::time::pause();
        let (a, b) = services(Duration::from_millis(100));

        assert!(a.own("t1").await.unwrap());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(b.own("t1").await.unwrap());

        let lost = a.renew_owned().await;
        assert_eq!(lost, vec!["t1".to_string()]);
        assert!(!a.is_own("t1"));
        assert!(b.is_own("t1"));
    }

    #[tokio::test]
    async fn test_renew_keeps_leases_still_held() {
        tokio::time::pause();
        let (a, b) = services(Duration::from_millis(100));

        for trace in ["t1", "t2", "t3"] {
            assert!(a.own(trace).await.unwrap());
        }
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(b.own("t2").await.unwrap());

        let lost = a.renew_owned().await;
        assert_eq!(lost, vec!["t2".to_string()]);
        let mut kept = a.owned_traces();
        kept.sort();
        assert_eq!(kept, vec!["t1".to_string(), "t3".to_string()]);

        // renewed leases outlive the original expiry
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!b.own("t1").await.unwrap());
        assert!(!b.own("t3").await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_for_other_owner_not_tracked() {
        let (a, b) = services(Duration::from_secs(30));
        assert!(a.try_own("t1", "worker-b").await.unwrap());
        assert!(!a.is_own("t1"));
        assert!(!b.is_own("t1"));
        assert!(b.own("t1").await.unwrap());
    }
}
