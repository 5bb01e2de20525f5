use crate::runtime::FlowRuntime;
use crate::schedule::spawn_fixed_rate;
use flowcore::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub traces: usize,
    pub contexts: usize,
}

/// Deletes traces that ended more than `expired_days` ago, with their contexts.
/// Only traces in an exclusive status are ever considered.
pub struct ExpiredTraceCleaner {
    runtime: Arc<FlowRuntime>,
}

impl ExpiredTraceCleaner {
    pub fn new(runtime: Arc<FlowRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn run_once(&self) -> Result<CleanupReport> {
        let config = self.runtime.config();
        let expired = self
            .runtime
            .trace_repo()
            .get_expired_trace(config.expired_days, config.cleanup_batch_limit)
            .await?;
        if expired.is_empty() {
            return Ok(CleanupReport::default());
        }

        let mut report = CleanupReport::default();
        let mut trace_ids = Vec::with_capacity(expired.len());
        for trace in expired {
            let pool: Vec<String> = trace.context_pool.into_iter().collect();
            report.contexts += self.runtime.context_repo().delete_by_ids(&pool).await?;
            trace_ids.push(trace.id);
        }
        report.traces = self.runtime.trace_repo().delete_by_id_list(&trace_ids).await?;

        tracing::info!(
            "Removed {} expired traces and {} contexts",
            report.traces,
            report.contexts
        );
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.runtime.config().cleanup_interval;
        spawn_fixed_rate("Expired trace cleaner", period, cancel, move || {
            let cleaner = self.clone();
            async move {
                if let Err(e) = cleaner.run_once().await {
                    tracing::error!("Expired trace cleanup failed: {}", e);
                }
            }
        })
    }
}
