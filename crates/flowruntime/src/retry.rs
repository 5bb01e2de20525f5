use crate::runtime::FlowRuntime;
use crate::schedule::spawn_fixed_rate;
use chrono::Utc;
use flowcore::{FlowContext, FlowError, FlowNodeStatus, Result, RetryRecord};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one dispatch pass
#[derive(Debug, Default, Clone)]
pub struct RetryReport {
    pub due: usize,
    /// Contexts handed back to their node
    pub dispatched: usize,
    /// Records left for another worker
    pub skipped: usize,
    /// Records dropped because their trace closed or contexts moved on
    pub discarded: usize,
    pub failed: usize,
}

enum Dispatch {
    Sent(usize),
    Skipped,
    Discarded,
}

/// Re-invokes nodes for contexts whose retry time has come.
pub struct RetryDispatcher {
    runtime: Arc<FlowRuntime>,
}

impl RetryDispatcher {
    pub fn new(runtime: Arc<FlowRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn run_once(&self) -> RetryReport {
        let mut report = RetryReport::default();
        let limit = self.runtime.config().retry_batch_limit;
        let records = match self.runtime.context_repo().find_due_retries(Utc::now(), limit).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Retry dispatcher could not load due retries: {}", e);
                return report;
            }
        };
        report.due = records.len();

        for record in records {
            match self.dispatch(&record).await {
                Ok(Dispatch::Sent(n)) => report.dispatched += n,
                Ok(Dispatch::Skipped) => report.skipped += 1,
                Ok(Dispatch::Discarded) => report.discarded += 1,
                Err(e) => {
                    tracing::error!(
                        "Retry of batch {} at {} (trace {}) failed: {}",
                        record.to_batch,
                        record.node_id,
                        record.trace_id,
                        e
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn dispatch(&self, record: &RetryRecord) -> Result<Dispatch> {
        let owner = self.runtime.owner();
        if !owner.is_own(&record.trace_id) && !owner.own(&record.trace_id).await? {
            return Ok(Dispatch::Skipped);
        }

        let repo = self.runtime.context_repo();
        let trace = self.runtime.trace_repo().find(&record.trace_id).await?;
        let Some(trace) = trace.filter(|t| !t.status.is_exclusive()) else {
            tracing::debug!("Dropping retry of closed trace {}", record.trace_id);
            repo.delete_retry(record).await?;
            owner.release(&record.trace_id).await?;
            return Ok(Dispatch::Discarded);
        };

        let pipeline = self.runtime.pipeline(&trace.stream_id).await?;
        let node = pipeline
            .node(&record.node_id)
            .ok_or_else(|| FlowError::NodeNotFound(record.node_id.clone()))?;

        let mut contexts: Vec<FlowContext> = repo
            .get_by_ids(&record.context_ids)
            .await?
            .into_iter()
            .filter(|c| c.status == FlowNodeStatus::Retryable)
            .collect();
        if contexts.is_empty() {
            repo.delete_retry(record).await?;
            return Ok(Dispatch::Discarded);
        }

        for context in &mut contexts {
            context.set_status(FlowNodeStatus::Ready);
        }
        repo.batch_update(&contexts).await?;
        repo.delete_retry(record).await?;

        let count = contexts.len();
        tracing::info!(
            "Retrying {} contexts of trace {} at node {} (attempt {})",
            count,
            record.trace_id,
            record.node_id,
            record.retry_count
        );
        node.retry(contexts)?;
        Ok(Dispatch::Sent(count))
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.runtime.config().retry_interval;
        spawn_fixed_rate("Retry dispatcher", period, cancel, move || {
            let dispatcher = self.clone();
            async move {
                dispatcher.run_once().await;
            }
        })
    }
}
