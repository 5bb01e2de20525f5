//! Crash recovery.
//!
//! Periodically scans running traces that no live worker drives and
//! replays their persisted contexts into this worker's pipelines. The
//! scan is safe to repeat: owned traces are skipped and every replay path
//! re-checks persisted status before acting.

use crate::runtime::FlowRuntime;
use crate::schedule::spawn_fixed_rate;
use chrono::Utc;
use flowcore::{ExecutionEvent, FlowContext, FlowError, FlowNodeStatus, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one recovery sweep
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Running traces seen
    pub scanned: usize,
    /// Already driven by this worker
    pub skipped_owned: usize,
    /// Owned by another live worker
    pub skipped_contended: usize,
    pub recovered: usize,
    /// `NEW`/`PENDING` contexts re-offered to their node
    pub offered: usize,
    /// `READY` contexts turned into retries
    pub retried: usize,
    pub failed: Vec<(String, String)>,
}

enum TraceOutcome {
    Owned,
    Contended,
    Missing,
    Recovered { offered: usize, retried: usize },
}

pub struct RestartContextSchedule {
    runtime: Arc<FlowRuntime>,
}

impl RestartContextSchedule {
    pub fn new(runtime: Arc<FlowRuntime>) -> Self {
        Self { runtime }
    }

    /// Renew held leases, then sweep every running trace once.
    pub async fn run_once(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let owner = self.runtime.owner();

        let lost = owner.renew_owned().await;
        if !lost.is_empty() {
            tracing::warn!("Lost ownership of {} traces", lost.len());
        }

        let applications = &self.runtime.config().applications;
        let trace_ids = match self.runtime.trace_repo().find_running_trace(applications).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!("Recovery could not list running traces: {}", e);
                return report;
            }
        };
        report.scanned = trace_ids.len();

        for trace_id in trace_ids {
            match self.recover_trace(&trace_id).await {
                Ok(TraceOutcome::Owned) => report.skipped_owned += 1,
                Ok(TraceOutcome::Contended) => report.skipped_contended += 1,
                Ok(TraceOutcome::Missing) => {}
                Ok(TraceOutcome::Recovered { offered, retried }) => {
                    report.recovered += 1;
                    report.offered += offered;
                    report.retried += retried;
                }
                Err(e) => {
                    tracing::error!("Recovery of trace {} failed: {}", trace_id, e);
                    report.failed.push((trace_id, e.to_string()));
                }
            }
        }

        if report.recovered > 0 || !report.failed.is_empty() {
            tracing::info!(
                "Recovery sweep: {} scanned, {} recovered, {} offered, {} retried, {} failed",
                report.scanned,
                report.recovered,
                report.offered,
                report.retried,
                report.failed.len()
            );
        }
        report
    }

    async fn recover_trace(&self, trace_id: &str) -> Result<TraceOutcome> {
        let owner = self.runtime.owner();
        if owner.is_own(trace_id) {
            return Ok(TraceOutcome::Owned);
        }
        if !owner.own(trace_id).await? {
            tracing::debug!("Trace {} is owned by another worker", trace_id);
            return Ok(TraceOutcome::Contended);
        }

        let outcome = self.replay(trace_id).await;
        match &outcome {
            Ok(TraceOutcome::Missing) | Err(_) => {
                if let Err(e) = owner.release(trace_id).await {
                    tracing::warn!("Could not release trace {}: {}", trace_id, e);
                }
            }
            _ => {}
        }
        outcome
    }

    async fn replay(&self, trace_id: &str) -> Result<TraceOutcome> {
        let Some(trace) = self.runtime.trace_repo().find(trace_id).await? else {
            tracing::debug!("Trace {} vanished before recovery", trace_id);
            return Ok(TraceOutcome::Missing);
        };

        let definition = self
            .runtime
            .definition_repo()
            .find(&trace.stream_id)
            .await?
            .ok_or_else(|| FlowError::DefinitionNotFound(trace.stream_id.clone()))?;
        if !definition.is_active() {
            return Err(FlowError::DefinitionInactive(trace.stream_id.clone()));
        }
        let pipeline = self.runtime.pipeline(&trace.stream_id).await?;

        let running = self
            .runtime
            .context_repo()
            .get_running_contexts_by_trace_id(trace_id)
            .await?;
        let mut groups: BTreeMap<(String, FlowNodeStatus), Vec<FlowContext>> = BTreeMap::new();
        for context in running {
            groups
                .entry((context.position.clone(), context.status))
                .or_default()
                .push(context);
        }

        let mut offered = 0;
        let mut retried = 0;
        for ((position, status), contexts) in groups {
            match status {
                FlowNodeStatus::New | FlowNodeStatus::Pending
                    if position == definition.start_node || definition.event(&position).is_some() =>
                {
                    tracing::debug!(
                        "Trace {}: re-offering {} {} contexts at {}",
                        trace_id,
                        contexts.len(),
                        status,
                        position
                    );
                    offered += pipeline.offer(&position, contexts).await?;
                }
                FlowNodeStatus::Ready => {
                    // outcome of the interrupted attempt is unknown, so it runs again
                    retried += self.schedule_retry(trace_id, contexts).await?;
                }
                FlowNodeStatus::Retryable => {
                    self.ensure_retry_record(trace_id, contexts).await?;
                }
                _ => {
                    tracing::warn!(
                        "Trace {}: unexpected {} contexts at {}",
                        trace_id,
                        status,
                        position
                    );
                }
            }
        }

        tracing::info!(
            "Recovered trace {}: {} offered, {} scheduled for retry",
            trace_id,
            offered,
            retried
        );
        self.runtime.event_bus().emit(ExecutionEvent::TraceRecovered {
            trace_id: trace_id.to_string(),
            offered,
            retried,
            timestamp: Utc::now(),
        });
        Ok(TraceOutcome::Recovered { offered, retried })
    }

    async fn schedule_retry(&self, trace_id: &str, mut contexts: Vec<FlowContext>) -> Result<usize> {
        let repo = self.runtime.context_repo();
        for context in &mut contexts {
            context.set_status(FlowNodeStatus::Retryable);
        }
        repo.batch_update(&contexts).await?;
        repo.save_retry_schedule(&contexts, Utc::now()).await?;
        tracing::debug!(
            "Trace {}: {} interrupted contexts at {} scheduled for retry",
            trace_id,
            contexts.len(),
            contexts[0].position
        );
        Ok(contexts.len())
    }

    /// `RETRYABLE` contexts belong to the retry dispatcher; only restore
    /// their schedule if it never got written.
    async fn ensure_retry_record(&self, trace_id: &str, contexts: Vec<FlowContext>) -> Result<()> {
        let repo = self.runtime.context_repo();
        let scheduled: HashSet<String> = repo
            .find_retries_by_trace_id(trace_id)
            .await?
            .into_iter()
            .flat_map(|r| r.context_ids)
            .collect();
        let orphans: Vec<FlowContext> = contexts
            .into_iter()
            .filter(|c| !scheduled.contains(&c.id))
            .collect();
        if orphans.is_empty() {
            tracing::debug!("Trace {}: retryable contexts await the dispatcher", trace_id);
            return Ok(());
        }
        tracing::warn!(
            "Trace {}: {} retryable contexts had no schedule",
            trace_id,
            orphans.len()
        );
        repo.save_retry_schedule(&orphans, Utc::now()).await?;
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.runtime.config().recovery_interval;
        spawn_fixed_rate("Restart context schedule", period, cancel, move || {
            let schedule = self.clone();
            async move {
                schedule.run_once().await;
            }
        })
    }
}
