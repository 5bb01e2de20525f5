use crate::config::RuntimeConfig;
use crate::owner::TraceOwnerService;
use chrono::Utc;
use flowcore::{
    ConditionEvaluator, EventBus, ExecutionEvent, FlowContextRepo, FlowLocks, FlowTraceRepo,
    FlowTraceStatus, Result,
};
use std::sync::Arc;

/// Collaborators shared by every stage of every pipeline of one runtime.
pub(crate) struct Services {
    pub contexts: Arc<dyn FlowContextRepo>,
    pub traces: Arc<dyn FlowTraceRepo>,
    pub locks: Arc<dyn FlowLocks>,
    pub owner: Arc<TraceOwnerService>,
    pub events: Arc<EventBus>,
    pub evaluator: Option<Arc<dyn ConditionEvaluator>>,
    pub config: RuntimeConfig,
}

impl Services {
    /// `None` when the trace is gone.
    pub async fn trace_status(&self, trace_id: &str) -> Result<Option<FlowTraceStatus>> {
        Ok(self.traces.find(trace_id).await?.map(|t| t.status))
    }

    /// Record a fatal failure on the trace. A trace already in an exclusive
    /// status keeps it.
    pub async fn fail_trace(&self, trace_id: &str, message: &str) -> Result<()> {
        let Some(mut trace) = self.traces.find(trace_id).await? else {
            return Ok(());
        };
        if trace.status.is_exclusive() {
            return Ok(());
        }
        trace.status = FlowTraceStatus::Error;
        trace.error = Some(message.to_string());
        trace.end_time = Some(Utc::now());
        if self.traces.batch_update(&[trace]).await? > 0 {
            tracing::error!("Trace {} failed: {}", trace_id, message);
        }
        Ok(())
    }

    /// Close the trace once nothing is left running in it.
    ///
    /// A trace that already reached an exclusive status is closed
    /// immediately; the completion event is published by the worker that
    /// held ownership.
    pub async fn finish_if_idle(&self, trace_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(&format!("trace-{}", trace_id)).await?;

        let Some(trace) = self.traces.find(trace_id).await? else {
            return Ok(());
        };

        let status = if trace.status.is_exclusive() {
            trace.status
        } else {
            let running = self.contexts.get_running_contexts_by_trace_id(trace_id).await?;
            if !running.is_empty() {
                tracing::trace!("Trace {} still has {} running contexts", trace_id, running.len());
                return Ok(());
            }
            self.traces
                .update_status(&[trace_id.to_string()], FlowTraceStatus::Archived)
                .await?;
            FlowTraceStatus::Archived
        };

        if self.owner.release(trace_id).await? {
            tracing::info!("Trace {} completed with status {}", trace_id, status);
            self.events.emit(ExecutionEvent::TraceCompleted {
                trace_id: trace_id.to_string(),
                status,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }
}
