//! Persistence contracts.
//!
//! These traits are the only way the engine touches durable storage. Every
//! implementation must uphold two rules: a context in `ARCHIVED`/`ERROR`
//! never changes again, and a trace in an exclusive status
//! ([`FlowTraceStatus::EXCLUSIVE`]) rejects further writes.

mod memory;

pub use memory::{InMemoryContextRepo, InMemoryDefinitionRepo, InMemoryTraceRepo};

use crate::{
    DefinitionStatus, FlowContext, FlowDefinition, FlowNodeStatus, FlowTrace, FlowTraceStatus,
    PersistenceError, RetryRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub type RepoResult<T> = std::result::Result<T, PersistenceError>;

#[async_trait]
pub trait FlowContextRepo: Send + Sync {
    /// Insert or replace a single context. Ignored if the stored status
    /// cannot move to the new one.
    async fn save(&self, context: &FlowContext) -> RepoResult<()>;

    async fn batch_create(&self, contexts: &[FlowContext]) -> RepoResult<()>;

    /// Replace stored contexts; returns how many rows were written. A row
    /// whose status would move backwards or out of a final status is skipped.
    async fn batch_update(&self, contexts: &[FlowContext]) -> RepoResult<usize>;

    /// Returns how many rows actually changed. Follows the same transition
    /// rules as [`FlowNodeStatus::can_transition_to`].
    async fn update_status(&self, ids: &[String], status: FlowNodeStatus) -> RepoResult<usize>;

    async fn get_by_ids(&self, ids: &[String]) -> RepoResult<Vec<FlowContext>>;

    /// Every non-final context (`NEW`, `PENDING`, `READY`, `RETRYABLE`) of a trace.
    async fn get_running_contexts_by_trace_id(&self, trace_id: &str) -> RepoResult<Vec<FlowContext>>;

    async fn find_by_trace_id(&self, trace_id: &str) -> RepoResult<Vec<FlowContext>>;

    /// Persist retry entries for `contexts`, one per `(node, to_batch)`.
    async fn save_retry_schedule(
        &self,
        contexts: &[FlowContext],
        next_retry_time: DateTime<Utc>,
    ) -> RepoResult<()>;

    async fn find_due_retries(&self, now: DateTime<Utc>, limit: usize) -> RepoResult<Vec<RetryRecord>>;

    async fn find_retries_by_trace_id(&self, trace_id: &str) -> RepoResult<Vec<RetryRecord>>;

    async fn delete_retry(&self, record: &RetryRecord) -> RepoResult<()>;

    async fn delete_by_ids(&self, ids: &[String]) -> RepoResult<usize>;
}

#[async_trait]
pub trait FlowTraceRepo: Send + Sync {
    async fn save(&self, trace: &FlowTrace) -> RepoResult<()>;

    async fn find(&self, trace_id: &str) -> RepoResult<Option<FlowTrace>>;

    async fn batch_create(&self, traces: &[FlowTrace]) -> RepoResult<()>;

    /// Replace stored traces, skipping any already in an exclusive status.
    async fn batch_update(&self, traces: &[FlowTrace]) -> RepoResult<usize>;

    /// Returns how many traces changed; traces in an exclusive status are left alone.
    async fn update_status(&self, ids: &[String], status: FlowTraceStatus) -> RepoResult<usize>;

    /// Set-union `context_ids` into the context pool of every trace in `trace_ids`.
    async fn update_context_pool(&self, trace_ids: &[String], context_ids: &[String]) -> RepoResult<()>;

    /// Ids of traces still running, restricted to `applications` unless empty.
    async fn find_running_trace(&self, applications: &[String]) -> RepoResult<Vec<String>>;

    /// Finished traces whose end time is older than `expired_days`.
    async fn get_expired_trace(&self, expired_days: u32, limit: usize) -> RepoResult<Vec<FlowTrace>>;

    async fn delete_by_id_list(&self, ids: &[String]) -> RepoResult<usize>;
}

#[async_trait]
pub trait FlowDefinitionRepo: Send + Sync {
    async fn save(&self, definition: FlowDefinition) -> RepoResult<()>;

    async fn find(&self, stream_id: &str) -> RepoResult<Option<Arc<FlowDefinition>>>;

    async fn update_status(&self, stream_id: &str, status: DefinitionStatus) -> RepoResult<()>;

    async fn list(&self) -> RepoResult<Vec<Arc<FlowDefinition>>>;
}
