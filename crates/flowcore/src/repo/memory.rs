//! In-memory repositories. Used by the CLI and as fakes in tests; a shared
//! `Arc` of each stands in for the database when several workers run in
//! one process.

use super::{FlowContextRepo, FlowDefinitionRepo, FlowTraceRepo, RepoResult};
use crate::{
    DefinitionStatus, FlowContext, FlowDefinition, FlowNodeStatus, FlowTrace, FlowTraceStatus,
    PersistenceError, RetryRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct InMemoryContextRepo {
    contexts: DashMap<String, FlowContext>,
    retries: DashMap<String, RetryRecord>,
}

impl InMemoryContextRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    fn retry_key(node_id: &str, to_batch: &str) -> String {
        format!("{}/{}", node_id, to_batch)
    }
}

#[async_trait]
impl FlowContextRepo for InMemoryContextRepo {
    async fn save(&self, context: &FlowContext) -> RepoResult<()> {
        match self.contexts.get_mut(&context.id) {
            Some(mut stored) => {
                if stored.status.can_transition_to(context.status) {
                    *stored = context.clone();
                }
            }
            None => {
                self.contexts.insert(context.id.clone(), context.clone());
            }
        }
        Ok(())
    }

    async fn batch_create(&self, contexts: &[FlowContext]) -> RepoResult<()> {
        if let Some(dup) = contexts.iter().find(|c| self.contexts.contains_key(&c.id)) {
            return Err(PersistenceError::Conflict(format!("context {} already exists", dup.id)));
        }
        for context in contexts {
            self.contexts.insert(context.id.clone(), context.clone());
        }
        Ok(())
    }

    async fn batch_update(&self, contexts: &[FlowContext]) -> RepoResult<usize> {
        let mut written = 0;
        for context in contexts {
            if let Some(mut stored) = self.contexts.get_mut(&context.id) {
                if stored.status.can_transition_to(context.status) {
                    *stored = context.clone();
                    stored.updated_at = Utc::now();
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn update_status(&self, ids: &[String], status: FlowNodeStatus) -> RepoResult<usize> {
        let mut changed = 0;
        for id in ids {
            if let Some(mut stored) = self.contexts.get_mut(id) {
                if stored.set_status(status) {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn get_by_ids(&self, ids: &[String]) -> RepoResult<Vec<FlowContext>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.contexts.get(id).map(|c| c.clone()))
            .collect())
    }

    async fn get_running_contexts_by_trace_id(&self, trace_id: &str) -> RepoResult<Vec<FlowContext>> {
        let mut running: Vec<FlowContext> = self
            .contexts
            .iter()
            .filter(|c| c.trace_id == trace_id && !c.status.is_terminal())
            .map(|c| c.clone())
            .collect();
        running.sort_by_key(|c| c.created_at);
        Ok(running)
    }

    async fn find_by_trace_id(&self, trace_id: &str) -> RepoResult<Vec<FlowContext>> {
        let mut all: Vec<FlowContext> = self
            .contexts
            .iter()
            .filter(|c| c.trace_id == trace_id)
            .map(|c| c.clone())
            .collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    async fn save_retry_schedule(
        &self,
        contexts: &[FlowContext],
        next_retry_time: DateTime<Utc>,
    ) -> RepoResult<()> {
        for record in RetryRecord::group(contexts, next_retry_time) {
            let key = Self::retry_key(&record.node_id, &record.to_batch);
            match self.retries.get_mut(&key) {
                Some(mut existing) => {
                    for id in record.context_ids {
                        if !existing.context_ids.contains(&id) {
                            existing.context_ids.push(id);
                        }
                    }
                    existing.retry_count = existing.retry_count.max(record.retry_count);
                    existing.next_retry_time = record.next_retry_time;
                }
                None => {
                    self.retries.insert(key, record);
                }
            }
        }
        Ok(())
    }

    async fn find_due_retries(&self, now: DateTime<Utc>, limit: usize) -> RepoResult<Vec<RetryRecord>> {
        let mut due: Vec<RetryRecord> = self
            .retries
            .iter()
            .filter(|r| r.next_retry_time <= now)
            .map(|r| r.clone())
            .collect();
        due.sort_by_key(|r| r.next_retry_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_retries_by_trace_id(&self, trace_id: &str) -> RepoResult<Vec<RetryRecord>> {
        Ok(self
            .retries
            .iter()
            .filter(|r| r.trace_id == trace_id)
            .map(|r| r.clone())
            .collect())
    }

    async fn delete_retry(&self, record: &RetryRecord) -> RepoResult<()> {
        self.retries
            .remove(&Self::retry_key(&record.node_id, &record.to_batch));
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> RepoResult<usize> {
        Ok(ids.iter().filter(|id| self.contexts.remove(*id).is_some()).count())
    }
}

#[derive(Default)]
pub struct InMemoryTraceRepo {
    traces: DashMap<String, FlowTrace>,
}

impl InMemoryTraceRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowTraceRepo for InMemoryTraceRepo {
    async fn save(&self, trace: &FlowTrace) -> RepoResult<()> {
        match self.traces.get_mut(&trace.id) {
            Some(mut stored) => {
                if !stored.status.is_exclusive() {
                    *stored = trace.clone();
                }
            }
            None => {
                self.traces.insert(trace.id.clone(), trace.clone());
            }
        }
        Ok(())
    }

    async fn find(&self, trace_id: &str) -> RepoResult<Option<FlowTrace>> {
        Ok(self.traces.get(trace_id).map(|t| t.clone()))
    }

    async fn batch_create(&self, traces: &[FlowTrace]) -> RepoResult<()> {
        if let Some(dup) = traces.iter().find(|t| self.traces.contains_key(&t.id)) {
            return Err(PersistenceError::Conflict(format!("trace {} already exists", dup.id)));
        }
        for trace in traces {
            self.traces.insert(trace.id.clone(), trace.clone());
        }
        Ok(())
    }

    async fn batch_update(&self, traces: &[FlowTrace]) -> RepoResult<usize> {
        let mut written = 0;
        for trace in traces {
            if let Some(mut stored) = self.traces.get_mut(&trace.id) {
                if !stored.status.is_exclusive() {
                    // The pool only ever grows.
                    let mut pool = stored.context_pool.clone();
                    pool.extend(trace.context_pool.iter().cloned());
                    *stored = trace.clone();
                    stored.context_pool = pool;
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn update_status(&self, ids: &[String], status: FlowTraceStatus) -> RepoResult<usize> {
        let mut changed = 0;
        for id in ids {
            if let Some(mut stored) = self.traces.get_mut(id) {
                if stored.status.is_exclusive() {
                    continue;
                }
                stored.status = status;
                if status.is_exclusive() {
                    stored.end_time = Some(Utc::now());
                }
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn update_context_pool(&self, trace_ids: &[String], context_ids: &[String]) -> RepoResult<()> {
        for id in trace_ids {
            if let Some(mut stored) = self.traces.get_mut(id) {
                stored.context_pool.extend(context_ids.iter().cloned());
            }
        }
        Ok(())
    }

    async fn find_running_trace(&self, applications: &[String]) -> RepoResult<Vec<String>> {
        let mut running: Vec<(DateTime<Utc>, String)> = self
            .traces
            .iter()
            .filter(|t| matches!(t.status, FlowTraceStatus::Ready | FlowTraceStatus::Running))
            .filter(|t| applications.is_empty() || applications.contains(&t.application))
            .map(|t| (t.start_time, t.id.clone()))
            .collect();
        running.sort();
        Ok(running.into_iter().map(|(_, id)| id).collect())
    }

    async fn get_expired_trace(&self, expired_days: u32, limit: usize) -> RepoResult<Vec<FlowTrace>> {
        let cutoff = Utc::now() - Duration::days(i64::from(expired_days));
        let mut expired: Vec<FlowTrace> = self
            .traces
            .iter()
            .filter(|t| t.status.is_exclusive())
            .filter(|t| t.end_time.map_or(false, |end| end < cutoff))
            .map(|t| t.clone())
            .collect();
        expired.sort_by_key(|t| t.end_time);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn delete_by_id_list(&self, ids: &[String]) -> RepoResult<usize> {
        Ok(ids.iter().filter(|id| self.traces.remove(*id).is_some()).count())
    }
}

#[derive(Default)]
pub struct InMemoryDefinitionRepo {
    definitions: DashMap<String, Arc<FlowDefinition>>,
}

impl InMemoryDefinitionRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowDefinitionRepo for InMemoryDefinitionRepo {
    async fn save(&self, definition: FlowDefinition) -> RepoResult<()> {
        self.definitions
            .insert(definition.stream_id(), Arc::new(definition));
        Ok(())
    }

    async fn find(&self, stream_id: &str) -> RepoResult<Option<Arc<FlowDefinition>>> {
        Ok(self.definitions.get(stream_id).map(|d| d.clone()))
    }

    async fn update_status(&self, stream_id: &str, status: DefinitionStatus) -> RepoResult<()> {
        let mut stored = self
            .definitions
            .get_mut(stream_id)
            .ok_or_else(|| PersistenceError::NotFound(stream_id.to_string()))?;
        let updated = stored.as_ref().clone().with_status(status);
        *stored = Arc::new(updated);
        Ok(())
    }

    async fn list(&self) -> RepoResult<Vec<Arc<FlowDefinition>>> {
        Ok(self.definitions.iter().map(|d| d.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlowData;
    use serde_json::json;

    fn context(trace: &str) -> FlowContext {
        FlowContext::new(trace, "s", "node", FlowData::new(json!({"x": 1})), "op", "b")
    }

    #[tokio::test]
    async fn test_final_context_status_is_never_overwritten() {
        let repo = InMemoryContextRepo::new();
        let ctx = context("t1");
        repo.batch_create(&[ctx.clone()]).await.unwrap();

        for terminal in [FlowNodeStatus::Archived, FlowNodeStatus::Error] {
            let mut fresh = context("t1");
            repo.batch_create(&[fresh.clone()]).await.unwrap();
            assert_eq!(repo.update_status(&[fresh.id.clone()], terminal).await.unwrap(), 1);

            assert_eq!(repo.update_status(&[fresh.id.clone()], FlowNodeStatus::Ready).await.unwrap(), 0);
            fresh.status = FlowNodeStatus::Pending;
            assert_eq!(repo.batch_update(&[fresh.clone()]).await.unwrap(), 0);
            repo.save(&fresh).await.unwrap();

            let stored = repo.get_by_ids(&[fresh.id.clone()]).await.unwrap();
            assert_eq!(stored[0].status, terminal);
        }

        let running = repo.get_running_contexts_by_trace_id("t1").await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, ctx.id);
    }

    #[tokio::test]
    async fn test_context_status_never_moves_backwards() {
        let repo = InMemoryContextRepo::new();
        let ctx = context("t1");
        repo.batch_create(&[ctx.clone()]).await.unwrap();
        let ids = vec![ctx.id.clone()];

        assert_eq!(repo.update_status(&ids, FlowNodeStatus::Ready).await.unwrap(), 1);
        assert_eq!(repo.update_status(&ids, FlowNodeStatus::New).await.unwrap(), 0);
        assert_eq!(repo.update_status(&ids, FlowNodeStatus::Pending).await.unwrap(), 0);

        let mut stale = ctx.clone();
        stale.status = FlowNodeStatus::Pending;
        assert_eq!(repo.batch_update(&[stale.clone()]).await.unwrap(), 0);
        repo.save(&stale).await.unwrap();

        assert_eq!(repo.update_status(&ids, FlowNodeStatus::Retryable).await.unwrap(), 1);
        assert_eq!(repo.update_status(&ids, FlowNodeStatus::Archived).await.unwrap(), 0);
        assert_eq!(repo.get_by_ids(&ids).await.unwrap()[0].status, FlowNodeStatus::Retryable);

        let mut redelivered = ctx.clone();
        redelivered.status = FlowNodeStatus::Ready;
        redelivered.retry_count = 1;
        assert_eq!(repo.batch_update(&[redelivered]).await.unwrap(), 1);
        let stored = repo.get_by_ids(&ids).await.unwrap();
        assert_eq!(stored[0].status, FlowNodeStatus::Ready);
        assert_eq!(stored[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_exclusive_trace_status_rejects_writes() {
        for exclusive in FlowTraceStatus::EXCLUSIVE {
            let repo = InMemoryTraceRepo::new();
            let trace = FlowTrace::new("s", "start", "op", "app");
            repo.batch_create(&[trace.clone()]).await.unwrap();
            assert_eq!(repo.update_status(&[trace.id.clone()], exclusive).await.unwrap(), 1);

            for next in [
                FlowTraceStatus::Ready,
                FlowTraceStatus::Running,
                FlowTraceStatus::Archived,
                FlowTraceStatus::Error,
                FlowTraceStatus::Terminate,
            ] {
                assert_eq!(repo.update_status(&[trace.id.clone()], next).await.unwrap(), 0);
            }
            let mut rewrite = trace.clone();
            rewrite.status = FlowTraceStatus::Running;
            assert_eq!(repo.batch_update(&[rewrite]).await.unwrap(), 0);

            let stored = repo.find(&trace.id).await.unwrap().unwrap();
            assert_eq!(stored.status, exclusive);
            assert!(stored.end_time.is_some());
        }
    }

    #[tokio::test]
    async fn test_context_pool_is_append_only_union() {
        let repo = InMemoryTraceRepo::new();
        let trace = FlowTrace::new("s", "start", "op", "app");
        repo.save(&trace).await.unwrap();
        let ids = vec![trace.id.clone()];
        repo.update_context_pool(&ids, &["a".into(), "b".into()]).await.unwrap();
        repo.update_context_pool(&ids, &["b".into(), "c".into()]).await.unwrap();

        // A stale copy with an empty pool must not shrink it.
        repo.batch_update(&[trace.clone()]).await.unwrap();
        let stored = repo.find(&trace.id).await.unwrap().unwrap();
        assert_eq!(stored.context_pool.iter().cloned().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_running_traces_filtered_by_application() {
        let repo = InMemoryTraceRepo::new();
        let a = FlowTrace::new("s", "start", "op", "billing");
        let b = FlowTrace::new("s", "start", "op", "shipping");
        let mut done = FlowTrace::new("s", "start", "op", "billing");
        done.status = FlowTraceStatus::Archived;
        repo.batch_create(&[a.clone(), b.clone(), done]).await.unwrap();

        assert_eq!(repo.find_running_trace(&[]).await.unwrap().len(), 2);
        assert_eq!(repo.find_running_trace(&["billing".into()]).await.unwrap(), vec![a.id]);
    }

    #[tokio::test]
    async fn test_expired_traces() {
        let repo = InMemoryTraceRepo::new();
        let mut old = FlowTrace::new("s", "start", "op", "app");
        old.status = FlowTraceStatus::Archived;
        old.end_time = Some(Utc::now() - Duration::days(10));
        let mut recent = FlowTrace::new("s", "start", "op", "app");
        recent.status = FlowTraceStatus::Archived;
        recent.end_time = Some(Utc::now());
        let running = FlowTrace::new("s", "start", "op", "app");
        repo.batch_create(&[old.clone(), recent, running]).await.unwrap();

        let expired = repo.get_expired_trace(7, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
        assert_eq!(repo.delete_by_id_list(&[old.id]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_schedule_round() {
        let repo = InMemoryContextRepo::new();
        let mut a = context("t1");
        a.position = "state2".into();
        let mut b = context("t1");
        b.position = "state2".into();
        let later = Utc::now() + Duration::seconds(60);
        repo.save_retry_schedule(&[a.clone(), b.clone()], later).await.unwrap();

        assert!(repo.find_due_retries(Utc::now(), 10).await.unwrap().is_empty());
        let due = repo.find_due_retries(later, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].context_ids, vec![a.id, b.id]);

        repo.delete_retry(&due[0]).await.unwrap();
        assert!(repo.find_retries_by_trace_id("t1").await.unwrap().is_empty());
    }
}
