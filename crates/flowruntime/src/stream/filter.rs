use flowcore::FlowContext;
use std::collections::HashMap;
use std::sync::Mutex;

/// `minimumSize` pre-filter: holds contexts until `threshold` of the same
/// `(trace_id, to_batch)` are buffered, then releases them as one batch.
pub(crate) struct BatchFilter {
    threshold: usize,
    pending: Mutex<HashMap<(String, String), Vec<FlowContext>>>,
}

impl BatchFilter {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer `contexts` and return every batch that became complete.
    /// Redelivered context ids are ignored.
    pub fn admit(&self, contexts: Vec<FlowContext>) -> Vec<Vec<FlowContext>> {
        let Ok(mut pending) = self.pending.lock() else {
            return Vec::new();
        };
        let mut released = Vec::new();
        for context in contexts {
            let key = (context.trace_id.clone(), context.to_batch.clone());
            let buffer = pending.entry(key.clone()).or_default();
            if buffer.iter().any(|c| c.id == context.id) {
                continue;
            }
            buffer.push(context);
            if buffer.len() >= self.threshold {
                released.push(buffer.drain(..self.threshold).collect());
                if buffer.is_empty() {
                    pending.remove(&key);
                }
            }
        }
        released
    }

    /// Contexts still waiting for their batch to fill.
    pub fn waiting(&self) -> usize {
        self.pending
            .lock()
            .map(|p| p.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn waiting_in_trace(&self, trace_id: &str) -> usize {
        self.pending
            .lock()
            .map(|p| {
                p.iter()
                    .filter(|((trace, _), _)| trace == trace_id)
                    .map(|(_, buffer)| buffer.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn traces(&self) -> Vec<String> {
        self.pending
            .lock()
            .map(|p| p.keys().map(|(trace, _)| trace.clone()).collect())
            .unwrap_or_default()
    }

    /// Discard every buffered context of `trace_id`; returns how many.
    pub fn forget(&self, trace_id: &str) -> usize {
        let Ok(mut pending) = self.pending.lock() else {
            return 0;
        };
        let mut dropped = 0;
        pending.retain(|(trace, _), buffer| {
            if trace == trace_id {
                dropped += buffer.len();
                return false;
            }
            true
        });
        dropped
    }
}
