use flowcore::{FlowContext, FlowData, JoinMode};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// Synchronization barrier of a Join node, keyed by `(trace_id, to_batch)`.
pub(crate) struct JoinBarrier {
    member_count: usize,
    mode: JoinMode,
    arrivals: Mutex<HashMap<(String, String), Vec<FlowContext>>>,
}

impl JoinBarrier {
    pub fn new(member_count: usize, mode: JoinMode) -> Self {
        Self {
            member_count: member_count.max(1),
            mode,
            arrivals: Mutex::new(HashMap::new()),
        }
    }

    /// Record an arrival. Returns the members, in arrival order, once the
    /// last one is in; the key is cleared at that point.
    pub fn arrive(&self, context: FlowContext) -> Option<Vec<FlowContext>> {
        let mut arrivals = self.arrivals.lock().ok()?;
        let key = (context.trace_id.clone(), context.to_batch.clone());
        let members = arrivals.entry(key.clone()).or_default();
        if members.iter().any(|m| m.id == context.id) {
            tracing::debug!("Ignoring duplicate join arrival {}", context.id);
            return None;
        }
        members.push(context);
        if members.len() < self.member_count {
            return None;
        }
        arrivals.remove(&key)
    }

    pub fn waiting(&self, trace_id: &str, to_batch: &str) -> usize {
        self.arrivals
            .lock()
            .ok()
            .and_then(|a| a.get(&(trace_id.to_string(), to_batch.to_string())).map(Vec::len))
            .unwrap_or(0)
    }

    pub fn waiting_in_trace(&self, trace_id: &str) -> usize {
        self.arrivals
            .lock()
            .map(|a| {
                a.iter()
                    .filter(|((trace, _), _)| trace == trace_id)
                    .map(|(_, members)| members.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Traces with at least one arrival waiting.
    pub fn traces(&self) -> Vec<String> {
        self.arrivals
            .lock()
            .map(|a| a.keys().map(|(trace, _)| trace.clone()).collect())
            .unwrap_or_default()
    }

    /// Discard every waiting arrival of `trace_id`; returns how many.
    pub fn forget(&self, trace_id: &str) -> usize {
        let Ok(mut arrivals) = self.arrivals.lock() else {
            return 0;
        };
        let mut dropped = 0;
        arrivals.retain(|(trace, _), members| {
            if trace == trace_id {
                dropped += members.len();
                return false;
            }
            true
        });
        dropped
    }

    /// Combine member payloads. `passData` is merged in arrival order.
    pub fn aggregate(&self, members: &[FlowContext]) -> FlowData {
        let mut pass_data = Map::new();
        for member in members {
            for (key, value) in &member.data.pass_data {
                pass_data.insert(key.clone(), value.clone());
            }
        }

        let business = match self.mode {
            JoinMode::Collect => collect(members),
            JoinMode::Merge if members.iter().all(|m| m.data.business.is_object()) => {
                let mut merged = Map::new();
                for member in members {
                    if let Value::Object(fields) = &member.data.business {
                        for (key, value) in fields {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                }
                Value::Object(merged)
            }
            // scalars cannot be merged key-wise
            JoinMode::Merge => collect(members),
        };

        FlowData { business, pass_data }
    }
}

fn collect(members: &[FlowContext]) -> Value {
    let items = members.iter().map(|m| m.data.business.clone()).collect();
    let mut wrapper = Map::new();
    wrapper.insert("items".to_string(), Value::Array(items));
    Value::Object(wrapper)
}
