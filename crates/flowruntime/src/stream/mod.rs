//! Demand-driven streaming primitives.
//!
//! A [`Publisher`] hands contexts to a [`Subscriber`] only against demand the
//! subscriber signalled through [`Subscription::request`]. Node stages are
//! built from these: the start node is a publisher, the end node a
//! subscriber, everything in between a [`Processor`].

mod filter;
mod join;
mod node;
mod publisher;
mod start;

pub use node::NodeProcessor;
pub use publisher::{Emission, FlowPublisher};
pub use start::StartPublisher;

pub(crate) use join::JoinBarrier;
pub(crate) use node::Behavior;

use flowcore::{ConditionEvaluationError, FlowContext, FlowEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Per-event routing predicate.
pub type Whether = Arc<dyn Fn(&FlowContext) -> Result<bool, ConditionEvaluationError> + Send + Sync>;

/// Anything sitting on a node of the graph.
pub trait Stage: Send + Sync {
    fn node_id(&self) -> &str;
}

pub trait Publisher: Stage {
    /// Attach `subscriber` to the outgoing `event`. The subscriber receives
    /// `on_subscribe` before this returns.
    fn subscribe(
        &self,
        event: FlowEvent,
        subscriber: Arc<dyn Subscriber>,
        whether: Option<Whether>,
    ) -> Arc<Subscription>;

    fn subscriptions(&self) -> Vec<Arc<Subscription>>;
}

pub trait Subscriber: Stage {
    fn on_subscribe(&self, subscription: Arc<Subscription>);

    /// Must not block: called while the publisher drains its buffer.
    fn on_next(&self, event_id: &str, contexts: Vec<FlowContext>);
}

pub trait Processor: Publisher + Subscriber {}

impl<T: Publisher + Subscriber> Processor for T {}

#[derive(Default)]
struct SubscriptionState {
    demand: usize,
    buffer: VecDeque<FlowContext>,
    cancelled: bool,
}

/// Link between a publisher and one subscriber, for one event.
pub struct Subscription {
    event: FlowEvent,
    whether: Option<Whether>,
    subscriber: Arc<dyn Subscriber>,
    state: Mutex<SubscriptionState>,
}

impl Subscription {
    pub(crate) fn new(event: FlowEvent, subscriber: Arc<dyn Subscriber>, whether: Option<Whether>) -> Self {
        Self {
            event,
            whether,
            subscriber,
            state: Mutex::new(SubscriptionState::default()),
        }
    }

    pub fn event(&self) -> &FlowEvent {
        &self.event
    }

    pub fn event_id(&self) -> &str {
        &self.event.meta_id
    }

    pub fn target(&self) -> &str {
        &self.event.to
    }

    /// Whether `context` should travel along this event.
    pub fn matches(&self, context: &FlowContext) -> Result<bool, ConditionEvaluationError> {
        match &self.whether {
            Some(whether) => whether(context),
            None => Ok(true),
        }
    }

    /// Signal demand for `n` more contexts.
    pub fn request(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.demand = state.demand.saturating_add(n);
        }
        self.drain();
    }

    pub fn cancel(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.cancelled = true;
            state.buffer.clear();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().map(|s| s.cancelled).unwrap_or(true)
    }

    pub fn demand(&self) -> usize {
        self.state.lock().map(|s| s.demand).unwrap_or(0)
    }

    /// Contexts waiting for demand.
    pub fn buffered(&self) -> usize {
        self.state.lock().map(|s| s.buffer.len()).unwrap_or(0)
    }

    pub(crate) fn push(&self, contexts: Vec<FlowContext>) {
        if contexts.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            if state.cancelled {
                tracing::debug!("Dropping {} contexts on cancelled event {}", contexts.len(), self.event_id());
                return;
            }
            state.buffer.extend(contexts);
        }
        self.drain();
    }

    fn drain(&self) {
        let batch: Vec<FlowContext> = match self.state.lock() {
            Ok(mut state) => {
                let take = state.demand.min(state.buffer.len());
                state.demand -= take;
                state.buffer.drain(..take).collect()
            }
            Err(_) => return,
        };
        if !batch.is_empty() {
            self.subscriber.on_next(self.event_id(), batch);
        }
    }
}
