use super::{Subscriber, Subscription, Whether};
use crate::services::Services;
use flowcore::{ConditionEvaluationError, FlowContext, FlowEvent, FlowNodeStatus, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Outgoing side of a node: fans contexts out over the node's events.
pub struct FlowPublisher {
    node_id: String,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    services: Arc<Services>,
}

/// Children persisted by [`FlowPublisher::prepare`], not yet handed to
/// any subscriber.
pub struct Emission {
    deliveries: Vec<(Arc<Subscription>, Vec<FlowContext>)>,
    /// Sources whose routing predicate could not be evaluated
    pub failed: Vec<(FlowContext, ConditionEvaluationError)>,
    /// Ids of sources that matched no outgoing event
    pub unmatched: Vec<String>,
}

impl Emission {
    pub fn len(&self) -> usize {
        self.deliveries.iter().map(|(_, c)| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push the prepared children into their subscriptions.
    pub fn deliver(self) -> usize {
        let mut delivered = 0;
        for (subscription, contexts) in self.deliveries {
            delivered += contexts.len();
            subscription.push(contexts);
        }
        delivered
    }
}

impl FlowPublisher {
    pub(crate) fn new(node_id: impl Into<String>, services: Arc<Services>) -> Self {
        Self {
            node_id: node_id.into(),
            subscriptions: RwLock::new(Vec::new()),
            services,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub(crate) fn attach(
        &self,
        event: FlowEvent,
        subscriber: Arc<dyn Subscriber>,
        whether: Option<Whether>,
    ) -> Arc<Subscription> {
        let subscription = Arc::new(Subscription::new(event, subscriber.clone(), whether));
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            subscriptions.push(subscription.clone());
        }
        subscriber.on_subscribe(subscription.clone());
        subscription
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Route `sources` over every matching event and persist one child per
    /// match, positioned at the event id and marked `PENDING`. Children are
    /// added to their trace's context pool before this returns.
    pub async fn prepare(&self, sources: &[FlowContext]) -> Result<Emission> {
        let subscriptions = self.subscriptions();
        let mut routed: Vec<Vec<FlowContext>> = vec![Vec::new(); subscriptions.len()];
        let mut failed = Vec::new();
        let mut unmatched = Vec::new();

        'sources: for source in sources {
            let mut matches = Vec::new();
            for (index, subscription) in subscriptions.iter().enumerate() {
                match subscription.matches(source) {
                    Ok(true) => matches.push(index),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(
                            "Context {} on {}: cannot evaluate rule of event {}: {}",
                            source.id,
                            self.node_id,
                            subscription.event_id(),
                            e
                        );
                        failed.push((source.clone(), e));
                        continue 'sources;
                    }
                }
            }
            if matches.is_empty() {
                unmatched.push(source.id.clone());
            }
            for index in matches {
                let event_id = subscriptions[index].event_id();
                routed[index].push(source.derive(event_id, source.data.clone()));
            }
        }

        let children: Vec<FlowContext> = routed.iter().flatten().cloned().collect();
        if !children.is_empty() {
            self.services.contexts.batch_create(&children).await?;

            let mut by_trace: BTreeMap<&str, Vec<String>> = BTreeMap::new();
            for child in &children {
                by_trace.entry(&child.trace_id).or_default().push(child.id.clone());
            }
            for (trace_id, ids) in &by_trace {
                self.services
                    .traces
                    .update_context_pool(&[trace_id.to_string()], ids)
                    .await?;
            }

            let ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
            self.services
                .contexts
                .update_status(&ids, FlowNodeStatus::Pending)
                .await?;
            tracing::debug!("Node {} persisted {} children", self.node_id, children.len());
        }

        let deliveries = subscriptions
            .into_iter()
            .zip(routed)
            .filter(|(_, contexts)| !contexts.is_empty())
            .map(|(subscription, mut contexts)| {
                for context in &mut contexts {
                    context.set_status(FlowNodeStatus::Pending);
                }
                (subscription, contexts)
            })
            .collect();

        Ok(Emission {
            deliveries,
            failed,
            unmatched,
        })
    }
}
