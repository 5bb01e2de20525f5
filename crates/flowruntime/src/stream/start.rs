use super::{FlowPublisher, Publisher, Stage, Subscriber, Subscription, Whether};
use crate::services::Services;
use chrono::Utc;
use flowcore::{ExecutionEvent, FlowContext, FlowEvent, FlowNode, FlowNodeStatus, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Head of a pipeline. Has no input; contexts enter through [`offer`](Self::offer).
pub struct StartPublisher {
    node: FlowNode,
    publisher: FlowPublisher,
    services: Arc<Services>,
}

impl StartPublisher {
    pub(crate) fn new(node: FlowNode, services: Arc<Services>) -> Self {
        let publisher = FlowPublisher::new(node.meta_id.clone(), services.clone());
        Self {
            node,
            publisher,
            services,
        }
    }

    pub fn node(&self) -> &FlowNode {
        &self.node
    }

    /// Emit `NEW` contexts sitting on the start node and archive them.
    /// Contexts already moved on are skipped. Returns the number of
    /// children handed downstream.
    pub async fn offer(&self, contexts: Vec<FlowContext>) -> Result<usize> {
        if contexts.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = contexts.iter().map(|c| c.id.clone()).collect();
        let fresh: Vec<FlowContext> = self
            .services
            .contexts
            .get_by_ids(&ids)
            .await?
            .into_iter()
            .filter(|c| c.status == FlowNodeStatus::New && c.position == self.node.meta_id)
            .collect();
        if fresh.len() < contexts.len() {
            tracing::debug!(
                "Start node {} skipped {} contexts already in flight",
                self.node.meta_id,
                contexts.len() - fresh.len()
            );
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        let emission = self.publisher.prepare(&fresh).await?;
        let archived: Vec<String> = fresh.iter().map(|c| c.id.clone()).collect();
        self.services
            .contexts
            .update_status(&archived, FlowNodeStatus::Archived)
            .await?;
        let emitted = emission.deliver();

        let traces: BTreeSet<&str> = fresh.iter().map(|c| c.trace_id.as_str()).collect();
        for trace_id in &traces {
            self.services.events.emit(ExecutionEvent::NodeProcessed {
                trace_id: trace_id.to_string(),
                node_id: self.node.meta_id.clone(),
                consumed: fresh.iter().filter(|c| c.trace_id == *trace_id).count(),
                emitted,
                timestamp: Utc::now(),
            });
            if emitted == 0 {
                self.services.finish_if_idle(trace_id).await?;
            }
        }
        tracing::debug!("Start node {} emitted {} contexts", self.node.meta_id, emitted);
        Ok(emitted)
    }
}

impl Stage for StartPublisher {
    fn node_id(&self) -> &str {
        &self.node.meta_id
    }
}

impl Publisher for StartPublisher {
    fn subscribe(
        &self,
        event: FlowEvent,
        subscriber: Arc<dyn Subscriber>,
        whether: Option<Whether>,
    ) -> Arc<Subscription> {
        self.publisher.attach(event, subscriber, whether)
    }

    fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.publisher.subscriptions()
    }
}
