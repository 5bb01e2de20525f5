use async_trait::async_trait;
use flowcore::{FlowData, Jober, JoberContext, NodeError};
use flowruntime::{ConfigKey, JoberFactory, JoberMetadata};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Waits for a fixed duration, then passes the batch through
pub struct DelayJober {
    delay: Duration,
}

impl DelayJober {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Jober for DelayJober {
    fn jober_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: &JoberContext, data: Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> {
        tracing::debug!("Node {} delaying {}ms", ctx.node_id, self.delay.as_millis());
        sleep(self.delay).await;
        Ok(data)
    }
}

pub struct DelayJoberFactory;

impl JoberFactory for DelayJoberFactory {
    fn create(&self, config: &Map<String, Value>) -> Result<Arc<dyn Jober>, NodeError> {
        let delay_ms = match config.get("delayMs") {
            None => 1000,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| NodeError::Configuration("delayMs must be a non-negative integer".to_string()))?,
        };
        Ok(Arc::new(DelayJober::new(Duration::from_millis(delay_ms))))
    }

    fn jober_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> JoberMetadata {
        JoberMetadata {
            description: "Delay for the configured milliseconds".to_string(),
            category: "time".to_string(),
            config_keys: vec![ConfigKey::new("delayMs", "Milliseconds to wait (default 1000)", false)],
        }
    }
}
