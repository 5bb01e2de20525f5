use async_trait::async_trait;
use flowcore::{FlowData, Jober, JoberContext, NodeError};
use flowruntime::{ConfigKey, JoberFactory, JoberMetadata};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Logs every payload of the batch and passes it through unchanged
pub struct LogJober {
    message: String,
}

#[async_trait]
impl Jober for LogJober {
    fn jober_type(&self) -> &str {
        "log"
    }

    async fn execute(&self, ctx: &JoberContext, data: Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> {
        tracing::info!(
            "{} [trace {} node {} batch {}]: {} payloads",
            self.message,
            ctx.trace_id,
            ctx.node_id,
            ctx.to_batch,
            data.len()
        );
        for (i, item) in data.iter().enumerate() {
            tracing::info!("  #{} business={} passData={:?}", i, item.business, item.pass_data);
        }
        Ok(data)
    }
}

pub struct LogJoberFactory;

impl JoberFactory for LogJoberFactory {
    fn create(&self, config: &Map<String, Value>) -> Result<Arc<dyn Jober>, NodeError> {
        let message = match config.get("message") {
            None => "log".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(NodeError::Configuration("log.message must be a string".to_string())),
        };
        Ok(Arc::new(LogJober { message }))
    }

    fn jober_type(&self) -> &str {
        "log"
    }

    fn metadata(&self) -> JoberMetadata {
        JoberMetadata {
            description: "Logs its inputs and passes them through".to_string(),
            category: "debug".to_string(),
            config_keys: vec![ConfigKey::new("message", "Prefix of the log line", false)],
        }
    }
}
