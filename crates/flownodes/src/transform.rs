use async_trait::async_trait;
use flowcore::{lookup, FlowData, Jober, JoberContext, NodeError};
use flowruntime::{ConfigKey, JoberFactory, JoberMetadata};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Writes fixed values into the business payload at dotted paths
pub struct JsonSetJober {
    values: Map<String, Value>,
}

impl JsonSetJober {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl Jober for JsonSetJober {
    fn jober_type(&self) -> &str {
        "json.set"
    }

    async fn execute(&self, _ctx: &JoberContext, data: Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> {
        data.into_iter()
            .map(|mut item| {
                if item.business.is_null() {
                    item.business = Value::Object(Map::new());
                }
                for (path, value) in &self.values {
                    set_path(&mut item.business, path, value.clone())?;
                }
                Ok(item)
            })
            .collect()
    }
}

fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), NodeError> {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Value::Object(map) = current else {
            return Err(NodeError::InvalidInput(format!(
                "cannot set '{}': '{}' is not inside an object",
                path, segment
            )));
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

pub struct JsonSetJoberFactory;

impl JoberFactory for JsonSetJoberFactory {
    fn create(&self, config: &Map<String, Value>) -> Result<Arc<dyn Jober>, NodeError> {
        match config.get("values") {
            Some(Value::Object(values)) => Ok(Arc::new(JsonSetJober::new(values.clone()))),
            _ => Err(NodeError::Configuration(
                "json.set requires a 'values' object".to_string(),
            )),
        }
    }

    fn jober_type(&self) -> &str {
        "json.set"
    }

    fn metadata(&self) -> JoberMetadata {
        JoberMetadata {
            description: "Set fields of the business payload".to_string(),
            category: "transform".to_string(),
            config_keys: vec![ConfigKey::new("values", "Object of dotted path to value", true)],
        }
    }
}

/// Projects the business payload down to the listed dotted paths.
/// Missing paths are skipped unless `strict` is set.
pub struct JsonPickJober {
    fields: Vec<String>,
    strict: bool,
}

#[async_trait]
impl Jober for JsonPickJober {
    fn jober_type(&self) -> &str {
        "json.pick"
    }

    async fn execute(&self, _ctx: &JoberContext, data: Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> {
        data.into_iter()
            .map(|item| {
                let mut picked = Map::new();
                for field in &self.fields {
                    match lookup(&item.business, field) {
                        Some(value) => {
                            picked.insert(field.clone(), value.clone());
                        }
                        None if self.strict => {
                            return Err(NodeError::InvalidInput(format!("missing field '{}'", field)));
                        }
                        None => {}
                    }
                }
                Ok(item.with_business(Value::Object(picked)))
            })
            .collect()
    }
}

pub struct JsonPickJoberFactory;

impl JoberFactory for JsonPickJoberFactory {
    fn create(&self, config: &Map<String, Value>) -> Result<Arc<dyn Jober>, NodeError> {
        let fields = config
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| NodeError::Configuration("json.pick requires a 'fields' array".to_string()))?
            .iter()
            .map(|f| {
                f.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| NodeError::Configuration("json.pick fields must be strings".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let strict = config.get("strict").and_then(Value::as_bool).unwrap_or(false);
        Ok(Arc::new(JsonPickJober { fields, strict }))
    }

    fn jober_type(&self) -> &str {
        "json.pick"
    }

    fn metadata(&self) -> JoberMetadata {
        JoberMetadata {
            description: "Keep only the listed fields of the business payload".to_string(),
            category: "transform".to_string(),
            config_keys: vec![
                ConfigKey::new("fields", "Dotted paths to keep", true),
                ConfigKey::new("strict", "Fail when a field is missing", false),
            ],
        }
    }
}
