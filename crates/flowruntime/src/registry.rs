use flowcore::{Jober, NodeError, TaskSpec};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds Jober instances from a node's `task.config`
pub trait JoberFactory: Send + Sync {
    fn create(&self, config: &Map<String, Value>) -> Result<Arc<dyn Jober>, NodeError>;

    /// Identifier matched against `task.type`
    fn jober_type(&self) -> &str;

    fn metadata(&self) -> JoberMetadata {
        JoberMetadata::default()
    }
}

/// Metadata about a jober type
#[derive(Debug, Clone)]
pub struct JoberMetadata {
    pub description: String,
    pub category: String,
    /// Recognised `task.config` keys
    pub config_keys: Vec<ConfigKey>,
}

impl Default for JoberMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            config_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigKey {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ConfigKey {
    pub fn new(name: &str, description: &str, required: bool) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required,
        }
    }
}

/// Hands out one shared, already-configured instance.
struct SharedJober(Arc<dyn Jober>);

impl JoberFactory for SharedJober {
    fn create(&self, _config: &Map<String, Value>) -> Result<Arc<dyn Jober>, NodeError> {
        Ok(self.0.clone())
    }

    fn jober_type(&self) -> &str {
        self.0.jober_type()
    }
}

/// Registry of available jober types
#[derive(Default)]
pub struct JoberRegistry {
    factories: HashMap<String, Arc<dyn JoberFactory>>,
}

impl JoberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn JoberFactory>) {
        let jober_type = factory.jober_type().to_string();
        tracing::info!("Registering jober type: {}", jober_type);
        self.factories.insert(jober_type, factory);
    }

    /// Register a ready instance; every task of its type shares it and the
    /// task config is ignored.
    pub fn register_jober(&mut self, jober: Arc<dyn Jober>) {
        self.register(Arc::new(SharedJober(jober)));
    }

    pub fn create_jober(&self, task: &TaskSpec) -> Result<Arc<dyn Jober>, NodeError> {
        let factory = self
            .factories
            .get(&task.jober_type)
            .ok_or_else(|| NodeError::UnknownJober(task.jober_type.clone()))?;
        factory.create(&task.config)
    }

    pub fn contains(&self, jober_type: &str) -> bool {
        self.factories.contains_key(jober_type)
    }

    /// Registered types, sorted
    pub fn list_jober_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, jober_type: &str) -> Option<JoberMetadata> {
        self.factories.get(jober_type).map(|f| f.metadata())
    }
}
