use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload carried by a [`crate::FlowContext`].
///
/// `business` is what Jobers and condition rules see; `pass_data` travels
/// through every node untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowData {
    pub business: Value,
    #[serde(default)]
    pub pass_data: Map<String, Value>,
}

impl FlowData {
    pub fn new(business: Value) -> Self {
        Self {
            business,
            pass_data: Map::new(),
        }
    }

    pub fn with_pass_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pass_data.insert(key.into(), value.into());
        self
    }

    /// Look up a dotted path (`order.items.0.sku`) inside the business payload.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.business, path)
    }

    /// Replace the business payload, keeping pass-through data.
    pub fn with_business(&self, business: Value) -> Self {
        Self {
            business,
            pass_data: self.pass_data.clone(),
        }
    }
}

impl From<Value> for FlowData {
    fn from(business: Value) -> Self {
        FlowData::new(business)
    }
}

/// Resolve a dotted path against a JSON value. Numeric segments index arrays.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
