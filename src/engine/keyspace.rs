use std::collections::HashMap;
use std::sync::Arc;

use crate::vset::{IdentityRegistry, IndexParams, VectorSet, VsetError};

#[derive(Debug)]
pub enum Value {
    Str(Vec<u8>),
    Set(Arc<VectorSet>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Set(_) => "vectorset",
        }
    }
}

/// Key → value table owned by the controlling thread.
pub struct Keyspace {
    entries: HashMap<Vec<u8>, Value>,
    registry: IdentityRegistry,
    params: IndexParams,
}

impl Keyspace {
    pub fn new(params: IndexParams) -> Self {
        Self {
            entries: HashMap::new(),
            registry: IdentityRegistry::new(),
            params,
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn params(&self) -> IndexParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// `Ok(None)` for a missing key, `WrongType` for a non-set value.
    pub fn vector_set(&self, key: &[u8]) -> Result<Option<&Arc<VectorSet>>, VsetError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Set(set)) => Ok(Some(set)),
            Some(Value::Str(_)) => Err(VsetError::WrongType),
        }
    }

    /// Stores `value`, destroying whatever the key held before. Returns
    /// whether a previous value existed.
    pub fn insert(&mut self, key: Vec<u8>, value: Value) -> bool {
        match self.entries.insert(key, value) {
            Some(old) => {
                destroy(old);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                destroy(old);
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Value)> {
        self.entries.iter()
    }

    /// Destroys every value; used at shutdown.
    pub fn clear(&mut self) {
        for (_, value) in self.entries.drain() {
            destroy(value);
        }
    }
}

/// Vector sets wait for in-flight background work before they go away.
fn destroy(value: Value) {
    if let Value::Set(set) = value {
        let in_flight = set.in_flight();
        if in_flight > 0 {
            tracing::debug!(in_flight, "waiting for background work before freeing set");
        }
        set.drain();
    }
}
