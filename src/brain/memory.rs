//! In-memory brain store, used by tests and as a throwaway provider
//! when no durable state is wanted.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{BrainError, BrainStore};

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl BrainStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, BrainError> {
        Ok(self
            .map
            .lock()
            .map_err(|_| BrainError::Store("store mutex poisoned".into()))?
            .get(key)
            .cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), BrainError> {
        self.map
            .lock()
            .map_err(|_| BrainError::Store("store mutex poisoned".into()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("missing").unwrap().is_none());
        store.put("k", "v1").unwrap();
        store.put("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
    }
}
