//! In-memory tree store, used by tests and by `userproof --memory_tree`
//! single-pass root computation. Clones share the underlying map so a store
//! handle can be reopened like a persistent backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::TreeStore;
use crate::error::Result;

#[derive(Clone, Default)]
pub struct MemoryStore {
    nodes: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TreeStore for MemoryStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.nodes.lock().unwrap().get(key).cloned())
    }

    fn set_many(&mut self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        for (key, value) in entries {
            nodes.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn delete_many(&mut self, keys: &[String]) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        for key in keys {
            nodes.remove(key);
        }
        Ok(())
    }
}
