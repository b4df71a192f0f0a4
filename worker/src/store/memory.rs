//! In-memory status store, used by tests.

use super::{StatusStore, StoreError, TaskUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-process status store. Keeps the last update per task.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, TaskUpdate>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: &str) -> Option<TaskUpdate> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(task_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn update(&self, task_id: &str, update: &TaskUpdate) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(task_id.to_string(), update.clone());
        Ok(())
    }
}
