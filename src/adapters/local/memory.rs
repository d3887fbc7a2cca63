use crate::error::PositionError;
use crate::ports::storage::KeyValueStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-lifetime medium, used as the session-scoped tier.
///
/// Clones share the same map. An optional byte quota makes writes fail the
/// way a full browser storage area does.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Arc::default(),
            quota: Some(quota),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, PositionError> {
        self.entries
            .lock()
            .map_err(|_| PositionError::StorageUnavailable("memory storage poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, PositionError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PositionError> {
        let mut entries = self.lock()?;
        if let Some(quota) = self.quota {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(PositionError::StorageUnavailable(format!(
                    "quota of {} bytes exceeded",
                    quota
                )));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PositionError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
