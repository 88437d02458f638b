use super::{KvError, KvStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// In-process store. Used by tests and by `kv.url = ""` dev runs.
///
/// Each DashMap shard lock covers one key's read-check-write, which is
/// exactly the per-key linearizability the trait promises.
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<DashMap<String, String>>,
    sets: Arc<DashMap<String, HashSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.values.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, KvError> {
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let removed = match self.sets.get_mut(key) {
            Some(mut set) => set.remove(member),
            None => false,
        };
        // Empty sets vanish, as in Valkey.
        self.sets.remove_if(key, |_, set| set.is_empty());
        Ok(removed)
    }

    async fn members_of(&self, key: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, KvError> {
        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if expected != Some(slot.get().as_str()) {
                    return Ok(false);
                }
                match new {
                    Some(value) => {
                        slot.insert(value.to_string());
                    }
                    None => {
                        slot.remove();
                    }
                }
                Ok(true)
            }
            Entry::Vacant(slot) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some(value) = new {
                    slot.insert(value.to_string());
                }
                Ok(true)
            }
        }
    }
}
