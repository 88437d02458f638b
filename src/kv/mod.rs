//! Key-value persistence used by the registry and cursor store.
//!
//! The store guarantees read-your-writes per key, atomic set operations and
//! a per-key compare-and-swap. Nothing spans keys: callers that need two
//! keys to agree (the registry's forward/reverse indices) arrange that
//! themselves on top of `compare_and_swap`.

mod memory;
mod valkey;

pub use memory::MemoryStore;
pub use valkey::ValkeyStore;

use crate::config::KvConfig;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Retry budget for one optimistic read-modify-write.
pub const MAX_CAS_ATTEMPTS: u32 = 16;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("valkey error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    /// Returns true when the member was not already present.
    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, KvError>;
    /// Returns true when the member was present.
    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn members_of(&self, key: &str) -> Result<Vec<String>, KvError>;
    /// Replace the value at `key` only if it currently equals `expected`
    /// (`None` = absent). `new = None` deletes. Returns whether the swap applied.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, KvError>;
}

/// Open the configured store. An empty URL selects the in-process store,
/// which forgets everything on restart.
pub async fn connect(config: &KvConfig) -> Result<Arc<dyn KvStore>, KvError> {
    if config.url.is_empty() {
        warn!("kv.url is empty, using in-memory store (state is lost on restart)");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = ValkeyStore::connect(&config.url, &config.prefix).await?;
    store.ping().await?;
    Ok(Arc::new(store))
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("corrupt value at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{key} still contended after {attempts} attempts")]
    Contended { key: String, attempts: u32 },
}

/// Outcome of one step of an optimistic update.
pub enum Mutation<T, R> {
    /// Leave the stored value alone.
    Keep(R),
    Put(T, R),
    Delete(R),
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, UpdateError> {
    match store.get(key).await? {
        Some(raw) => decode(key, &raw).map(Some),
        None => Ok(None),
    }
}

/// Read-modify-write of a JSON value under `key`.
///
/// `f` sees the current value and decides the mutation. If another writer
/// changed the key in between, the swap is refused and `f` runs again on
/// the fresh value, so `f` must be free of side effects.
pub async fn update_json<T, R, F>(store: &dyn KvStore, key: &str, mut f: F) -> Result<R, UpdateError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Mutation<T, R>,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let raw = store.get(key).await?;
        let current = match raw.as_deref() {
            Some(s) => Some(decode::<T>(key, s)?),
            None => None,
        };

        let applied = match f(current) {
            Mutation::Keep(out) => return Ok(out),
            Mutation::Put(value, out) => {
                let encoded = serde_json::to_string(&value).map_err(|source| UpdateError::Corrupt {
                    key: key.to_string(),
                    source,
                })?;
                if raw.as_deref() == Some(encoded.as_str()) {
                    return Ok(out);
                }
                store
                    .compare_and_swap(key, raw.as_deref(), Some(&encoded))
                    .await?
                    .then_some(out)
            }
            Mutation::Delete(out) => {
                if raw.is_none() {
                    return Ok(out);
                }
                store
                    .compare_and_swap(key, raw.as_deref(), None)
                    .await?
                    .then_some(out)
            }
        };

        if let Some(out) = applied {
            return Ok(out);
        }
        debug!(key, attempt, "compare-and-swap lost, retrying");
        // Let the winner finish its follow-up writes before re-reading.
        tokio::task::yield_now().await;
    }

    Err(UpdateError::Contended {
        key: key.to_string(),
        attempts: MAX_CAS_ATTEMPTS,
    })
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, UpdateError> {
    serde_json::from_str(raw).map_err(|source| UpdateError::Corrupt {
        key: key.to_string(),
        source,
    })
}
