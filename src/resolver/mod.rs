//! Handle → wallet address lookup.
//!
//! The wallet lookup API answers `GET {base}/api/wallet?username={handle}`
//! with `{"wallet": "<address>"}`. Lookups are expensive and quota-bound;
//! the registry memoizes the answer per handle, so this is only called at
//! subscribe time (and by explicit verification).

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const MAX_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no wallet found for @{0}")]
    NotFound(String),
    #[error("resolver request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("resolver returned status {0}")]
    Upstream(StatusCode),
}

#[async_trait]
pub trait HandleResolver: Send + Sync {
    async fn resolve(&self, handle: &str) -> Result<String, ResolveError>;

    /// Resolve bypassing any cache. Used to verify a stored answer.
    async fn resolve_fresh(&self, handle: &str) -> Result<String, ResolveError> {
        self.resolve(handle).await
    }
}

/// Canonical form of a handle: no leading '@', lowercase.
pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_ascii_lowercase()
}

#[derive(Debug, Deserialize)]
struct WalletResponse {
    #[serde(default)]
    wallet: Option<String>,
}

/// Resolver backed by the wallet lookup HTTP API.
#[derive(Clone)]
pub struct HttpResolver {
    base_url: String,
    http: Client,
}

impl HttpResolver {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ResolveError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl HandleResolver for HttpResolver {
    async fn resolve(&self, handle: &str) -> Result<String, ResolveError> {
        let url = format!("{}/api/wallet", self.base_url);

        // Server errors are retried with backoff; 404 and empty answers are final.
        let mut delay = Duration::from_millis(500);
        let mut attempt = 1;
        loop {
            let resp = self
                .http
                .get(&url)
                .query(&[("username", handle)])
                .send()
                .await?;
            let status = resp.status();

            if status == StatusCode::NOT_FOUND {
                return Err(ResolveError::NotFound(handle.to_string()));
            }
            if status.is_success() {
                let body: WalletResponse = resp.json().await?;
                return match body.wallet.filter(|w| !w.is_empty()) {
                    Some(wallet) => {
                        info!(handle = %handle, wallet = %wallet, "handle resolved");
                        Ok(wallet)
                    }
                    None => Err(ResolveError::NotFound(handle.to_string())),
                };
            }
            if !status.is_server_error() || attempt >= MAX_ATTEMPTS {
                return Err(ResolveError::Upstream(status));
            }

            debug!(handle = %handle, status = %status, attempt, "wallet lookup failed, retrying");
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }
}

/// In-process memo in front of another resolver. Only successful answers
/// are kept, so an unknown handle is looked up again next time.
pub struct CachedResolver {
    inner: Arc<dyn HandleResolver>,
    cache: DashMap<String, String>,
}

impl CachedResolver {
    pub fn new(inner: Arc<dyn HandleResolver>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[async_trait]
impl HandleResolver for CachedResolver {
    async fn resolve(&self, handle: &str) -> Result<String, ResolveError> {
        let key = normalize_handle(handle);
        if let Some(address) = self.cache.get(&key) {
            debug!(handle = %key, "handle cache hit");
            return Ok(address.value().clone());
        }
        let address = self.inner.resolve(handle).await?;
        self.cache.insert(key, address.clone());
        Ok(address)
    }

    async fn resolve_fresh(&self, handle: &str) -> Result<String, ResolveError> {
        let address = self.inner.resolve_fresh(handle).await?;
        self.cache.insert(normalize_handle(handle), address.clone());
        Ok(address)
    }
}
