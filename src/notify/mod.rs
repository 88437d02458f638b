//! Alert fan-out.
//!
//! One message per (subscriber, claim). Subscribers are served
//! concurrently; one subscriber's claims go out in order. A failed or
//! timed-out send is counted and never retried within the cycle.

mod render;
mod telegram;

pub use render::{render_claim_alert, shorten};
pub use telegram::TelegramChannel;

use crate::detect::Claim;
use crate::registry::{Profile, Registry, RegistryError, Target};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("delivery request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("channel rejected message ({status}): {description}")]
    Rejected { status: u16, description: String },
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, delivery_address: &str, message: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: u32,
    pub failed: u32,
}

/// Live record of one dispatch. Updated as sends happen, so it stays
/// readable when the dispatch future is dropped on a timeout: a send that
/// was started but never finished counts as failed.
#[derive(Debug)]
pub struct WaveProgress {
    started: Vec<AtomicBool>,
    attempted: AtomicU32,
    delivered: AtomicU32,
}

impl WaveProgress {
    pub fn new(claims: usize) -> Self {
        Self {
            started: (0..claims).map(|_| AtomicBool::new(false)).collect(),
            attempted: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
        }
    }

    /// Whether claim `index` had at least one send attempted.
    pub fn is_started(&self, index: usize) -> bool {
        self.started
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn report(&self) -> DispatchReport {
        let attempted = self.attempted.load(Ordering::SeqCst);
        let delivered = self.delivered.load(Ordering::SeqCst);
        DispatchReport {
            delivered,
            failed: attempted.saturating_sub(delivered),
        }
    }

    fn begin(&self, index: usize) {
        if let Some(flag) = self.started.get(index) {
            flag.store(true, Ordering::SeqCst);
        }
        self.attempted.fetch_add(1, Ordering::SeqCst);
    }

    fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    channel: Arc<dyn NotificationChannel>,
    send_timeout: Duration,
    max_in_flight: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Registry,
        channel: Arc<dyn NotificationChannel>,
        send_timeout: Duration,
        max_in_flight: usize,
    ) -> Self {
        Self {
            registry,
            channel,
            send_timeout,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Deliver `claims` to every current subscriber of `target`. Errors only
    /// when the subscriber list itself cannot be read, in which case nothing
    /// was attempted.
    pub async fn dispatch(&self, target: &Target, claims: &[Claim]) -> Result<DispatchReport, RegistryError> {
        let progress = WaveProgress::new(claims.len());
        self.dispatch_tracked(target, claims, &progress).await
    }

    /// As `dispatch`, recording every attempt in `progress`.
    pub async fn dispatch_tracked(
        &self,
        target: &Target,
        claims: &[Claim],
        progress: &WaveProgress,
    ) -> Result<DispatchReport, RegistryError> {
        if claims.is_empty() {
            return Ok(DispatchReport::default());
        }
        let subscribers = self.registry.subscribers_of(&target.address).await?;
        let subscriber_count = subscribers.len();

        let sends = subscribers
            .into_iter()
            .map(|sub| self.deliver_all(sub, target, claims, progress));
        stream::iter(sends)
            .buffer_unordered(self.max_in_flight)
            .collect::<Vec<()>>()
            .await;

        let report = progress.report();
        debug!(
            target = %target.address,
            subscribers = subscriber_count,
            claims = claims.len(),
            delivered = report.delivered,
            failed = report.failed,
            "dispatch finished"
        );
        Ok(report)
    }

    async fn deliver_all(&self, sub: Profile, target: &Target, claims: &[Claim], progress: &WaveProgress) {
        for (index, claim) in claims.iter().enumerate() {
            let message = render_claim_alert(claim, target, &sub);
            progress.begin(index);
            match self.send_one(&sub.delivery_address, &message).await {
                Ok(()) => progress.delivered(),
                Err(e) => {
                    warn!(
                        subscriber = %sub.subscriber_id,
                        claim = %claim.claim_id,
                        error = %e,
                        "alert delivery failed"
                    );
                }
            }
        }
    }

    async fn send_one(&self, delivery_address: &str, message: &str) -> Result<(), DeliveryError> {
        match tokio::time::timeout(self.send_timeout, self.channel.send(delivery_address, message)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
        }
    }
}
