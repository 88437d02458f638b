//! Intent journal for registry mutations.
//!
//! Each subscribe/unsubscribe is written to `registry:pending` before the
//! first index is touched and removed after the last one. An entry that
//! outlives its writer marks a pair whose indices may disagree.

use super::{Registry, RegistryError};
use crate::kv::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PENDING: &str = "registry:pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentOp {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub op: IntentOp,
    pub subscriber_id: String,
    pub target: String,
    pub op_id: String,
    /// Unix seconds.
    pub started_at: i64,
}

impl Intent {
    pub fn new(op: IntentOp, subscriber_id: &str, target: &str) -> Self {
        Self {
            op,
            subscriber_id: subscriber_id.to_string(),
            target: target.to_string(),
            op_id: uuid::Uuid::new_v4().to_string(),
            started_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub pending: usize,
    pub replayed: usize,
    /// Entries too young to touch; their writer may still be running.
    pub in_flight: usize,
    pub unreadable: usize,
}

#[derive(Clone)]
pub(super) struct Journal {
    kv: Arc<dyn KvStore>,
}

impl Journal {
    pub(super) fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Record an intent. Returns the stored member, needed to clear it.
    pub(super) async fn record(&self, intent: &Intent) -> Result<String, RegistryError> {
        let entry = serde_json::to_string(intent).map_err(|e| RegistryError::Corrupt {
            key: PENDING.to_string(),
            reason: e.to_string(),
        })?;
        self.kv.add_to_set(PENDING, &entry).await?;
        Ok(entry)
    }

    pub(super) async fn clear(&self, entry: &str) -> Result<(), RegistryError> {
        self.kv.remove_from_set(PENDING, entry).await?;
        Ok(())
    }

    pub(super) async fn pending(&self) -> Result<Vec<(String, Option<Intent>)>, RegistryError> {
        let members = self.kv.members_of(PENDING).await?;
        Ok(members
            .into_iter()
            .map(|raw| {
                let intent = serde_json::from_str(&raw).ok();
                (raw, intent)
            })
            .collect())
    }
}

impl Registry {
    /// Roll forward every intent older than `stale_after`.
    ///
    /// An unsubscribe is completed. A subscribe is completed if its forward
    /// edge landed and otherwise dropped, since the caller never saw it
    /// succeed. Either way the reverse index ends up matching the forward.
    pub async fn reconcile(&self, stale_after: Duration, now: i64) -> Result<ReconcileReport, RegistryError> {
        let pending = self.journal.pending().await?;
        let mut report = ReconcileReport {
            pending: pending.len(),
            ..ReconcileReport::default()
        };

        for (raw, intent) in pending {
            let Some(intent) = intent else {
                warn!(entry = %raw, "dropping unreadable journal entry");
                self.journal.clear(&raw).await?;
                report.unreadable += 1;
                continue;
            };
            if now - intent.started_at < stale_after.as_secs() as i64 {
                report.in_flight += 1;
                continue;
            }

            if intent.op == IntentOp::Unsubscribe {
                self.remove_forward(&intent.subscriber_id, &intent.target).await?;
            }
            self.sync_edge(&intent.subscriber_id, &intent.target).await?;
            self.journal.clear(&raw).await?;

            info!(
                op = ?intent.op,
                subscriber = %intent.subscriber_id,
                target = %intent.target,
                op_id = %intent.op_id,
                "replayed journal entry"
            );
            report.replayed += 1;
        }
        Ok(report)
    }

    /// Make the reverse index and watch set agree with the forward record
    /// for one (subscriber, target) pair.
    pub(super) async fn sync_edge(&self, subscriber_id: &str, address: &str) -> Result<(), RegistryError> {
        let subscription = self
            .subscriber(subscriber_id)
            .await?
            .and_then(|rec| rec.subscriptions.get(address).cloned());

        match subscription {
            Some(sub) => {
                self.add_reverse(subscriber_id, address, sub.handle.as_deref())
                    .await?;
                self.kv.add_to_set(super::WATCHED_TARGETS, address).await?;
            }
            None => {
                self.remove_reverse(subscriber_id, address).await?;
            }
        }
        Ok(())
    }
}
