//! Claim detection for one target.
//!
//! Fetch a bounded window of recent activity, drop what the cursor already
//! covers, classify the rest and return the claims not yet alerted on,
//! oldest first. The window is re-scanned `rescan_overlap` seconds behind
//! the watermark because the ledger can surface recent entries late; the
//! notified set, not the timestamp, is what prevents repeats.

mod classify;

pub use classify::{AmountEvidence, ClassifyError, Classifier, Rejection, Verdict};

use crate::cursor::Cursor;
use crate::ledger::{LedgerError, LedgerSource};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("activity fetch failed: {0}")]
    Fetch(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayMetadata {
    pub token: Option<String>,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claim {
    /// The transaction signature: identical on every refetch.
    pub claim_id: String,
    pub target: String,
    pub occurred_at: i64,
    pub evidence: AmountEvidence,
    pub display: DisplayMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub claims: Vec<Claim>,
    /// Newest timestamp in the fetched window; None when it was empty.
    pub newest_seen: Option<i64>,
    pub entries_fetched: usize,
    pub details_fetched: usize,
    pub ambiguous: usize,
}

#[derive(Clone)]
pub struct Detector {
    ledger: Arc<dyn LedgerSource>,
    classifier: Classifier,
    activity_limit: usize,
    rescan_overlap: i64,
}

impl Detector {
    pub fn new(
        ledger: Arc<dyn LedgerSource>,
        classifier: Classifier,
        activity_limit: usize,
        rescan_overlap_secs: i64,
    ) -> Self {
        Self {
            ledger,
            classifier,
            activity_limit: activity_limit.max(1),
            rescan_overlap: rescan_overlap_secs.max(0),
        }
    }

    /// Any ledger error (list or detail) fails the whole target so the
    /// cursor stays where it was.
    pub async fn detect(&self, address: &str, cursor: &Cursor) -> Result<Detection, DetectError> {
        let entries = self.ledger.recent_activity(address, self.activity_limit).await?;
        let mut detection = Detection {
            newest_seen: entries.iter().filter_map(|e| e.occurred_at).max(),
            entries_fetched: entries.len(),
            ..Detection::default()
        };
        let cutoff = cursor.last_checked_at - self.rescan_overlap;

        for entry in &entries {
            if entry.occurred_at.is_some_and(|t| t <= cutoff) {
                continue;
            }
            // claim_id is the entry id, so dedup can run before the detail fetch.
            if entry.failed || cursor.is_notified(&entry.id) {
                continue;
            }

            detection.details_fetched += 1;
            let Some(detail) = self.ledger.fetch_detail(&entry.id).await? else {
                debug!(target = %address, id = %entry.id, "detail not available");
                detection.ambiguous += 1;
                continue;
            };

            match self.classifier.classify(address, &detail) {
                Ok(Verdict::Claim(evidence)) => {
                    let occurred_at = detail.occurred_at.or(entry.occurred_at).unwrap_or_default();
                    if occurred_at <= cutoff {
                        continue;
                    }
                    detection.claims.push(Claim {
                        claim_id: entry.id.clone(),
                        target: address.to_string(),
                        occurred_at,
                        evidence,
                        display: DisplayMetadata {
                            token: self.classifier.token_of(&detail),
                            signature: entry.id.clone(),
                        },
                    });
                }
                Ok(Verdict::NotClaim(reason)) => {
                    debug!(target = %address, id = %entry.id, ?reason, "not a claim");
                }
                Err(e) => {
                    debug!(target = %address, error = %e, "skipping entry");
                    detection.ambiguous += 1;
                }
            }
        }

        detection.claims.reverse();
        Ok(detection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifyConfig;
    use crate::testing::{claim_tx, plain_tx, ScriptedLedger};

    const W: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    fn detector(ledger: Arc<ScriptedLedger>, overlap: i64) -> Detector {
        Detector::new(ledger, Classifier::new(&ClassifyConfig::default()), 20, overlap)
    }

    fn cursor(last_checked_at: i64, notified: &[(&str, i64)]) -> Cursor {
        Cursor {
            generation: "g".into(),
            last_checked_at,
            last_polled_at: 0,
            notified: notified.iter().map(|(id, t)| (id.to_string(), *t)).collect(),
        }
    }

    #[tokio::test]
    async fn test_one_claim_among_three_entries() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.push(W, claim_tx("X", W, 300));
        ledger.push(W, plain_tx("Y", "Someone", 200));
        ledger.push(W, plain_tx("Z", W, 100));

        let d = detector(ledger.clone(), 0).detect(W, &cursor(0, &[])).await.unwrap();
        assert_eq!(d.claims.len(), 1);
        assert_eq!(d.claims[0].claim_id, "X");
        assert_eq!(d.claims[0].occurred_at, 300);
        assert_eq!(d.newest_seen, Some(300));
        assert_eq!(d.entries_fetched, 3);
    }

    #[tokio::test]
    async fn test_entries_behind_watermark_are_not_fetched() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.push(W, claim_tx("new", W, 500));
        ledger.push(W, claim_tx("old", W, 400));

        let d = detector(ledger.clone(), 0).detect(W, &cursor(400, &[])).await.unwrap();
        assert_eq!(d.claims.iter().map(|c| c.claim_id.as_str()).collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(ledger.detail_calls(), 1);
        // Window was non-empty: watermark can still move.
        assert_eq!(d.newest_seen, Some(500));
    }

    #[tokio::test]
    async fn test_notified_claim_reappearing_is_not_returned() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.push(W, claim_tx("X", W, 300));

        // Late-visible entry inside the overlap window, already alerted.
        let d = detector(ledger.clone(), 120)
            .detect(W, &cursor(350, &[("X", 300)]))
            .await
            .unwrap();
        assert!(d.claims.is_empty());
        assert_eq!(ledger.detail_calls(), 0);
    }

    #[tokio::test]
    async fn test_late_claim_inside_overlap_is_found() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.push(W, claim_tx("late", W, 300));

        let d = detector(ledger, 120).detect(W, &cursor(350, &[])).await.unwrap();
        assert_eq!(d.claims.len(), 1);
    }

    #[tokio::test]
    async fn test_claims_come_back_oldest_first() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.push(W, claim_tx("B", W, 20));
        ledger.push(W, claim_tx("A", W, 10));
        let d = detector(ledger, 0).detect(W, &cursor(0, &[])).await.unwrap();
        assert_eq!(d.claims.iter().map(|c| c.claim_id.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_empty_window() {
        let ledger = Arc::new(ScriptedLedger::new());
        let d = detector(ledger, 0).detect(W, &cursor(0, &[])).await.unwrap();
        assert!(d.claims.is_empty());
        assert_eq!(d.newest_seen, None);
    }

    #[tokio::test]
    async fn test_detail_failure_fails_the_target() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.push(W, claim_tx("X", W, 300));
        ledger.fail_detail("X");
        let err = detector(ledger, 0).detect(W, &cursor(0, &[])).await.unwrap_err();
        assert!(matches!(err, DetectError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_missing_and_malformed_details_are_counted() {
        let ledger = Arc::new(ScriptedLedger::new());
        let mut broken = claim_tx("M", W, 300);
        broken.1 = broken.1.map(|mut d| {
            d.balance_deltas = None;
            d
        });
        ledger.push(W, broken);
        let mut missing = claim_tx("N", W, 200);
        missing.1 = None;
        ledger.push(W, missing);

        let d = detector(ledger, 0).detect(W, &cursor(0, &[])).await.unwrap();
        assert!(d.claims.is_empty());
        assert_eq!(d.ambiguous, 2);
    }
}
