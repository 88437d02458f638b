//! Per-target monitoring state.
//!
//!   cursor:{address} → JSON Cursor
//!
//! A cursor belongs to one generation of a target (see `registry`). Reading
//! or writing with a different generation treats the stored cursor as
//! absent, so a target that was dropped and re-created starts over at zero
//! even if its purge was lost.

use crate::kv::{self, KvError, KvStore, Mutation, UpdateError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CursorError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("corrupt cursor for {target}: {reason}")]
    Corrupt { target: String, reason: String },
    #[error("cursor for {target} still contended after {attempts} attempts")]
    Contended { target: String, attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub generation: String,
    /// Event-time watermark (unix seconds) of the newest activity inspected.
    pub last_checked_at: i64,
    /// Wall-clock time (unix seconds) of the last successful fetch.
    #[serde(default)]
    pub last_polled_at: i64,
    /// claim_id → occurred_at of every claim already alerted on.
    #[serde(default)]
    pub notified: BTreeMap<String, i64>,
}

impl Cursor {
    fn fresh(generation: &str) -> Self {
        Self {
            generation: generation.to_string(),
            ..Self::default()
        }
    }

    pub fn is_notified(&self, claim_id: &str) -> bool {
        self.notified.contains_key(claim_id)
    }
}

/// Everything one target's pipeline writes back after dispatch.
#[derive(Debug, Clone, Default)]
pub struct CursorCommit {
    pub watermark: Option<i64>,
    pub notified: Vec<(String, i64)>,
    pub polled_at: i64,
}

#[derive(Clone)]
pub struct CursorStore {
    kv: Arc<dyn KvStore>,
    min_interval: Duration,
    rescan_overlap: i64,
}

fn cursor_key(target: &str) -> String {
    format!("cursor:{}", target)
}

impl CursorStore {
    pub fn new(kv: Arc<dyn KvStore>, min_interval: Duration, rescan_overlap_secs: i64) -> Self {
        Self {
            kv,
            min_interval,
            rescan_overlap: rescan_overlap_secs.max(0),
        }
    }

    pub fn rescan_overlap(&self) -> i64 {
        self.rescan_overlap
    }

    /// Cursor for `target` in `generation`, or a zeroed one.
    pub async fn get(&self, target: &str, generation: &str) -> Result<Cursor, CursorError> {
        let key = cursor_key(target);
        let stored: Option<Cursor> = kv::get_json(self.kv.as_ref(), &key)
            .await
            .map_err(|e| self.map_err(target, e))?;
        Ok(match stored {
            Some(cursor) if cursor.generation == generation => cursor,
            _ => Cursor::fresh(generation),
        })
    }

    /// True when the target was polled less than `min_interval` ago, in
    /// which case detection must not touch the upstream source.
    pub fn is_quiescent(&self, cursor: &Cursor, now: i64) -> bool {
        let window = self.min_interval.as_secs() as i64;
        window > 0 && cursor.last_polled_at > 0 && now - cursor.last_polled_at < window
    }

    /// `last_checked_at = max(current, watermark)`. Lower values are ignored.
    pub async fn advance(
        &self,
        target: &str,
        generation: &str,
        watermark: i64,
    ) -> Result<i64, CursorError> {
        self.commit(
            target,
            generation,
            CursorCommit {
                watermark: Some(watermark),
                ..CursorCommit::default()
            },
        )
        .await
        .map(|c| c.last_checked_at)
    }

    /// Union `claims` into the notified set. Idempotent.
    pub async fn mark_notified(
        &self,
        target: &str,
        generation: &str,
        claims: &[(String, i64)],
    ) -> Result<(), CursorError> {
        self.commit(
            target,
            generation,
            CursorCommit {
                notified: claims.to_vec(),
                ..CursorCommit::default()
            },
        )
        .await
        .map(|_| ())
    }

    /// Apply watermark, notified ids and poll time in a single swap, then
    /// prune ids that have fallen behind the rescan window.
    pub async fn commit(
        &self,
        target: &str,
        generation: &str,
        update: CursorCommit,
    ) -> Result<Cursor, CursorError> {
        let key = cursor_key(target);
        let overlap = self.rescan_overlap;

        kv::update_json(self.kv.as_ref(), &key, |stored: Option<Cursor>| {
            let mut cursor = match stored {
                Some(c) if c.generation == generation => c,
                _ => Cursor::fresh(generation),
            };
            if let Some(watermark) = update.watermark {
                cursor.last_checked_at = cursor.last_checked_at.max(watermark);
            }
            cursor.last_polled_at = cursor.last_polled_at.max(update.polled_at);
            for (id, occurred_at) in &update.notified {
                cursor.notified.entry(id.clone()).or_insert(*occurred_at);
            }
            // Detection drops entries at or before the cutoff before it
            // looks at ids, so anything older can no longer repeat.
            let cutoff = cursor.last_checked_at - overlap;
            cursor.notified.retain(|_, occurred_at| *occurred_at >= cutoff);
            Mutation::Put(cursor.clone(), cursor)
        })
        .await
        .map_err(|e| self.map_err(target, e))
    }

    /// Delete the cursor. With `Some(generation)` only that generation's
    /// cursor is removed, so a purge racing a re-subscribe cannot wipe the
    /// new generation's state.
    pub async fn purge(&self, target: &str, generation: Option<&str>) -> Result<bool, CursorError> {
        let key = cursor_key(target);
        let purged = kv::update_json(self.kv.as_ref(), &key, |stored: Option<Cursor>| match stored {
            Some(c) if generation.map_or(true, |g| g == c.generation) => Mutation::Delete(true),
            _ => Mutation::Keep(false),
        })
        .await
        .map_err(|e| self.map_err(target, e))?;
        if purged {
            debug!(target = %target, "cursor purged");
        }
        Ok(purged)
    }

    fn map_err(&self, target: &str, err: UpdateError) -> CursorError {
        match err {
            UpdateError::Kv(e) => CursorError::Kv(e),
            UpdateError::Corrupt { source, .. } => CursorError::Corrupt {
                target: target.to_string(),
                reason: source.to_string(),
            },
            UpdateError::Contended { attempts, .. } => CursorError::Contended {
                target: target.to_string(),
                attempts,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn store(overlap: i64) -> CursorStore {
        CursorStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(30), overlap)
    }

    #[tokio::test]
    async fn test_absent_cursor_defaults_to_zero() {
        let cursors = store(0);
        let cursor = cursors.get("W", "g1").await.unwrap();
        assert_eq!(cursor.last_checked_at, 0);
        assert!(cursor.notified.is_empty());
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let cursors = store(0);
        assert_eq!(cursors.advance("W", "g1", 100).await.unwrap(), 100);
        // An out-of-order check reporting an older watermark is ignored.
        assert_eq!(cursors.advance("W", "g1", 40).await.unwrap(), 100);
        assert_eq!(cursors.advance("W", "g1", 150).await.unwrap(), 150);
        assert_eq!(cursors.get("W", "g1").await.unwrap().last_checked_at, 150);
    }

    #[tokio::test]
    async fn test_mark_notified_is_idempotent() {
        let cursors = store(0);
        let claims = vec![("X".to_string(), 10)];
        cursors.mark_notified("W", "g1", &claims).await.unwrap();
        cursors.mark_notified("W", "g1", &claims).await.unwrap();
        let cursor = cursors.get("W", "g1").await.unwrap();
        assert_eq!(cursor.notified.len(), 1);
        assert!(cursor.is_notified("X"));
    }

    #[tokio::test]
    async fn test_other_generation_reads_fresh() {
        let cursors = store(0);
        cursors.advance("W", "old", 500).await.unwrap();
        assert_eq!(cursors.get("W", "new").await.unwrap().last_checked_at, 0);
        // Writing under the new generation replaces the stale cursor.
        cursors.advance("W", "new", 20).await.unwrap();
        assert_eq!(cursors.get("W", "new").await.unwrap().last_checked_at, 20);
        assert_eq!(cursors.get("W", "old").await.unwrap().last_checked_at, 0);
    }

    #[tokio::test]
    async fn test_purge_respects_generation() {
        let cursors = store(0);
        cursors.advance("W", "g2", 500).await.unwrap();
        assert!(!cursors.purge("W", Some("g1")).await.unwrap());
        assert_eq!(cursors.get("W", "g2").await.unwrap().last_checked_at, 500);
        assert!(cursors.purge("W", Some("g2")).await.unwrap());
        assert_eq!(cursors.get("W", "g2").await.unwrap().last_checked_at, 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_rescan_window() {
        let cursors = store(60);
        let claims = vec![("old".to_string(), 100), ("edge".to_string(), 940), ("new".to_string(), 990)];
        let cursor = cursors
            .commit(
                "W",
                "g1",
                CursorCommit {
                    watermark: Some(1000),
                    notified: claims,
                    polled_at: 5,
                },
            )
            .await
            .unwrap();
        // cutoff = 1000 - 60 = 940; only ids older than it are dropped.
        assert_eq!(cursor.notified.keys().collect::<Vec<_>>(), vec!["edge", "new"]);
        assert_eq!(cursor.last_polled_at, 5);
    }

    #[test]
    fn test_quiescence_window() {
        let cursors = store(0);
        let mut cursor = Cursor::fresh("g1");
        assert!(!cursors.is_quiescent(&cursor, 1_000));
        cursor.last_polled_at = 990;
        assert!(cursors.is_quiescent(&cursor, 1_000));
        assert!(!cursors.is_quiescent(&cursor, 1_020));
    }
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_advances_keep_the_maximum() {
        let cursors = store(0);
        let mut tasks = Vec::new();
        for i in 0..16i64 {
            let cursors = cursors.clone();
            tasks.push(tokio::spawn(async move {
                // Interleave rising and falling watermarks across writers.
                for step in 0..8i64 {
                    let watermark = if (i + step) % 2 == 0 {
                        1_000 + i * 10 + step
                    } else {
                        500 - i - step
                    };
                    loop {
                        match cursors.advance("W", "g1", watermark).await {
                            Ok(_) => break,
                            Err(CursorError::Contended { .. }) => continue,
                            Err(e) => panic!("advance failed: {}", e),
                        }
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Largest watermark written: i = 15, step = 7 gives 1_000 + 150 + 7.
        let cursor = cursors.get("W", "g1").await.unwrap();
        assert_eq!(cursor.last_checked_at, 1_157);
        assert_eq!(cursor.generation, "g1");
    }
}
