//! In-memory fakes for the external collaborators.

use crate::config::{ClassifyConfig, MonitorConfig};
use crate::cursor::CursorStore;
use crate::detect::{AmountEvidence, Claim, Classifier, Detector, DisplayMetadata};
use crate::kv::MemoryStore;
use crate::ledger::{ActivityDetail, ActivityEntry, BalanceDelta, LedgerError, LedgerSource};
use crate::monitor::Monitor;
use crate::notify::{DeliveryError, Dispatcher, NotificationChannel};
use crate::registry::Registry;
use crate::resolver::{HandleResolver, ResolveError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FEE_PROGRAM: &str = "FEEhPbKVKnco9EXnaY3i4R5rQVUx91wgVfu8qokixywi";
const SYSTEM_PROGRAM: &str = "11111111111111111111111111111111";

pub fn memory_registry() -> (Arc<MemoryStore>, Registry) {
    let kv = Arc::new(MemoryStore::new());
    let cursors = CursorStore::new(kv.clone(), Duration::from_secs(30), 0);
    let registry = Registry::new(kv.clone(), Arc::new(StaticResolver::new(&[])), cursors);
    (kv, registry)
}

/// Fully wired monitor over a memory store, no pacing, no rescan overlap.
pub fn memory_monitor(ledger: Arc<ScriptedLedger>, channel: Arc<RecordingChannel>) -> Arc<Monitor> {
    let config = MonitorConfig {
        start_spacing_ms: 0,
        rescan_overlap_secs: 0,
        ..MonitorConfig::default()
    };
    let kv = Arc::new(MemoryStore::new());
    let cursors = CursorStore::new(kv.clone(), config.min_interval(), config.rescan_overlap_secs);
    let registry = Registry::new(kv, Arc::new(StaticResolver::new(&[])), cursors.clone());
    let detector = Detector::new(ledger, Classifier::new(&ClassifyConfig::default()), 20, 0);
    let dispatcher = Dispatcher::new(registry.clone(), channel, config.delivery_timeout(), 4);
    Arc::new(Monitor::new(registry, cursors, detector, Some(dispatcher), config))
}

// --- Resolver ---

#[derive(Default)]
pub struct StaticResolver {
    table: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            table: Mutex::new(entries.iter().map(|(h, a)| (h.to_string(), a.to_string())).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, handle: &str, address: &str) {
        self.table.lock().unwrap().insert(handle.to_string(), address.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandleResolver for StaticResolver {
    async fn resolve(&self, handle: &str) -> Result<String, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.table
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(handle.to_string()))
    }
}

// --- Ledger ---

pub type ScriptedTx = (ActivityEntry, Option<ActivityDetail>);

fn tx(id: &str, payer: &str, at: i64, programs: &[&str]) -> ScriptedTx {
    let participants = vec![payer.to_string(), format!("Vault{}", id), SYSTEM_PROGRAM.to_string()];
    let deltas = [-5_000, 1_000_000, 0];
    let detail = ActivityDetail {
        id: id.to_string(),
        balance_deltas: Some(
            participants
                .iter()
                .zip(deltas)
                .map(|(account, delta)| BalanceDelta {
                    account: account.clone(),
                    delta,
                })
                .collect(),
        ),
        participants,
        programs_involved: programs.iter().map(|p| p.to_string()).collect(),
        occurred_at: Some(at),
        failed: false,
        token_mints: vec![format!("Mint{}BAGS", id)],
    };
    let entry = ActivityEntry {
        id: id.to_string(),
        occurred_at: Some(at),
        failed: false,
    };
    (entry, Some(detail))
}

/// A transaction `payer` signed that went through the fee program.
pub fn claim_tx(id: &str, payer: &str, at: i64) -> ScriptedTx {
    tx(id, payer, at, &[SYSTEM_PROGRAM, FEE_PROGRAM])
}

/// An ordinary transfer.
pub fn plain_tx(id: &str, payer: &str, at: i64) -> ScriptedTx {
    tx(id, payer, at, &[SYSTEM_PROGRAM])
}

pub fn sample_claim(id: &str, target: &str, at: i64) -> Claim {
    Claim {
        claim_id: id.to_string(),
        target: target.to_string(),
        occurred_at: at,
        evidence: AmountEvidence {
            fee_program: FEE_PROGRAM.to_string(),
            credited_account: target.to_string(),
            credited_lamports: 1_000_000,
            target_delta: 995_000,
        },
        display: DisplayMetadata {
            token: None,
            signature: id.to_string(),
        },
    }
}

/// Ledger that serves whatever was pushed for an address, newest first in
/// push order.
#[derive(Default)]
pub struct ScriptedLedger {
    activity: Mutex<HashMap<String, Vec<ScriptedTx>>>,
    failing_activity: Mutex<HashSet<String>>,
    failing_detail: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    activity_calls: AtomicUsize,
    detail_calls: AtomicUsize,
}

impl ScriptedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, address: &str, tx: ScriptedTx) {
        self.activity
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(tx);
    }

    pub fn replace(&self, address: &str, txs: Vec<ScriptedTx>) {
        self.activity.lock().unwrap().insert(address.to_string(), txs);
    }

    pub fn fail_activity(&self, address: &str) {
        self.failing_activity.lock().unwrap().insert(address.to_string());
    }

    pub fn fail_detail(&self, id: &str) {
        self.failing_detail.lock().unwrap().insert(id.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn activity_calls(&self) -> usize {
        self.activity_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    fn unavailable() -> LedgerError {
        LedgerError::Rpc {
            code: -32005,
            message: "node unavailable".to_string(),
        }
    }
}

#[async_trait]
impl LedgerSource for ScriptedLedger {
    async fn recent_activity(&self, address: &str, limit: usize) -> Result<Vec<ActivityEntry>, LedgerError> {
        self.activity_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_activity.lock().unwrap().contains(address) {
            return Err(Self::unavailable());
        }
        Ok(self
            .activity
            .lock()
            .unwrap()
            .get(address)
            .map(|txs| txs.iter().take(limit).map(|(e, _)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn fetch_detail(&self, activity_id: &str) -> Result<Option<ActivityDetail>, LedgerError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_detail.lock().unwrap().contains(activity_id) {
            return Err(Self::unavailable());
        }
        let activity = self.activity.lock().unwrap();
        Ok(activity
            .values()
            .flatten()
            .find(|(e, _)| e.id == activity_id)
            .and_then(|(_, d)| d.clone()))
    }
}

// --- Notification channel ---

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    attempts: AtomicUsize,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, delivery_address: &str) {
        self.failing.lock().unwrap().insert(delivery_address.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful sends, in order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn delivered_to(&self) -> Vec<String> {
        self.sent().into_iter().map(|(to, _)| to).collect()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send(&self, delivery_address: &str, message: &str) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(delivery_address) {
            return Err(DeliveryError::Rejected {
                status: 403,
                description: "Forbidden: bot was blocked by the user".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((delivery_address.to_string(), message.to_string()));
        Ok(())
    }
}
