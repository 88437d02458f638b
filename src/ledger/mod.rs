//! On-chain activity source.
//!
//! Two calls, mirroring what the chain exposes: a newest-first list of
//! activity ids touching an address, and the decoded detail of one id.

mod solana;

pub use solana::SolanaRpc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ledger RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("ledger returned status {0}")]
    Status(reqwest::StatusCode),
}

/// One row of an address's recent activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    /// Transaction signature. Stable across refetches.
    pub id: String,
    /// Block time, unix seconds, when the node knows it.
    pub occurred_at: Option<i64>,
    /// The transaction executed but failed.
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDelta {
    pub account: String,
    /// post - pre, lamports.
    pub delta: i64,
}

/// Decoded transaction as far as claim classification needs it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityDetail {
    pub id: String,
    /// All accounts in message order; index 0 is the fee payer.
    pub participants: Vec<String>,
    /// One entry per participant, or None when the balance arrays did
    /// not line up with the account list.
    pub balance_deltas: Option<Vec<BalanceDelta>>,
    /// Program ids invoked at any depth.
    pub programs_involved: Vec<String>,
    pub occurred_at: Option<i64>,
    pub failed: bool,
    /// Token mints seen in token balance changes.
    pub token_mints: Vec<String>,
}

#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Newest first, at most `limit` entries.
    async fn recent_activity(&self, address: &str, limit: usize) -> Result<Vec<ActivityEntry>, LedgerError>;

    /// `Ok(None)` when the node does not (yet) know the id.
    async fn fetch_detail(&self, activity_id: &str) -> Result<Option<ActivityDetail>, LedgerError>;
}
