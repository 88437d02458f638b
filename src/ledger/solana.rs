//! Solana JSON-RPC adapter (public RPC or Helius).

use super::{ActivityDetail, ActivityEntry, BalanceDelta, LedgerError, LedgerSource};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureInfo {
    signature: String,
    #[serde(default)]
    block_time: Option<i64>,
    #[serde(default)]
    err: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionResult {
    #[serde(default)]
    block_time: Option<i64>,
    meta: Option<TransactionMeta>,
    transaction: Option<TransactionBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    pre_balances: Vec<u64>,
    #[serde(default)]
    post_balances: Vec<u64>,
    #[serde(default)]
    inner_instructions: Option<Vec<InnerInstructions>>,
    #[serde(default)]
    post_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    loaded_addresses: Option<LoadedAddresses>,
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    message: Message,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Message {
    account_keys: Vec<String>,
    #[serde(default)]
    instructions: Vec<CompiledInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompiledInstruction {
    program_id_index: usize,
}

#[derive(Debug, Deserialize)]
struct InnerInstructions {
    #[serde(default)]
    instructions: Vec<CompiledInstruction>,
}

#[derive(Debug, Deserialize)]
struct TokenBalance {
    mint: String,
}

#[derive(Debug, Default, Deserialize)]
struct LoadedAddresses {
    #[serde(default)]
    writable: Vec<String>,
    #[serde(default)]
    readonly: Vec<String>,
}

/// JSON-RPC client for `getSignaturesForAddress` / `getTransaction`.
#[derive(Clone)]
pub struct SolanaRpc {
    endpoint: String,
    http: Client,
}

impl SolanaRpc {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            http,
        })
    }

    /// One JSON-RPC call. 429 and 5xx are retried with backoff.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>, LedgerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut delay = Duration::from_millis(500);
        let mut attempt = 1;
        loop {
            let resp = self.http.post(&self.endpoint).json(&body).send().await?;
            let status = resp.status();
            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();

            if status.is_success() {
                let envelope: RpcEnvelope<T> = resp.json().await?;
                if let Some(err) = envelope.error {
                    return Err(LedgerError::Rpc {
                        code: err.code,
                        message: err.message,
                    });
                }
                return Ok(envelope.result);
            }
            if !retryable || attempt >= MAX_ATTEMPTS {
                return Err(LedgerError::Status(status));
            }

            debug!(method, status = %status, attempt, "RPC call failed, retrying");
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }
}

#[async_trait]
impl LedgerSource for SolanaRpc {
    async fn recent_activity(&self, address: &str, limit: usize) -> Result<Vec<ActivityEntry>, LedgerError> {
        let sigs: Option<Vec<SignatureInfo>> = self
            .call("getSignaturesForAddress", json!([address, { "limit": limit }]))
            .await?;
        Ok(sigs
            .unwrap_or_default()
            .into_iter()
            .map(|s| ActivityEntry {
                id: s.signature,
                occurred_at: s.block_time,
                failed: s.err.is_some_and(|e| !e.is_null()),
            })
            .collect())
    }

    async fn fetch_detail(&self, activity_id: &str) -> Result<Option<ActivityDetail>, LedgerError> {
        let tx: Option<TransactionResult> = self
            .call(
                "getTransaction",
                json!([activity_id, { "encoding": "json", "maxSupportedTransactionVersion": 0 }]),
            )
            .await?;
        Ok(tx.map(|tx| decode_transaction(activity_id, tx)))
    }
}

/// Flatten an RPC transaction into an `ActivityDetail`. Gaps (missing meta,
/// mismatched balance arrays) are left visible for the classifier to judge.
fn decode_transaction(id: &str, tx: TransactionResult) -> ActivityDetail {
    let mut detail = ActivityDetail {
        id: id.to_string(),
        occurred_at: tx.block_time,
        ..ActivityDetail::default()
    };

    let Some(body) = tx.transaction else {
        return detail;
    };
    let message = body.message;

    let mut participants = message.account_keys;
    if let Some(loaded) = tx.meta.as_ref().and_then(|m| m.loaded_addresses.as_ref()) {
        participants.extend(loaded.writable.iter().cloned());
        participants.extend(loaded.readonly.iter().cloned());
    }

    let mut program_indices: Vec<usize> = message.instructions.iter().map(|i| i.program_id_index).collect();

    if let Some(meta) = &tx.meta {
        detail.failed = meta.err.as_ref().is_some_and(|e| !e.is_null());

        if let Some(inner) = &meta.inner_instructions {
            program_indices.extend(inner.iter().flat_map(|set| set.instructions.iter().map(|i| i.program_id_index)));
        }

        if meta.pre_balances.len() == participants.len() && meta.post_balances.len() == participants.len() {
            detail.balance_deltas = Some(
                participants
                    .iter()
                    .zip(meta.pre_balances.iter().zip(&meta.post_balances))
                    .map(|(account, (pre, post))| BalanceDelta {
                        account: account.clone(),
                        delta: *post as i64 - *pre as i64,
                    })
                    .collect(),
            );
        }

        if let Some(balances) = &meta.post_token_balances {
            for balance in balances {
                if !detail.token_mints.contains(&balance.mint) {
                    detail.token_mints.push(balance.mint.clone());
                }
            }
        }
    }

    for idx in program_indices {
        if let Some(program) = participants.get(idx) {
            if !detail.programs_involved.contains(program) {
                detail.programs_involved.push(program.clone());
            }
        }
    }
    detail.participants = participants;
    detail
}
