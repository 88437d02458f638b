use crate::config::ClassifyConfig;
use crate::ledger::ActivityDetail;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("activity {id} is ambiguous: {reason}")]
    Ambiguous { id: String, reason: &'static str },
}

/// Why an entry was not a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Failed,
    NotAuthorizer,
    NoFeeProgram,
    NoCredit,
}

/// Raw evidence behind a positive classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmountEvidence {
    pub fee_program: String,
    /// Account with the largest positive lamport delta.
    pub credited_account: String,
    pub credited_lamports: i64,
    /// Net lamport delta of the target itself (fees included).
    pub target_delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Claim(AmountEvidence),
    NotClaim(Rejection),
}

/// Two-predicate fee claim classifier.
///
/// An entry is a claim only if the target authorized it (first account,
/// the fee payer) AND it invoked a fee program while crediting some account
/// by at least `min_balance_delta` lamports.
#[derive(Debug, Clone)]
pub struct Classifier {
    fee_programs: HashSet<String>,
    min_balance_delta: i64,
    token_suffix: String,
}

impl Classifier {
    pub fn new(config: &ClassifyConfig) -> Self {
        Self {
            fee_programs: config.fee_programs.iter().cloned().collect(),
            min_balance_delta: config.min_balance_delta.max(1) as i64,
            token_suffix: config.token_suffix.clone(),
        }
    }

    pub fn classify(&self, target: &str, detail: &ActivityDetail) -> Result<Verdict, ClassifyError> {
        if detail.failed {
            return Ok(Verdict::NotClaim(Rejection::Failed));
        }
        let ambiguous = |reason| ClassifyError::Ambiguous {
            id: detail.id.clone(),
            reason,
        };
        let Some(fee_payer) = detail.participants.first() else {
            return Err(ambiguous("no participants"));
        };
        let Some(deltas) = &detail.balance_deltas else {
            return Err(ambiguous("balances do not line up with accounts"));
        };
        if detail.occurred_at.is_none() {
            return Err(ambiguous("no block time"));
        }

        if fee_payer != target {
            return Ok(Verdict::NotClaim(Rejection::NotAuthorizer));
        }
        let Some(fee_program) = detail
            .programs_involved
            .iter()
            .find(|p| self.fee_programs.contains(p.as_str()))
        else {
            return Ok(Verdict::NotClaim(Rejection::NoFeeProgram));
        };
        let Some(credited) = deltas
            .iter()
            .filter(|d| d.delta >= self.min_balance_delta)
            .max_by_key(|d| d.delta)
        else {
            return Ok(Verdict::NotClaim(Rejection::NoCredit));
        };

        let target_delta = deltas
            .iter()
            .find(|d| d.account == target)
            .map_or(0, |d| d.delta);

        Ok(Verdict::Claim(AmountEvidence {
            fee_program: fee_program.clone(),
            credited_account: credited.account.clone(),
            credited_lamports: credited.delta,
            target_delta,
        }))
    }

    /// Best guess at the launchpad token a claim was for.
    pub fn token_of(&self, detail: &ActivityDetail) -> Option<String> {
        let suffixed = |s: &&String| !self.token_suffix.is_empty() && s.ends_with(&self.token_suffix);
        detail
            .token_mints
            .iter()
            .find(suffixed)
            .or_else(|| detail.participants.iter().find(suffixed))
            .or_else(|| detail.token_mints.first())
            .cloned()
    }
}
