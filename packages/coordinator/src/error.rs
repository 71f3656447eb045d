//! Error taxonomy for the transfer pipeline
//!
//! Every component seam returns [`TransferError`]. The variant tells the caller
//! whether any side effect may already have happened and whether a retry is safe.

use alloy::primitives::U256;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::types::TransferStatus;

/// Longest relay/chain detail echoed back to users.
pub const MAX_DETAIL_LEN: usize = 256;

/// Which rolling window rejected a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    User,
    Global,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::User => write!(f, "user"),
            LimitScope::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    /// Bad input, nothing has happened yet
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    /// No reservation was taken
    #[error("{scope} transfer limit exceeded, remaining headroom {remaining}")]
    LimitExceeded { scope: LimitScope, remaining: U256 },

    #[error("permit signing failed: {0}")]
    Signing(String),

    /// Fee-payer declined the submission; no on-chain effect
    #[error("relay rejected submission: {0}")]
    RelayRejected(String),

    /// On-chain effect unknown, resolve through idempotent re-submission only
    #[error("relay did not answer within {0:?}")]
    RelayTimeout(Duration),

    #[error("relay unavailable after {attempts} attempts: {detail}")]
    RelayUnavailable { attempts: u32, detail: String },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("challenge window still open for {remaining_secs}s")]
    ChallengeWindowOpen { remaining_secs: i64 },

    #[error("transfer {0} not found")]
    NotFound(String),

    #[error("status store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("chain rpc error: {0}")]
    Chain(String),
}

impl TransferError {
    /// Transient failures that the local retry loop may repeat as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::RelayTimeout(_)
                | TransferError::StoreUnavailable(_)
                | TransferError::Chain(_)
        )
    }

    /// Short label used for metrics and API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Validation(_) => "validation",
            TransferError::InvalidIntent(_) => "invalid_intent",
            TransferError::LimitExceeded { .. } => "limit_exceeded",
            TransferError::Signing(_) => "signing",
            TransferError::RelayRejected(_) => "relay_rejected",
            TransferError::RelayTimeout(_) => "relay_timeout",
            TransferError::RelayUnavailable { .. } => "relay_unavailable",
            TransferError::InvalidTransition { .. } => "invalid_transition",
            TransferError::ChallengeWindowOpen { .. } => "challenge_window_open",
            TransferError::NotFound(_) => "not_found",
            TransferError::StoreUnavailable(_) => "store_unavailable",
            TransferError::Chain(_) => "chain",
        }
    }

    /// Status code the HTTP API answers with
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::Validation(_) | TransferError::InvalidIntent(_) => 400,
            TransferError::NotFound(_) => 404,
            TransferError::InvalidTransition { .. }
            | TransferError::ChallengeWindowOpen { .. } => 409,
            TransferError::RelayRejected(_) => 422,
            TransferError::LimitExceeded { .. } => 429,
            TransferError::Signing(_) => 500,
            TransferError::Chain(_) => 502,
            TransferError::RelayUnavailable { .. } | TransferError::StoreUnavailable(_) => 503,
            TransferError::RelayTimeout(_) => 504,
        }
    }

    pub fn store(err: impl fmt::Display) -> Self {
        TransferError::StoreUnavailable(truncate_detail(&err.to_string()))
    }

    pub fn chain(err: impl fmt::Display) -> Self {
        TransferError::Chain(truncate_detail(&err.to_string()))
    }
}

/// Cut an upstream error message down to [`MAX_DETAIL_LEN`] characters.
pub fn truncate_detail(detail: &str) -> String {
    let trimmed = detail.trim();
    if trimmed.chars().count() <= MAX_DETAIL_LEN {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_DETAIL_LEN).collect();
    out.push('…');
    out
}
