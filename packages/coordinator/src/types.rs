//! Transfer domain types
//!
//! [`TransferIntent`] is built once per request and discarded after it has been
//! hashed and signed. [`TransferRecord`] is the durable document clients read and
//! subscribe to; only the state machine mutates it.

use alloy::primitives::utils::{format_units, parse_units};
use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TransferError;

/// Lifecycle status of a transfer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferStatus {
    /// Intent accepted and lock submission sent to the relay
    Committed,
    /// Relay is moving funds, cross-chain message in flight
    Processing,
    /// Destination credit observed, challenge window running
    Completed,
    /// Challenge window elapsed without a valid challenge
    Finalized,
    Failed,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 5] = [
        TransferStatus::Committed,
        TransferStatus::Processing,
        TransferStatus::Completed,
        TransferStatus::Finalized,
        TransferStatus::Failed,
    ];

    /// Get the status as a lowercase string (storage representation)
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Committed => "committed",
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Finalized => "finalized",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Finalized | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

impl FromStr for TransferStatus {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TransferError::Validation(format!("unknown transfer status '{}'", s)))
    }
}

/// Unsigned description of what a user wants to move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    pub sender: Address,
    pub recipient: Address,
    /// Base units
    pub amount: U256,
    /// Application-level sequence, distinct from the permit nonce
    pub nonce: u64,
    /// Unix seconds
    pub expiry: u64,
    pub destination_chain_id: u64,
}

/// Durable transfer document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: i64,
    /// Lower-case 0x address
    pub user: String,
    pub src_chain_id: i64,
    pub dst_chain_id: i64,
    /// Decimal string of base units
    pub amount: String,
    pub recipient: String,
    pub intent_hash: Option<String>,
    /// Sequence the intent hash was built with; never reused for this user
    pub intent_nonce: Option<i64>,
    pub relay_tx_hash: Option<String>,
    pub status: TransferStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Written once, when the record enters COMPLETED and the challenge window opens
    pub challenge_started_at: Option<DateTime<Utc>>,
    /// Written once, when the record reaches FINALIZED
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    pub fn amount_u256(&self) -> Result<U256, TransferError> {
        U256::from_str_radix(&self.amount, 10)
            .map_err(|e| TransferError::Validation(format!("stored amount unreadable: {}", e)))
    }
}

/// For inserting new transfer records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransfer {
    pub user: String,
    pub src_chain_id: i64,
    pub dst_chain_id: i64,
    pub amount: String,
    pub recipient: String,
    pub intent_hash: Option<String>,
    #[serde(default)]
    pub intent_nonce: Option<i64>,
    pub relay_tx_hash: Option<String>,
    pub status: TransferStatus,
    pub error_message: Option<String>,
}

/// Fields written together with a status change. `None` keeps the stored value;
/// the two timestamps are only ever written once.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: TransferStatus,
    pub relay_tx_hash: Option<String>,
    pub error_message: Option<String>,
    pub challenge_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn to(status: TransferStatus) -> Self {
        Self {
            status,
            relay_tx_hash: None,
            error_message: None,
            challenge_started_at: None,
            completed_at: None,
        }
    }
}

/// Parse a 0x-prefixed 20-byte hex address
pub fn parse_address(raw: &str) -> Result<Address, TransferError> {
    let trimmed = raw.trim();
    if trimmed.len() != 42 || !trimmed.starts_with("0x") {
        return Err(TransferError::Validation(format!(
            "'{}' is not a 0x-prefixed 20-byte address",
            raw
        )));
    }
    Address::from_str(trimmed)
        .map_err(|e| TransferError::Validation(format!("invalid address '{}': {}", raw, e)))
}

/// Lower-case 0x form used as the store key for users
pub fn normalize_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// Parse a human amount ("0.1") into base units
pub fn parse_token_amount(raw: &str, decimals: u8) -> Result<U256, TransferError> {
    if raw.trim().starts_with('-') {
        return Err(TransferError::Validation(format!("amount '{}' is negative", raw)));
    }
    parse_units(raw.trim(), decimals)
        .map(|parsed| parsed.get_absolute())
        .map_err(|e| TransferError::Validation(format!("invalid amount '{}': {}", raw, e)))
}

/// Render base units as a human amount without trailing zeros ("0.1", "25")
pub fn format_token_amount(amount: U256, decimals: u8) -> String {
    let Ok(formatted) = format_units(amount, decimals) else {
        return amount.to_string();
    };
    if !formatted.contains('.') {
        return formatted;
    }
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_as_str() {
        assert_eq!(TransferStatus::Committed.as_str(), "committed");
        assert_eq!(TransferStatus::Processing.as_str(), "processing");
        assert_eq!(TransferStatus::Completed.as_str(), "completed");
        assert_eq!(TransferStatus::Finalized.as_str(), "finalized");
        assert_eq!(TransferStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_status_display_and_parse() {
        assert_eq!(format!("{}", TransferStatus::Committed), "COMMITTED");
        for status in TransferStatus::ALL {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
            assert_eq!(
                status.to_string().parse::<TransferStatus>().unwrap(),
                status
            );
        }
        assert!("reorged".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferStatus::Finalized.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::Completed.is_terminal());
    }

    #[test]
    fn test_parse_address_requires_prefix_and_length() {
        assert!(parse_address("0xdead000000000000000000000000000000000000").is_ok());
        assert!(parse_address("dead000000000000000000000000000000000000").is_err());
        assert!(parse_address("0xdead").is_err());
        assert!(parse_address("0xzz00000000000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_normalize_address_lowercases() {
        let addr = parse_address("0xF39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        assert_eq!(
            normalize_address(&addr),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn test_token_amount_round_trip() {
        let amount = parse_token_amount("0.1", 18).unwrap();
        assert_eq!(amount, U256::from(100_000_000_000_000_000u128));
        assert!(parse_token_amount("abc", 18).is_err());
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let now = Utc::now();
        let record = TransferRecord {
            id: 7,
            user: "0xabc".to_string(),
            src_chain_id: 1,
            dst_chain_id: 56,
            amount: "100".to_string(),
            recipient: "0xdef".to_string(),
            intent_hash: None,
            intent_nonce: Some(3),
            relay_tx_hash: Some("0x01".to_string()),
            status: TransferStatus::Committed,
            error_message: None,
            created_at: now,
            updated_at: now,
            challenge_started_at: None,
            completed_at: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["dstChainId"], 56);
        assert_eq!(json["relayTxHash"], "0x01");
        assert_eq!(json["status"], "COMMITTED");
        assert_eq!(json["intentNonce"], 3);
        assert_eq!(record.amount_u256().unwrap(), U256::from(100u64));
    }

    #[test]
    fn test_format_token_amount_trims() {
        let tenth = parse_token_amount("0.1", 18).unwrap();
        assert_eq!(format_token_amount(tenth, 18), "0.1");
        assert_eq!(format_token_amount(U256::from(25u64) * U256::from(10u64).pow(U256::from(18u64)), 18), "25");
        assert_eq!(format_token_amount(U256::ZERO, 18), "0");
    }

    #[test]
    fn test_negative_amount_rejected() {
        assert!(parse_token_amount("-1", 18).is_err());
    }
}
