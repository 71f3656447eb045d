//! Intent commitment hashing
//!
//! The intent hash is the idempotency key for relay submission and the
//! commitment the settlement side checks against:
//! keccak256(abi.encode(sender, recipient, amount, nonce, expiry, destinationChainId))
//!
//! All values are encoded as 32-byte words in big-endian format.

use alloy::primitives::Address;
use tiny_keccak::{Hasher, Keccak};

use crate::error::TransferError;
use crate::types::TransferIntent;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Hash a transfer intent after checking it can be committed at `now` (unix seconds).
pub fn hash_intent(intent: &TransferIntent, now: u64) -> Result<[u8; 32], TransferError> {
    if intent.amount.is_zero() {
        return Err(TransferError::InvalidIntent("amount must be greater than zero".into()));
    }
    if intent.expiry <= now {
        return Err(TransferError::InvalidIntent(format!(
            "expiry {} is not in the future (now {})",
            intent.expiry, now
        )));
    }
    if intent.recipient == Address::ZERO {
        return Err(TransferError::InvalidIntent("recipient is the zero address".into()));
    }
    Ok(compute_intent_hash(intent))
}

/// Raw commitment over the six intent fields, no validation.
pub fn compute_intent_hash(intent: &TransferIntent) -> [u8; 32] {
    // abi.encode layout: 6 words * 32 bytes = 192 bytes
    let mut data = [0u8; 192];

    // Word 0: sender (address, left-padded)
    data[12..32].copy_from_slice(intent.sender.as_slice());

    // Word 1: recipient (address, left-padded)
    data[32 + 12..64].copy_from_slice(intent.recipient.as_slice());

    // Word 2: amount (uint256)
    data[64..96].copy_from_slice(&intent.amount.to_be_bytes::<32>());

    // Word 3: nonce (uint256, but we only use u64)
    data[96 + 24..128].copy_from_slice(&intent.nonce.to_be_bytes());

    // Word 4: expiry (uint256, unix seconds)
    data[128 + 24..160].copy_from_slice(&intent.expiry.to_be_bytes());

    // Word 5: destinationChainId (uint256, but we only use u64)
    data[160 + 24..192].copy_from_slice(&intent.destination_chain_id.to_be_bytes());

    keccak256(&data)
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}
