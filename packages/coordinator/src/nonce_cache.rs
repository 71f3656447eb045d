//! Per-signer sequence and gas price cache
//!
//! Hands out transaction/intent sequence numbers without a chain round-trip per
//! call. Each signer has its own slot behind its own mutex; the outer map lock is
//! only held to look a slot up. Chain reads never happen while a slot is locked.
//!
//! A signer is seeded from the larger of the chain value and a
//! [`SequenceFloor`], the first sequence not yet used by anything this process
//! (or an earlier run of it) wrote down. After that the counter only moves
//! forward: refresh and resync both take the maximum of what they see, so a
//! sequence is never handed out twice, not even across a restart.

use alloy::primitives::Address;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::chain::ChainRpc;
use crate::error::TransferError;
use crate::metrics;

#[derive(Debug, Default)]
struct SignerSlot {
    next_sequence: Option<u64>,
    reservations: u64,
}

fn lock_slot(slot: &Mutex<SignerSlot>) -> MutexGuard<'_, SignerSlot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A sequence handed out by [`NonceGasCache::try_reserve_local`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reserved {
    pub sequence: u64,
    /// The periodic refresh is due; the caller should run it after leaving
    /// any critical section.
    pub refresh_due: bool,
}

/// Lowest sequence that durable state says is still unused for a signer
#[async_trait]
pub trait SequenceFloor: Send + Sync {
    async fn next_unused(&self, signer: Address) -> Result<u64, TransferError>;
}

pub struct NonceGasCache {
    chain: Arc<dyn ChainRpc>,
    floor: Arc<dyn SequenceFloor>,
    slots: Mutex<HashMap<Address, Arc<Mutex<SignerSlot>>>>,
    last_gas_price: Mutex<Option<u128>>,
    refresh_every: u64,
}

impl NonceGasCache {
    /// `refresh_every == 0` disables the periodic refresh
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        floor: Arc<dyn SequenceFloor>,
        refresh_every: u64,
    ) -> Self {
        Self {
            chain,
            floor,
            slots: Mutex::new(HashMap::new()),
            last_gas_price: Mutex::new(None),
            refresh_every,
        }
    }

    fn slot(&self, signer: Address) -> Arc<Mutex<SignerSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(signer).or_default().clone()
    }

    /// Seed the signer's counter if it has never been seen.
    pub async fn prime(&self, signer: Address) -> Result<(), TransferError> {
        let slot = self.slot(signer);
        if lock_slot(&slot).next_sequence.is_some() {
            return Ok(());
        }

        let chain_nonce = self.chain.get_nonce(signer).await?;
        let floor = self.floor.next_unused(signer).await?;
        let seed = chain_nonce.max(floor);
        let mut guard = lock_slot(&slot);
        if guard.next_sequence.is_none() {
            guard.next_sequence = Some(seed);
            debug!(signer = %signer, chain = chain_nonce, floor, seed, "Seeded sequence");
        }
        Ok(())
    }

    /// Reserve without touching the network. Returns `None` if the signer has
    /// not been primed yet.
    pub fn try_reserve_local(&self, signer: Address) -> Option<Reserved> {
        let slot = self.slot(signer);
        let mut guard = lock_slot(&slot);
        let sequence = guard.next_sequence?;
        guard.next_sequence = Some(sequence + 1);
        guard.reservations += 1;
        let refresh_due = self.refresh_every > 0 && guard.reservations % self.refresh_every == 0;
        Some(Reserved {
            sequence,
            refresh_due,
        })
    }

    /// Atomically take the next sequence for `signer`, seeding from chain on a
    /// cache miss.
    pub async fn reserve(&self, signer: Address) -> Result<u64, TransferError> {
        loop {
            if let Some(reserved) = self.try_reserve_local(signer) {
                if reserved.refresh_due {
                    if let Err(e) = self.refresh(signer).await {
                        warn!(signer = %signer, error = %e, "Periodic nonce refresh failed");
                    }
                }
                return Ok(reserved.sequence);
            }
            self.prime(signer).await?;
        }
    }

    /// Re-read nonce and gas price from chain. The counter never moves backwards.
    pub async fn refresh(&self, signer: Address) -> Result<(), TransferError> {
        let chain_nonce = self.chain.get_nonce(signer).await?;
        let gas_price = self.chain.get_gas_price().await?;

        let slot = self.slot(signer);
        let mut guard = lock_slot(&slot);
        let local = guard.next_sequence.unwrap_or(chain_nonce);
        guard.next_sequence = Some(local.max(chain_nonce));
        drop(guard);
        self.store_gas_price(gas_price);
        metrics::NONCE_REFRESHES.with_label_values(&["periodic"]).inc();

        if chain_nonce > local {
            info!(
                signer = %signer,
                local,
                chain = chain_nonce,
                "Sequence advanced externally, skipping ahead"
            );
        }
        Ok(())
    }

    /// Re-read chain and durable state after a sequence conflict and jump past
    /// both. Returns the next sequence that will be handed out.
    pub async fn resync(&self, signer: Address) -> Result<u64, TransferError> {
        let chain_nonce = self.chain.get_nonce(signer).await?;
        let floor = self.floor.next_unused(signer).await?;
        let slot = self.slot(signer);
        let mut guard = lock_slot(&slot);
        let local = guard.next_sequence.unwrap_or(0);
        let next = local.max(chain_nonce).max(floor);
        guard.next_sequence = Some(next);
        metrics::NONCE_REFRESHES.with_label_values(&["resync"]).inc();
        warn!(signer = %signer, local, chain = chain_nonce, floor, next, "Sequence resynced");
        Ok(next)
    }

    fn store_gas_price(&self, price: u128) {
        *self
            .last_gas_price
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(price);
    }

    /// Last gas price seen by a refresh, fetched on a miss
    pub async fn gas_price(&self) -> Result<u128, TransferError> {
        let cached = *self
            .last_gas_price
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(price) = cached {
            return Ok(price);
        }
        let price = self.chain.get_gas_price().await?;
        self.store_gas_price(price);
        Ok(price)
    }

    /// Next sequence that would be handed out, if known
    #[cfg(test)]
    pub fn peek(&self, signer: Address) -> Option<u64> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&signer)
            .cloned()?;
        let guard = lock_slot(&slot);
        guard.next_sequence
    }
}
