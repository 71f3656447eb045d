//! Transfer orchestration
//!
//! Request order: validate -> reserve limit headroom and intent sequence ->
//! hash -> fresh permit nonce -> sign -> relay -> persist COMMITTED.
//!
//! The per-sender critical section only covers the in-memory limit and
//! sequence reservations. Signing, relay I/O and store writes happen outside
//! it so a slow relay never stalls other submissions from the same sender
//! longer than those two increments.
//!
//! Every record written for a signed intent, COMMITTED or FAILED, carries its
//! hash and sequence. [`PersistedSequenceFloor`] reads those back so a
//! restarted process never signs a sequence an earlier run already used.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::chain::ChainRpc;
use crate::error::TransferError;
use crate::hash::{bytes32_to_hex, hash_intent};
use crate::journal::{JournalEntry, RecoveryJournal};
use crate::keyed_lock::KeyedLocks;
use crate::limits::{LimitGuard, LimitHeadroom, LimitReservation};
use crate::metrics;
use crate::nonce_cache::{NonceGasCache, SequenceFloor};
use crate::notify::{dispatch, NotificationSink, TransferEvent, TransferEventKind};
use crate::permit::PermitSigner;
use crate::relay::{RelayReceipt, RelayRequest, RelaySubmitter, BRIDGE_TRANSFER};
use crate::retry::{classify_error, ErrorClass};
use crate::state_machine::TransferStateMachine;
use crate::store::StatusStore;
use crate::types::{
    format_token_amount, normalize_address, parse_address, parse_token_amount, NewTransfer,
    TransferIntent, TransferRecord, TransferStatus,
};

/// Longest list a single query may return
pub const MAX_LIST_LIMIT: i64 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub chain_id: u64,
    pub label: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub src_chain_id: u64,
    /// Token decimals for human amounts
    pub decimals: u8,
    /// Base units
    pub min_amount: U256,
    /// Base units, added on top of the amount in the permit value
    pub flat_fee: U256,
    pub intent_ttl: Duration,
    pub permit_window: Duration,
    pub destinations: Vec<Destination>,
}

impl CoordinatorSettings {
    fn destination(&self, chain_id: u64) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.chain_id == chain_id)
    }

    fn destination_label(&self, chain_id: u64) -> String {
        self.destination(chain_id)
            .map(|d| d.label.clone())
            .unwrap_or_else(|| format!("chain {}", chain_id))
    }
}

/// Client request, amounts in human units
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub user: String,
    pub recipient: String,
    pub amount: String,
    pub dst_chain_id: u64,
}

/// Everything a client needs to build a valid request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConstants {
    pub src_chain_id: u64,
    pub decimals: u8,
    pub min_amount: String,
    pub flat_fee: String,
    pub challenge_period_secs: i64,
    pub user_ceiling: String,
    pub global_ceiling: String,
    pub limit_period_secs: i64,
    pub permit_window_secs: u64,
    pub destinations: Vec<Destination>,
}

/// What a transfer costs the user right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeQuote {
    /// Base units, added to the amount in the permit
    pub flat_fee: String,
    /// Last gas price seen on the source chain, in wei. The relay pays it.
    pub gas_price_wei: String,
}

/// First intent sequence not used by any stored or journaled transfer
pub struct PersistedSequenceFloor {
    store: Arc<dyn StatusStore>,
    journal: Option<Arc<RecoveryJournal>>,
}

impl PersistedSequenceFloor {
    pub fn new(store: Arc<dyn StatusStore>, journal: Option<Arc<RecoveryJournal>>) -> Self {
        Self { store, journal }
    }
}

#[async_trait]
impl SequenceFloor for PersistedSequenceFloor {
    async fn next_unused(&self, signer: Address) -> Result<u64, TransferError> {
        let user = normalize_address(&signer);
        let mut highest = self.store.max_intent_nonce(&user).await?;

        if let Some(journal) = &self.journal {
            let pending = journal
                .pending()
                .await
                .map_err(|e| TransferError::StoreUnavailable(e.to_string()))?;
            let journaled = pending
                .iter()
                .filter(|entry| entry.record.user.eq_ignore_ascii_case(&user))
                .filter_map(|entry| entry.record.intent_nonce)
                .max();
            highest = highest.max(journaled);
        }

        Ok(highest.map_or(0, |n| n.saturating_add(1).max(0) as u64))
    }
}

fn is_sequence_conflict(err: &TransferError) -> bool {
    matches!(err, TransferError::RelayRejected(detail)
        if classify_error(detail) == ErrorClass::SequenceConflict)
}

/// Collaborators wired in by the composition root
pub struct Components {
    pub chain: Arc<dyn ChainRpc>,
    pub nonces: Arc<NonceGasCache>,
    pub limits: Arc<LimitGuard>,
    pub signer: Arc<PermitSigner>,
    pub relay: Arc<RelaySubmitter>,
    pub machine: Arc<TransferStateMachine>,
    pub journal: Option<Arc<RecoveryJournal>>,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
}

pub struct TransferCoordinator {
    settings: CoordinatorSettings,
    chain: Arc<dyn ChainRpc>,
    nonces: Arc<NonceGasCache>,
    limits: Arc<LimitGuard>,
    signer: Arc<PermitSigner>,
    relay: Arc<RelaySubmitter>,
    machine: Arc<TransferStateMachine>,
    journal: Option<Arc<RecoveryJournal>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    sender_sections: KeyedLocks<Address>,
}

impl TransferCoordinator {
    pub fn new(settings: CoordinatorSettings, components: Components) -> Self {
        Self {
            settings,
            chain: components.chain,
            nonces: components.nonces,
            limits: components.limits,
            signer: components.signer,
            relay: components.relay,
            machine: components.machine,
            journal: components.journal,
            sinks: components.sinks,
            sender_sections: KeyedLocks::new(),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn machine(&self) -> &Arc<TransferStateMachine> {
        &self.machine
    }

    pub fn limits(&self) -> &Arc<LimitGuard> {
        &self.limits
    }

    /// Senders with a reservation in flight
    pub fn tracked_senders(&self) -> usize {
        self.sender_sections.len()
    }

    fn event(
        &self,
        kind: TransferEventKind,
        transfer_id: Option<i64>,
        user: &str,
        amount: U256,
        dst_chain_id: u64,
        detail: String,
    ) -> TransferEvent {
        TransferEvent {
            kind,
            transfer_id,
            user: user.to_string(),
            amount: format_token_amount(amount, self.settings.decimals),
            destination_label: self.settings.destination_label(dst_chain_id),
            tx_hash_or_error: detail,
        }
    }

    /// Fail-fast checks; nothing has been reserved when these return an error.
    async fn validate(
        &self,
        request: &InitiateRequest,
    ) -> Result<(Address, Address, U256), TransferError> {
        let sender = parse_address(&request.user)?;
        let recipient = parse_address(&request.recipient)?;
        if recipient == Address::ZERO {
            return Err(TransferError::Validation(
                "recipient must not be the zero address".into(),
            ));
        }

        let amount = parse_token_amount(&request.amount, self.settings.decimals)?;
        if amount.is_zero() || amount < self.settings.min_amount {
            return Err(TransferError::Validation(format!(
                "amount {} is below the minimum of {}",
                request.amount,
                format_token_amount(self.settings.min_amount, self.settings.decimals)
            )));
        }

        match self.settings.destination(request.dst_chain_id) {
            Some(d) if d.enabled => {}
            Some(d) => {
                return Err(TransferError::Validation(format!(
                    "destination {} is disabled",
                    d.label
                )))
            }
            None => {
                return Err(TransferError::Validation(format!(
                    "destination chain {} is not supported",
                    request.dst_chain_id
                )))
            }
        }

        let total = amount
            .checked_add(self.settings.flat_fee)
            .ok_or_else(|| TransferError::Validation("amount + fee overflows".into()))?;
        let balance = self.chain.balance_of(sender).await?;
        if total > balance {
            return Err(TransferError::Validation(format!(
                "insufficient balance: need {} including fee, have {}",
                format_token_amount(total, self.settings.decimals),
                format_token_amount(balance, self.settings.decimals)
            )));
        }

        Ok((sender, recipient, amount))
    }

    /// Per-sender section: limit headroom and intent sequence, nothing else.
    async fn reserve(
        &self,
        sender: Address,
        amount: U256,
    ) -> Result<(LimitReservation, u64), TransferError> {
        // Seed outside the section so a cold cache never holds it across I/O
        self.nonces.prime(sender).await?;

        let guard = self.sender_sections.lock(sender).await;
        let reservation = self.limits.check_and_reserve(sender, amount)?;
        let Some(reserved) = self.nonces.try_reserve_local(sender) else {
            drop(guard);
            self.limits.release(reservation);
            return Err(TransferError::Chain(format!(
                "no sequence cached for {}",
                sender
            )));
        };
        drop(guard);

        if reserved.refresh_due {
            if let Err(e) = self.nonces.refresh(sender).await {
                warn!(sender = %sender, error = %e, "Periodic nonce refresh failed");
            }
        }
        Ok((reservation, reserved.sequence))
    }

    async fn sign_and_submit(
        &self,
        intent: &TransferIntent,
        hash: [u8; 32],
        intent_hash: &str,
        now: u64,
    ) -> Result<RelayReceipt, TransferError> {
        // Governs fund movement: always read fresh, never from a cache
        let permit_nonce = self.chain.get_permit_nonce(intent.sender).await?;
        let deadline = now + self.settings.permit_window.as_secs();
        let signed = self
            .signer
            .sign(intent, self.settings.flat_fee, permit_nonce, deadline, now)
            .await?;

        let request = RelayRequest {
            kind: BRIDGE_TRANSFER.to_string(),
            user: normalize_address(&intent.sender),
            amount: intent.amount.to_string(),
            fee: self.settings.flat_fee.to_string(),
            deadline,
            signature: signed.signature_hex(),
            dst_chain_id: intent.destination_chain_id,
            recipient: normalize_address(&intent.recipient),
            src_chain_id: self.settings.src_chain_id,
            intent_hash: intent_hash.to_string(),
            permit_nonce: permit_nonce.to_string(),
        };
        debug!(
            intent_hash = %intent_hash,
            sender = %intent.sender,
            nonce = intent.nonce,
            permit_nonce = %permit_nonce,
            "Submitting transfer to relay"
        );

        self.relay.submit(hash, &request).await
    }

    /// Start a transfer. Returns the COMMITTED record once the relay has
    /// accepted the lock.
    pub async fn initiate(&self, request: InitiateRequest) -> Result<TransferRecord, TransferError> {
        let result = self.initiate_inner(&request).await;
        match &result {
            Ok(_) => metrics::record_transfer("committed"),
            Err(e) => metrics::record_transfer(e.kind()),
        }
        result
    }

    async fn initiate_inner(
        &self,
        request: &InitiateRequest,
    ) -> Result<TransferRecord, TransferError> {
        let (sender, recipient, amount) = self.validate(request).await?;
        let (reservation, sequence) = self.reserve(sender, amount).await?;

        let now = Utc::now().timestamp().max(0) as u64;
        let intent = TransferIntent {
            sender,
            recipient,
            amount,
            nonce: sequence,
            expiry: now + self.settings.intent_ttl.as_secs(),
            destination_chain_id: request.dst_chain_id,
        };
        let user = normalize_address(&sender);

        let hash = match hash_intent(&intent, now) {
            Ok(hash) => hash,
            Err(e) => {
                self.limits.release(reservation);
                warn!(user = %user, nonce = sequence, error = %e, "Intent rejected before signing");
                return Err(e);
            }
        };
        let intent_hash = bytes32_to_hex(&hash);

        let receipt = match self.sign_and_submit(&intent, hash, &intent_hash, now).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.limits.release(reservation);
                self.record_failure(&intent, &user, &intent_hash, &e).await;
                return Err(e);
            }
        };

        let record = NewTransfer {
            user: user.clone(),
            src_chain_id: self.settings.src_chain_id as i64,
            dst_chain_id: intent.destination_chain_id as i64,
            amount: amount.to_string(),
            recipient: normalize_address(&recipient),
            intent_hash: Some(intent_hash.clone()),
            intent_nonce: Some(sequence as i64),
            relay_tx_hash: receipt.lock_tx_hash.clone(),
            status: TransferStatus::Committed,
            error_message: None,
        };

        // The lock exists on-chain from here on: headroom stays consumed
        self.limits.confirm(reservation);

        let entry = JournalEntry {
            intent_hash: intent_hash.clone(),
            record: record.clone(),
            display_amount: format_token_amount(amount, self.settings.decimals),
            destination_label: self.settings.destination_label(intent.destination_chain_id),
        };
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(&entry).await {
                error!(intent_hash = %intent_hash, error = %e, "Failed to journal accepted submission");
            }
        }

        let stored = match self.machine.create(record).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    intent_hash = %intent_hash,
                    error = %e,
                    "Relay accepted the lock but the record could not be persisted; left in journal"
                );
                return Err(e);
            }
        };
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.remove(&intent_hash).await {
                warn!(intent_hash = %intent_hash, error = %e, "Failed to clear journal entry");
            }
        }

        info!(
            id = stored.id,
            user = %user,
            intent_hash = %intent_hash,
            lock_tx_hash = ?receipt.lock_tx_hash,
            deduplicated = receipt.deduplicated,
            "Transfer committed"
        );
        let event = self.event(
            TransferEventKind::Committed,
            Some(stored.id),
            &user,
            amount,
            intent.destination_chain_id,
            stored.relay_tx_hash.clone().unwrap_or_default(),
        );
        dispatch(&self.sinks, &event).await;
        Ok(stored)
    }

    /// Relay-level failures leave a FAILED record behind; earlier failures
    /// (signing, chain reads) have no side effects to record. A sequence
    /// conflict also moves the sender's counter past whatever is in use.
    async fn record_failure(
        &self,
        intent: &TransferIntent,
        user: &str,
        intent_hash: &str,
        err: &TransferError,
    ) {
        warn!(
            user = %user,
            nonce = intent.nonce,
            intent_hash = %intent_hash,
            error = %err,
            "Transfer submission failed"
        );
        if !matches!(
            err,
            TransferError::RelayRejected(_) | TransferError::RelayUnavailable { .. }
        ) {
            return;
        }
        if is_sequence_conflict(err) {
            if let Err(e) = self.nonces.resync(intent.sender).await {
                warn!(user = %user, error = %e, "Sequence resync after conflict failed");
            }
        }

        let record = NewTransfer {
            user: user.to_string(),
            src_chain_id: self.settings.src_chain_id as i64,
            dst_chain_id: intent.destination_chain_id as i64,
            amount: intent.amount.to_string(),
            recipient: normalize_address(&intent.recipient),
            intent_hash: Some(intent_hash.to_string()),
            intent_nonce: Some(intent.nonce as i64),
            relay_tx_hash: None,
            status: TransferStatus::Failed,
            error_message: Some(err.to_string()),
        };
        let transfer_id = match self.machine.create(record).await {
            Ok(stored) if stored.status != TransferStatus::Failed => {
                warn!(
                    id = stored.id,
                    status = %stored.status,
                    intent_hash = %intent_hash,
                    "Intent already recorded in a live state, keeping that record"
                );
                Some(stored.id)
            }
            Ok(stored) => Some(stored.id),
            Err(e) => {
                error!(user = %user, intent_hash = %intent_hash, error = %e, "Failed to persist FAILED record");
                None
            }
        };
        let event = self.event(
            TransferEventKind::Failed,
            transfer_id,
            user,
            intent.amount,
            intent.destination_chain_id,
            err.to_string(),
        );
        dispatch(&self.sinks, &event).await;
    }

    /// Persist every journaled submission the store has not seen. Returns how
    /// many records were written.
    pub async fn recover(&self) -> Result<usize, TransferError> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let pending = journal
            .pending()
            .await
            .map_err(|e| TransferError::StoreUnavailable(e.to_string()))?;

        let mut recovered = 0;
        for entry in pending {
            let existing = self
                .machine
                .store()
                .get_by_intent_hash(&entry.intent_hash)
                .await?;
            if existing.is_none() {
                let stored = self.machine.create(entry.record.clone()).await?;
                recovered += 1;
                info!(id = stored.id, intent_hash = %entry.intent_hash, "Recovered journaled transfer");
                let event = TransferEvent {
                    kind: TransferEventKind::Committed,
                    transfer_id: Some(stored.id),
                    user: stored.user.clone(),
                    amount: entry.display_amount.clone(),
                    destination_label: entry.destination_label.clone(),
                    tx_hash_or_error: stored.relay_tx_hash.clone().unwrap_or_default(),
                };
                dispatch(&self.sinks, &event).await;
            }
            if let Err(e) = journal.remove(&entry.intent_hash).await {
                warn!(intent_hash = %entry.intent_hash, error = %e, "Failed to clear journal entry");
            }
        }
        Ok(recovered)
    }

    pub async fn get(&self, id: i64) -> Result<TransferRecord, TransferError> {
        self.machine.get(id).await
    }

    pub async fn list_for_user(
        &self,
        user: &str,
        limit: i64,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        let address = parse_address(user)?;
        self.machine
            .store()
            .list_by_user(&normalize_address(&address), limit.clamp(1, MAX_LIST_LIMIT))
            .await
    }

    pub async fn challenge(&self, id: i64, reason: &str) -> Result<TransferRecord, TransferError> {
        self.machine.record_challenge(id, reason).await
    }

    pub async fn finalize(&self, id: i64) -> Result<TransferRecord, TransferError> {
        self.machine.finalize(id).await
    }

    pub fn headroom(&self, user: &str) -> Result<LimitHeadroom, TransferError> {
        Ok(self.limits.remaining(parse_address(user)?))
    }

    /// Fee the user signs over plus the gas price the relay is paying
    pub async fn quote(&self) -> Result<FeeQuote, TransferError> {
        let gas_price = self.nonces.gas_price().await?;
        Ok(FeeQuote {
            flat_fee: self.settings.flat_fee.to_string(),
            gas_price_wei: gas_price.to_string(),
        })
    }

    pub fn constants(&self) -> TransferConstants {
        let limits = self.limits.config();
        TransferConstants {
            src_chain_id: self.settings.src_chain_id,
            decimals: self.settings.decimals,
            min_amount: self.settings.min_amount.to_string(),
            flat_fee: self.settings.flat_fee.to_string(),
            challenge_period_secs: self.machine.challenge_period().num_seconds(),
            user_ceiling: limits.user_ceiling.to_string(),
            global_ceiling: limits.global_ceiling.to_string(),
            limit_period_secs: limits.period.num_seconds(),
            permit_window_secs: self.settings.permit_window.as_secs(),
            destinations: self.settings.destinations.clone(),
        }
    }
}
