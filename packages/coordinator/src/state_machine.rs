//! Transfer status state machine
//!
//! ```text
//! COMMITTED -> PROCESSING -> COMPLETED -> FINALIZED
//!     \            \             \
//!      +------------+-------------+--> FAILED
//! ```
//!
//! FINALIZED and FAILED are terminal. Only this module writes status: every
//! write is a compare-and-set on the status read under the record's lock, so
//! two transitions of one record can never interleave and a stale writer gets
//! `InvalidTransition` instead of silently overwriting.
//!
//! After COMPLETED a challenge window runs from `challenge_started_at`. A
//! challenge inside the window fails the transfer; once it has elapsed
//! `finalize` moves the record to FINALIZED and stamps `completed_at`.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{truncate_detail, TransferError};
use crate::keyed_lock::KeyedLocks;
use crate::metrics;
use crate::retry::{with_retry, RetryConfig};
use crate::store::StatusStore;
use crate::types::{NewTransfer, StatusUpdate, TransferRecord, TransferStatus};

/// Whether `from -> to` is an edge of the lifecycle graph
pub fn is_valid_transition(from: TransferStatus, to: TransferStatus) -> bool {
    use TransferStatus::*;
    match (from, to) {
        (Committed, Processing) | (Processing, Completed) | (Completed, Finalized) => true,
        (Committed | Processing | Completed, Failed) => true,
        _ => false,
    }
}

pub struct TransferStateMachine {
    store: Arc<dyn StatusStore>,
    challenge_period: Duration,
    retry: RetryConfig,
    record_locks: KeyedLocks<i64>,
}

impl TransferStateMachine {
    pub fn new(store: Arc<dyn StatusStore>, challenge_period: Duration, retry: RetryConfig) -> Self {
        Self {
            store,
            challenge_period,
            retry,
            record_locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub fn challenge_period(&self) -> Duration {
        self.challenge_period
    }

    /// When the challenge window of a COMPLETED record closes
    pub fn window_closes_at(&self, record: &TransferRecord) -> Option<DateTime<Utc>> {
        record
            .challenge_started_at
            .map(|at| at + self.challenge_period)
    }

    /// Record ids with a transition in flight or queued
    pub fn tracked_locks(&self) -> usize {
        self.record_locks.len()
    }

    fn reject(&self, id: i64, from: TransferStatus, to: TransferStatus) -> TransferError {
        metrics::INVALID_TRANSITIONS
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        error!(id, %from, %to, "Rejected invalid status transition");
        TransferError::InvalidTransition { from, to }
    }

    /// Persist a new record in its initial status (COMMITTED, or FAILED when
    /// the relay rejected the submission).
    pub async fn create(&self, record: NewTransfer) -> Result<TransferRecord, TransferError> {
        if !matches!(
            record.status,
            TransferStatus::Committed | TransferStatus::Failed
        ) {
            return Err(TransferError::Validation(format!(
                "records cannot be created in status {}",
                record.status
            )));
        }
        let stored = with_retry(&self.retry, "store_insert", |_| {
            self.store.insert(record.clone())
        })
        .await?;
        metrics::STATUS_TRANSITIONS
            .with_label_values(&[stored.status.as_str()])
            .inc();
        info!(
            id = stored.id,
            user = %stored.user,
            status = %stored.status,
            intent_hash = ?stored.intent_hash,
            "Transfer record created"
        );
        Ok(stored)
    }

    pub async fn get(&self, id: i64) -> Result<TransferRecord, TransferError> {
        with_retry(&self.retry, "store_get", |_| self.store.get(id))
            .await?
            .ok_or_else(|| TransferError::NotFound(id.to_string()))
    }

    /// Validate and write one transition. Caller holds the record lock.
    async fn apply(
        &self,
        current: &TransferRecord,
        update: StatusUpdate,
    ) -> Result<TransferRecord, TransferError> {
        let to = update.status;
        if !is_valid_transition(current.status, to) {
            return Err(self.reject(current.id, current.status, to));
        }

        let updated = with_retry(&self.retry, "store_update_status", |_| {
            self.store
                .update_status(current.id, current.status, update.clone())
        })
        .await
        .map_err(|e| match e {
            TransferError::InvalidTransition { from, to } => self.reject(current.id, from, to),
            other => other,
        })?;

        metrics::STATUS_TRANSITIONS
            .with_label_values(&[to.as_str()])
            .inc();
        info!(id = current.id, from = %current.status, %to, "Transfer status changed");
        Ok(updated)
    }

    async fn transition(
        &self,
        id: i64,
        update: StatusUpdate,
    ) -> Result<TransferRecord, TransferError> {
        let _guard = self.record_locks.lock(id).await;
        let current = self.get(id).await?;
        self.apply(&current, update).await
    }

    pub async fn mark_processing(&self, id: i64) -> Result<TransferRecord, TransferError> {
        self.transition(id, StatusUpdate::to(TransferStatus::Processing))
            .await
    }

    pub async fn mark_completed(
        &self,
        id: i64,
        relay_tx_hash: Option<String>,
    ) -> Result<TransferRecord, TransferError> {
        self.mark_completed_at(id, relay_tx_hash, Utc::now()).await
    }

    /// Enter COMPLETED; `at` starts the challenge window and is never rewritten.
    pub async fn mark_completed_at(
        &self,
        id: i64,
        relay_tx_hash: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<TransferRecord, TransferError> {
        let mut update = StatusUpdate::to(TransferStatus::Completed);
        update.relay_tx_hash = relay_tx_hash;
        update.challenge_started_at = Some(at);
        self.transition(id, update).await
    }

    pub async fn fail(&self, id: i64, reason: &str) -> Result<TransferRecord, TransferError> {
        let mut update = StatusUpdate::to(TransferStatus::Failed);
        update.error_message = Some(truncate_detail(reason));
        let record = self.transition(id, update).await?;
        warn!(id, reason = %truncate_detail(reason), "Transfer failed");
        Ok(record)
    }

    pub async fn record_challenge(
        &self,
        id: i64,
        reason: &str,
    ) -> Result<TransferRecord, TransferError> {
        self.record_challenge_at(id, reason, Utc::now()).await
    }

    /// A challenge inside the window fails the transfer. Outside the window, or
    /// on a record that is not COMPLETED, it is an invalid transition.
    pub async fn record_challenge_at(
        &self,
        id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TransferRecord, TransferError> {
        let _guard = self.record_locks.lock(id).await;
        let current = self.get(id).await?;

        if current.status != TransferStatus::Completed {
            return Err(self.reject(id, current.status, TransferStatus::Failed));
        }
        let closes_at = self.window_closes_at(&current).unwrap_or(now);
        if now >= closes_at {
            warn!(id, %closes_at, "Challenge arrived after the window closed");
            return Err(self.reject(id, current.status, TransferStatus::Failed));
        }

        let mut update = StatusUpdate::to(TransferStatus::Failed);
        update.error_message = Some(truncate_detail(&format!("challenged: {}", reason)));
        let record = self.apply(&current, update).await?;
        warn!(id, reason = %truncate_detail(reason), "Transfer challenged inside window");
        Ok(record)
    }

    pub async fn finalize(&self, id: i64) -> Result<TransferRecord, TransferError> {
        self.finalize_at(id, Utc::now()).await
    }

    /// FINALIZED is idempotent. COMPLETED advances once the window has elapsed.
    pub async fn finalize_at(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<TransferRecord, TransferError> {
        let _guard = self.record_locks.lock(id).await;
        let current = self.get(id).await?;

        match current.status {
            TransferStatus::Finalized => Ok(current),
            TransferStatus::Completed => {
                let closes_at = self.window_closes_at(&current).unwrap_or(now);
                if now < closes_at {
                    return Err(TransferError::ChallengeWindowOpen {
                        remaining_secs: (closes_at - now).num_seconds().max(1),
                    });
                }
                let mut update = StatusUpdate::to(TransferStatus::Finalized);
                update.completed_at = Some(now);
                self.apply(&current, update).await
            }
            other => Err(self.reject(id, other, TransferStatus::Finalized)),
        }
    }
}
