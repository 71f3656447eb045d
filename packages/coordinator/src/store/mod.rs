//! Durable transfer record storage
//!
//! The store is a dumb persistence layer: status rules live in the state
//! machine. It only guarantees that `update_status` is a compare-and-set on
//! the prior status and that every written record is broadcast to subscribers.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::TransferError;
use crate::types::{NewTransfer, StatusUpdate, TransferRecord, TransferStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStatusStore;
pub use postgres::PgStatusStore;

/// Buffered change notifications per subscriber before it starts lagging
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert a record. A second insert with the same intent hash returns the
    /// existing record instead of creating a duplicate.
    async fn insert(&self, record: NewTransfer) -> Result<TransferRecord, TransferError>;

    async fn get(&self, id: i64) -> Result<Option<TransferRecord>, TransferError>;

    async fn get_by_intent_hash(
        &self,
        intent_hash: &str,
    ) -> Result<Option<TransferRecord>, TransferError>;

    /// Apply `update` only if the stored status still equals `expected`.
    async fn update_status(
        &self,
        id: i64,
        expected: TransferStatus,
        update: StatusUpdate,
    ) -> Result<TransferRecord, TransferError>;

    /// Newest first
    async fn list_by_user(
        &self,
        user: &str,
        limit: i64,
    ) -> Result<Vec<TransferRecord>, TransferError>;

    /// Oldest first
    async fn list_by_status(
        &self,
        status: TransferStatus,
        limit: i64,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.list_by_status_after(status, 0, limit).await
    }

    /// Oldest first, only ids strictly greater than `after_id`
    async fn list_by_status_after(
        &self,
        status: TransferStatus,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<TransferRecord>, TransferError>;

    /// Highest intent nonce ever recorded for `user`, in any status
    async fn max_intent_nonce(&self, user: &str) -> Result<Option<i64>, TransferError>;

    fn subscribe(&self) -> broadcast::Receiver<TransferRecord>;
}
