//! In-process status store for tests and single-node dev runs

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{StatusStore, CHANGE_CHANNEL_CAPACITY};
use crate::error::TransferError;
use crate::types::{NewTransfer, StatusUpdate, TransferRecord, TransferStatus};

#[derive(Default)]
struct Inner {
    records: BTreeMap<i64, TransferRecord>,
    by_intent_hash: HashMap<String, i64>,
    next_id: i64,
}

pub struct MemoryStatusStore {
    inner: RwLock<Inner>,
    changes: broadcast::Sender<TransferRecord>,
    unavailable: AtomicBool,
}

impl Default for MemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
            changes,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail with `StoreUnavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), TransferError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransferError::StoreUnavailable(
                "memory store switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn publish(&self, record: &TransferRecord) {
        // No receivers is fine
        let _ = self.changes.send(record.clone());
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn insert(&self, record: NewTransfer) -> Result<TransferRecord, TransferError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;

        if let Some(hash) = &record.intent_hash {
            if let Some(existing) = inner
                .by_intent_hash
                .get(hash)
                .and_then(|id| inner.records.get(id))
            {
                debug!(intent_hash = %hash, id = existing.id, "Insert deduplicated on intent hash");
                return Ok(existing.clone());
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let now = Utc::now();
        let stored = TransferRecord {
            id,
            user: record.user,
            src_chain_id: record.src_chain_id,
            dst_chain_id: record.dst_chain_id,
            amount: record.amount,
            recipient: record.recipient,
            intent_hash: record.intent_hash,
            intent_nonce: record.intent_nonce,
            relay_tx_hash: record.relay_tx_hash,
            status: record.status,
            error_message: record.error_message,
            created_at: now,
            updated_at: now,
            challenge_started_at: None,
            completed_at: None,
        };
        if let Some(hash) = &stored.intent_hash {
            inner.by_intent_hash.insert(hash.clone(), id);
        }
        inner.records.insert(id, stored.clone());
        drop(inner);

        self.publish(&stored);
        Ok(stored)
    }

    async fn get(&self, id: i64) -> Result<Option<TransferRecord>, TransferError> {
        self.check_available()?;
        Ok(self.inner.read().await.records.get(&id).cloned())
    }

    async fn get_by_intent_hash(
        &self,
        intent_hash: &str,
    ) -> Result<Option<TransferRecord>, TransferError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .by_intent_hash
            .get(intent_hash)
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    async fn update_status(
        &self,
        id: i64,
        expected: TransferStatus,
        update: StatusUpdate,
    ) -> Result<TransferRecord, TransferError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;

        if record.status != expected {
            return Err(TransferError::InvalidTransition {
                from: record.status,
                to: update.status,
            });
        }

        record.status = update.status;
        if update.relay_tx_hash.is_some() {
            record.relay_tx_hash = update.relay_tx_hash;
        }
        if update.error_message.is_some() {
            record.error_message = update.error_message;
        }
        if record.challenge_started_at.is_none() {
            record.challenge_started_at = update.challenge_started_at;
        }
        if record.completed_at.is_none() {
            record.completed_at = update.completed_at;
        }
        record.updated_at = Utc::now();
        let updated = record.clone();
        drop(inner);

        self.publish(&updated);
        Ok(updated)
    }

    async fn list_by_user(
        &self,
        user: &str,
        limit: i64,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .rev()
            .filter(|r| r.user.eq_ignore_ascii_case(user))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_by_status_after(
        &self,
        status: TransferStatus,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .range(after_id.saturating_add(1)..)
            .map(|(_, r)| r)
            .filter(|r| r.status == status)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn max_intent_nonce(&self, user: &str) -> Result<Option<i64>, TransferError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .filter(|r| r.user.eq_ignore_ascii_case(user))
            .filter_map(|r| r.intent_nonce)
            .max())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransferRecord> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_transfer(user: &str, hash: Option<&str>) -> NewTransfer {
        NewTransfer {
            user: user.to_string(),
            src_chain_id: 1,
            dst_chain_id: 56,
            amount: "1000".to_string(),
            recipient: "0x2222222222222222222222222222222222222222".to_string(),
            intent_hash: hash.map(str::to_string),
            intent_nonce: None,
            relay_tx_hash: None,
            status: TransferStatus::Committed,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_dedupes_on_hash() {
        let store = MemoryStatusStore::new();
        let a = store.insert(new_transfer("0xaa", Some("0x01"))).await.unwrap();
        let b = store.insert(new_transfer("0xaa", Some("0x02"))).await.unwrap();
        let again = store.insert(new_transfer("0xaa", Some("0x01"))).await.unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(again.id, a.id);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_update_is_compare_and_set() {
        let store = MemoryStatusStore::new();
        let record = store.insert(new_transfer("0xaa", None)).await.unwrap();

        let updated = store
            .update_status(
                record.id,
                TransferStatus::Committed,
                StatusUpdate::to(TransferStatus::Processing),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TransferStatus::Processing);

        let stale = store
            .update_status(
                record.id,
                TransferStatus::Committed,
                StatusUpdate::to(TransferStatus::Failed),
            )
            .await;
        assert!(matches!(
            stale,
            Err(TransferError::InvalidTransition {
                from: TransferStatus::Processing,
                to: TransferStatus::Failed
            })
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_timestamps_written_once() {
        let store = MemoryStatusStore::new();
        let record = store.insert(new_transfer("0xaa", None)).await.unwrap();
        let first = Utc::now();
        let later = first + chrono::Duration::minutes(5);

        let mut update = StatusUpdate::to(TransferStatus::Processing);
        update.challenge_started_at = Some(first);
        update.completed_at = Some(first);
        store
            .update_status(record.id, TransferStatus::Committed, update)
            .await
            .unwrap();

        let mut again = StatusUpdate::to(TransferStatus::Completed);
        again.challenge_started_at = Some(later);
        again.completed_at = Some(later);
        let stored = store
            .update_status(record.id, TransferStatus::Processing, again)
            .await
            .unwrap();
        assert_eq!(stored.challenge_started_at, Some(first));
        assert_eq!(stored.completed_at, Some(first));
    }

    #[tokio::test]
    async fn test_list_by_status_pages_past_cursor() {
        let store = MemoryStatusStore::new();
        for _ in 0..5 {
            store.insert(new_transfer("0xaa", None)).await.unwrap();
        }

        let first = store
            .list_by_status(TransferStatus::Committed, 2)
            .await
            .unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);

        let next = store
            .list_by_status_after(TransferStatus::Committed, 2, 2)
            .await
            .unwrap();
        assert_eq!(next.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4]);

        let tail = store
            .list_by_status_after(TransferStatus::Committed, 4, 2)
            .await
            .unwrap();
        assert_eq!(tail.iter().map(|r| r.id).collect::<Vec<_>>(), vec![5]);
    }

    #[tokio::test]
    async fn test_max_intent_nonce_spans_statuses() {
        let store = MemoryStatusStore::new();
        assert_eq!(store.max_intent_nonce("0xaa").await.unwrap(), None);

        let mut committed = new_transfer("0xAA", Some("0x01"));
        committed.intent_nonce = Some(4);
        store.insert(committed).await.unwrap();

        let mut failed = new_transfer("0xaa", Some("0x02"));
        failed.intent_nonce = Some(9);
        failed.status = TransferStatus::Failed;
        store.insert(failed).await.unwrap();

        let mut other = new_transfer("0xbb", Some("0x03"));
        other.intent_nonce = Some(50);
        store.insert(other).await.unwrap();

        assert_eq!(store.max_intent_nonce("0xaa").await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_list_by_user_newest_first() {
        let store = MemoryStatusStore::new();
        for _ in 0..3 {
            store.insert(new_transfer("0xAA", None)).await.unwrap();
        }
        store.insert(new_transfer("0xbb", None)).await.unwrap();

        let listed = store.list_by_user("0xaa", 2).await.unwrap();
        assert_eq!(listed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_subscribers_see_every_write() {
        let store = MemoryStatusStore::new();
        let mut changes = store.subscribe();

        let record = store.insert(new_transfer("0xaa", None)).await.unwrap();
        store
            .update_status(
                record.id,
                TransferStatus::Committed,
                StatusUpdate::to(TransferStatus::Failed),
            )
            .await
            .unwrap();

        assert_eq!(changes.recv().await.unwrap().status, TransferStatus::Committed);
        assert_eq!(changes.recv().await.unwrap().status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_unavailable_toggle() {
        let store = MemoryStatusStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get(1).await,
            Err(TransferError::StoreUnavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.get(1).await.unwrap().is_none());
    }
}
