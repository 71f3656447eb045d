//! In-memory collaborators for tests and local dry runs
//!
//! `MockChain` answers chain reads from maps, `MockRelay` behaves like an
//! idempotent fee-payer relay whose replies can be scripted, `MockCustody`
//! hands out local keys until it is locked, and `RecordingSink` keeps every
//! notification it receives.

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::chain::ChainRpc;
use crate::error::TransferError;
use crate::hash::{bytes32_to_hex, keccak256};
use crate::notify::{NotificationSink, TransferEvent};
use crate::permit::{KeyCustody, LocalKeyCustody};
use crate::relay::{
    RelayCallError, RelayClient, RelayProgress, RelayRequest, RelayResponse, RelayStatusResponse,
};

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Default)]
pub struct MockChain {
    nonces: Mutex<HashMap<Address, u64>>,
    balances: Mutex<HashMap<Address, U256>>,
    permit_nonces: Mutex<HashMap<Address, U256>>,
    gas_price: Mutex<u128>,
    nonce_reads: AtomicUsize,
    permit_nonce_reads: AtomicUsize,
    failing: AtomicBool,
}

impl MockChain {
    pub fn set_nonce(&self, address: Address, nonce: u64) {
        locked(&self.nonces).insert(address, nonce);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        locked(&self.balances).insert(address, balance);
    }

    pub fn set_permit_nonce(&self, owner: Address, nonce: U256) {
        locked(&self.permit_nonces).insert(owner, nonce);
    }

    pub fn set_gas_price(&self, price: u128) {
        *locked(&self.gas_price) = price;
    }

    /// Every read fails with a chain error while set
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn nonce_reads(&self) -> usize {
        self.nonce_reads.load(Ordering::SeqCst)
    }

    pub fn permit_nonce_reads(&self) -> usize {
        self.permit_nonce_reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TransferError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransferError::Chain("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn get_nonce(&self, address: Address) -> Result<u64, TransferError> {
        self.check()?;
        self.nonce_reads.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.nonces).get(&address).copied().unwrap_or(0))
    }

    async fn get_gas_price(&self) -> Result<u128, TransferError> {
        self.check()?;
        Ok(*locked(&self.gas_price))
    }

    async fn balance_of(&self, owner: Address) -> Result<U256, TransferError> {
        self.check()?;
        Ok(locked(&self.balances)
            .get(&owner)
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn get_permit_nonce(&self, owner: Address) -> Result<U256, TransferError> {
        self.check()?;
        self.permit_nonce_reads.fetch_add(1, Ordering::SeqCst);
        Ok(locked(&self.permit_nonces)
            .get(&owner)
            .copied()
            .unwrap_or(U256::ZERO))
    }
}

/// One scripted answer of [`MockRelay`]. Calls beyond the script are processed
/// normally.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Never answer; the caller's timeout fires and nothing is locked
    Hang,
    /// Lock the funds, then never answer
    LockThenHang,
    /// Decline with the given error text
    Reject(String),
    /// Transport-level failure
    Transport(String),
}

#[derive(Debug, Clone)]
struct MockLock {
    lock_tx_hash: String,
    progress: RelayProgress,
    error: Option<String>,
}

/// Idempotent relay double. A processed submission creates at most one lock
/// per intent hash; repeats answer "already submitted".
#[derive(Default)]
pub struct MockRelay {
    script: Mutex<VecDeque<ScriptedReply>>,
    locks: Mutex<HashMap<String, MockLock>>,
    requests: Mutex<Vec<RelayRequest>>,
    status_failing: AtomicBool,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, replies: impl IntoIterator<Item = ScriptedReply>) {
        locked(&self.script).extend(replies);
    }

    pub fn calls(&self) -> usize {
        locked(&self.requests).len()
    }

    pub fn locks(&self) -> usize {
        locked(&self.locks).len()
    }

    pub fn seen_intent_hashes(&self) -> Vec<String> {
        locked(&self.requests)
            .iter()
            .map(|r| r.intent_hash.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<RelayRequest> {
        locked(&self.requests).clone()
    }

    /// Move a locked intent along as the relay would
    pub fn set_progress(&self, intent_hash: &str, progress: RelayProgress, error: Option<&str>) {
        if let Some(lock) = locked(&self.locks).get_mut(intent_hash) {
            lock.progress = progress;
            lock.error = error.map(str::to_string);
        }
    }

    pub fn set_status_failing(&self, failing: bool) {
        self.status_failing.store(failing, Ordering::SeqCst);
    }

    fn lock(&self, request: &RelayRequest) -> (String, bool) {
        let mut locks = locked(&self.locks);
        if let Some(existing) = locks.get(&request.intent_hash) {
            return (existing.lock_tx_hash.clone(), false);
        }
        let lock_tx_hash = bytes32_to_hex(&keccak256(request.intent_hash.as_bytes()));
        locks.insert(
            request.intent_hash.clone(),
            MockLock {
                lock_tx_hash: lock_tx_hash.clone(),
                progress: RelayProgress::Pending,
                error: None,
            },
        );
        (lock_tx_hash, true)
    }
}

#[async_trait]
impl RelayClient for MockRelay {
    async fn submit(&self, request: &RelayRequest) -> Result<RelayResponse, RelayCallError> {
        locked(&self.requests).push(request.clone());
        let scripted = locked(&self.script).pop_front();

        match scripted {
            Some(ScriptedReply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(RelayCallError::Timeout)
            }
            Some(ScriptedReply::LockThenHang) => {
                self.lock(request);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(RelayCallError::Timeout)
            }
            Some(ScriptedReply::Reject(error)) => Ok(RelayResponse {
                success: false,
                lock_tx_hash: None,
                error: Some(error),
            }),
            Some(ScriptedReply::Transport(detail)) => Err(RelayCallError::Transport(detail)),
            None => {
                let (lock_tx_hash, created) = self.lock(request);
                Ok(RelayResponse {
                    success: created,
                    lock_tx_hash: Some(lock_tx_hash),
                    error: (!created).then(|| "intent already submitted".to_string()),
                })
            }
        }
    }

    async fn status(
        &self,
        intent_hash: &str,
    ) -> Result<Option<RelayStatusResponse>, RelayCallError> {
        if self.status_failing.load(Ordering::SeqCst) {
            return Err(RelayCallError::Transport("502 Bad Gateway".to_string()));
        }
        Ok(locked(&self.locks)
            .get(intent_hash)
            .map(|lock| RelayStatusResponse {
                status: lock.progress,
                lock_tx_hash: Some(lock.lock_tx_hash.clone()),
                error: lock.error.clone(),
            }))
    }
}

/// Key custody that can be locked, e.g. a hardware wallet that went away
pub struct MockCustody {
    inner: LocalKeyCustody,
    locked: AtomicBool,
    requests: AtomicUsize,
}

impl MockCustody {
    pub fn new(inner: LocalKeyCustody) -> Self {
        Self {
            inner,
            locked: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyCustody for MockCustody {
    async fn signer_for(&self, owner: Address) -> Result<PrivateKeySigner, TransferError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.locked.load(Ordering::SeqCst) {
            return Err(TransferError::Signing("custody locked".into()));
        }
        self.inner.signer_for(owner).await
    }
}

/// Keeps every event; optionally fails delivery
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TransferEvent>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TransferEvent> {
        locked(&self.events).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, event: &TransferEvent) -> eyre::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(eyre::eyre!("sink offline"));
        }
        locked(&self.events).push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_chain_failure_switch() {
        let chain = MockChain::default();
        chain.set_nonce(Address::ZERO, 3);
        assert_eq!(chain.get_nonce(Address::ZERO).await.unwrap(), 3);
        assert_eq!(chain.nonce_reads(), 1);

        chain.set_failing(true);
        assert!(matches!(
            chain.get_nonce(Address::ZERO).await,
            Err(TransferError::Chain(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_relay_locks_once_per_intent() {
        let relay = MockRelay::new();
        let request = RelayRequest {
            kind: crate::relay::BRIDGE_TRANSFER.into(),
            user: "0xaa".into(),
            amount: "1".into(),
            fee: "0".into(),
            deadline: 0,
            signature: "0x".into(),
            dst_chain_id: 56,
            recipient: "0xbb".into(),
            src_chain_id: 1,
            intent_hash: "0x01".into(),
            permit_nonce: "0".into(),
        };

        let first = relay.submit(&request).await.unwrap();
        let second = relay.submit(&request).await.unwrap();
        assert!(first.success);
        assert!(!second.success);
        assert_eq!(first.lock_tx_hash, second.lock_tx_hash);
        assert_eq!(relay.locks(), 1);
        assert_eq!(
            relay.status("0x01").await.unwrap().unwrap().status,
            RelayProgress::Pending
        );
        assert!(relay.status("0x02").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_custody_lock() {
        let key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
        let custody = MockCustody::new(LocalKeyCustody::from_private_keys(&[key]).unwrap());
        let owner = key.parse::<PrivateKeySigner>().unwrap().address();

        assert_eq!(custody.signer_for(owner).await.unwrap().address(), owner);
        custody.set_locked(true);
        assert!(matches!(
            custody.signer_for(owner).await,
            Err(TransferError::Signing(_))
        ));
        assert_eq!(custody.requests(), 2);
    }
}
