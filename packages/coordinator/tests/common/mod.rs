//! Shared fixture: a coordinator wired to in-process chain, relay and store doubles

#![allow(dead_code)]

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bridge_coordinator::coordinator::{
    Components, CoordinatorSettings, Destination, InitiateRequest, PersistedSequenceFloor,
    TransferCoordinator,
};
use bridge_coordinator::journal::RecoveryJournal;
use bridge_coordinator::limits::{LimitConfig, LimitGuard};
use bridge_coordinator::nonce_cache::NonceGasCache;
use bridge_coordinator::permit::{LocalKeyCustody, PermitDomain, PermitSigner};
use bridge_coordinator::relay::{RelaySettings, RelaySubmitter};
use bridge_coordinator::retry::RetryConfig;
use bridge_coordinator::state_machine::TransferStateMachine;
use bridge_coordinator::store::MemoryStatusStore;
use bridge_coordinator::testing::{MockChain, MockCustody, MockRelay, RecordingSink};
use bridge_coordinator::tracker::{CircuitBreakerConfig, StatusTracker, TrackerConfig};
use bridge_coordinator::types::{normalize_address, parse_token_amount};

/// Anvil's first dev account
pub const USER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const RECIPIENT: &str = "0x2222222222222222222222222222222222222222";

pub struct Fixture {
    pub coordinator: Arc<TransferCoordinator>,
    pub machine: Arc<TransferStateMachine>,
    pub submitter: Arc<RelaySubmitter>,
    pub chain: Arc<MockChain>,
    pub relay: Arc<MockRelay>,
    pub store: Arc<MemoryStatusStore>,
    pub sink: Arc<RecordingSink>,
    pub custody: Arc<MockCustody>,
    pub user: Address,
}

pub fn units(raw: &str) -> U256 {
    parse_token_amount(raw, 18).unwrap()
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

impl Fixture {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    pub async fn with_journal(dir: &Path) -> Self {
        Self::build(Some(dir)).await
    }

    async fn build(journal_dir: Option<&Path>) -> Self {
        let user = USER_KEY.parse::<PrivateKeySigner>().unwrap().address();
        let chain = Arc::new(MockChain::default());
        chain.set_balance(user, units("1000"));
        let relay = Arc::new(MockRelay::new());
        let store = Arc::new(MemoryStatusStore::new());
        let sink = Arc::new(RecordingSink::default());

        let journal = match journal_dir {
            Some(dir) => Some(Arc::new(RecoveryJournal::open(dir).await.unwrap())),
            None => None,
        };

        let domain = PermitDomain {
            name: "Bridge Token".into(),
            version: "1".into(),
            chain_id: 1,
            verifying_contract: Address::repeat_byte(0xaa),
        };
        let custody = Arc::new(MockCustody::new(
            LocalKeyCustody::from_private_keys(&[USER_KEY]).unwrap(),
        ));
        let submitter = Arc::new(RelaySubmitter::new(
            relay.clone(),
            RelaySettings {
                attempt_timeout: Duration::from_millis(50),
                retry: fast_retry(),
                ..Default::default()
            },
        ));
        let machine = Arc::new(TransferStateMachine::new(
            store.clone(),
            chrono::Duration::minutes(15),
            fast_retry(),
        ));

        let floor = Arc::new(PersistedSequenceFloor::new(store.clone(), journal.clone()));
        let components = Components {
            chain: chain.clone(),
            nonces: Arc::new(NonceGasCache::new(chain.clone(), floor, 0)),
            limits: Arc::new(LimitGuard::new(LimitConfig {
                user_ceiling: units("100"),
                global_ceiling: units("1000"),
                period: chrono::Duration::hours(24),
            })),
            signer: Arc::new(PermitSigner::new(
                &domain,
                Address::repeat_byte(0xfe),
                3600,
                custody.clone(),
            )),
            relay: submitter.clone(),
            machine: machine.clone(),
            journal,
            sinks: vec![sink.clone()],
        };
        let settings = CoordinatorSettings {
            src_chain_id: 1,
            decimals: 18,
            min_amount: units("0.1"),
            flat_fee: units("0.01"),
            intent_ttl: Duration::from_secs(600),
            permit_window: Duration::from_secs(3600),
            destinations: vec![
                Destination {
                    chain_id: 56,
                    label: "BSC".into(),
                    enabled: true,
                },
                Destination {
                    chain_id: 137,
                    label: "Polygon".into(),
                    enabled: false,
                },
            ],
        };

        Fixture {
            coordinator: Arc::new(TransferCoordinator::new(settings, components)),
            machine,
            submitter,
            chain,
            relay,
            store,
            sink,
            custody,
            user,
        }
    }

    pub fn user_hex(&self) -> String {
        normalize_address(&self.user)
    }

    pub fn request(&self, amount: &str) -> InitiateRequest {
        InitiateRequest {
            user: self.user_hex(),
            recipient: RECIPIENT.into(),
            amount: amount.into(),
            dst_chain_id: 56,
        }
    }

    pub fn tracker(&self) -> StatusTracker {
        StatusTracker::new(
            self.machine.clone(),
            self.submitter.clone(),
            TrackerConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 100,
                circuit_breaker: CircuitBreakerConfig {
                    threshold: 3,
                    pause_duration: Duration::from_millis(10),
                },
                backoff: fast_retry(),
            },
        )
    }
}
