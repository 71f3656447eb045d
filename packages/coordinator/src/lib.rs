//! Cross-chain bridge transfer coordinator
//!
//! Drives a fungible transfer from intent commitment through permit signing,
//! idempotent relay submission and optimistic finality.

pub mod api;
pub mod bounded_cache;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod journal;
pub mod keyed_lock;
pub mod limits;
pub mod metrics;
pub mod nonce_cache;
pub mod notify;
pub mod permit;
pub mod relay;
pub mod retry;
pub mod state_machine;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tracker;
pub mod types;

pub use coordinator::TransferCoordinator;
pub use error::TransferError;
pub use types::{TransferRecord, TransferStatus};
