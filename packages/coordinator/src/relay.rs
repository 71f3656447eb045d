//! Fee-payer relay submission
//!
//! Every submission is keyed by the intent hash, both in the JSON payload and in
//! the `Idempotency-Key` header, so re-sending after a timeout cannot create a
//! second lock. The relay answering "already submitted" is treated as success.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bounded_cache::BoundedCache;
use crate::error::{truncate_detail, TransferError};
use crate::hash::bytes32_to_hex;
use crate::metrics;
use crate::retry::{classify_error, ErrorClass, RetryConfig};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Body of `POST {relay}/relay`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub user: String,
    /// Base units, decimal
    pub amount: String,
    pub fee: String,
    pub deadline: u64,
    /// 65-byte permit signature, 0x hex
    pub signature: String,
    pub dst_chain_id: u64,
    pub recipient: String,
    pub src_chain_id: u64,
    pub intent_hash: String,
    pub permit_nonce: String,
}

pub const BRIDGE_TRANSFER: &str = "bridge_transfer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub success: bool,
    #[serde(default)]
    pub lock_tx_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Progress reported by `GET {relay}/relay/{intentHash}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayProgress {
    Pending,
    Processing,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatusResponse {
    pub status: RelayProgress,
    #[serde(default)]
    pub lock_tx_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Transport-level failure of one relay call
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayCallError {
    #[error("relay call timed out")]
    Timeout,
    #[error("relay transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn submit(&self, request: &RelayRequest) -> Result<RelayResponse, RelayCallError>;

    /// `Ok(None)` when the relay has never seen the intent
    async fn status(&self, intent_hash: &str)
        -> Result<Option<RelayStatusResponse>, RelayCallError>;
}

/// JSON-over-HTTP relay client
pub struct HttpRelayClient {
    base_url: String,
    client: Client,
}

impl HttpRelayClient {
    pub fn new(base_url: &str, timeout: Duration) -> eyre::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

fn map_reqwest(err: reqwest::Error) -> RelayCallError {
    if err.is_timeout() {
        RelayCallError::Timeout
    } else {
        RelayCallError::Transport(err.to_string())
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn submit(&self, request: &RelayRequest) -> Result<RelayResponse, RelayCallError> {
        let response = self
            .client
            .post(format!("{}/relay", self.base_url))
            .header(IDEMPOTENCY_HEADER, &request.intent_hash)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayCallError::Transport(format!("{} {}", status, body)));
        }
        // 4xx bodies still carry {success: false, error}
        response.json::<RelayResponse>().await.map_err(map_reqwest)
    }

    async fn status(
        &self,
        intent_hash: &str,
    ) -> Result<Option<RelayStatusResponse>, RelayCallError> {
        let response = self
            .client
            .get(format!("{}/relay/{}", self.base_url, intent_hash))
            .send()
            .await
            .map_err(map_reqwest)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RelayCallError::Transport(format!(
                "status query returned {}",
                response.status()
            )));
        }
        response
            .json::<RelayStatusResponse>()
            .await
            .map(Some)
            .map_err(map_reqwest)
    }
}

/// Outcome of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReceipt {
    pub lock_tx_hash: Option<String>,
    /// The relay (or the local cache) already held this intent
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub attempt_timeout: Duration,
    pub retry: RetryConfig,
    pub cache_size: usize,
    pub cache_ttl: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(15),
            retry: RetryConfig::default(),
            cache_size: crate::bounded_cache::DEFAULT_RECEIPT_CACHE_SIZE,
            cache_ttl: Duration::from_secs(crate::bounded_cache::DEFAULT_RECEIPT_CACHE_TTL_SECS),
        }
    }
}

enum Attempt {
    Accepted(RelayReceipt),
    Rejected(String),
    Transient(String),
}

pub struct RelaySubmitter {
    client: std::sync::Arc<dyn RelayClient>,
    settings: RelaySettings,
    receipts: Mutex<BoundedCache<RelayReceipt>>,
}

impl RelaySubmitter {
    pub fn new(client: std::sync::Arc<dyn RelayClient>, settings: RelaySettings) -> Self {
        let receipts = BoundedCache::new(settings.cache_size, settings.cache_ttl);
        Self {
            client,
            settings,
            receipts: Mutex::new(receipts),
        }
    }

    fn cached(&self, intent_hash: &[u8; 32]) -> Option<RelayReceipt> {
        self.receipts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(intent_hash)
    }

    fn remember(&self, intent_hash: [u8; 32], receipt: &RelayReceipt) {
        self.receipts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(intent_hash, receipt.clone());
    }

    async fn attempt(&self, request: &RelayRequest) -> Attempt {
        let call = tokio::time::timeout(self.settings.attempt_timeout, self.client.submit(request));
        match call.await {
            Err(_) | Ok(Err(RelayCallError::Timeout)) => {
                metrics::record_relay_attempt("timeout");
                Attempt::Transient(
                    TransferError::RelayTimeout(self.settings.attempt_timeout).to_string(),
                )
            }
            Ok(Err(RelayCallError::Transport(detail))) => {
                metrics::record_relay_attempt("transport");
                Attempt::Transient(detail)
            }
            Ok(Ok(response)) if response.success => {
                metrics::record_relay_attempt("accepted");
                Attempt::Accepted(RelayReceipt {
                    lock_tx_hash: response.lock_tx_hash,
                    deduplicated: false,
                })
            }
            Ok(Ok(response)) => {
                let detail = response
                    .error
                    .unwrap_or_else(|| "relay declined without reason".to_string());
                match classify_error(&detail) {
                    ErrorClass::AlreadySubmitted => {
                        metrics::record_relay_attempt("duplicate");
                        Attempt::Accepted(RelayReceipt {
                            lock_tx_hash: response.lock_tx_hash,
                            deduplicated: true,
                        })
                    }
                    ErrorClass::Transient => {
                        metrics::record_relay_attempt("transport");
                        Attempt::Transient(detail)
                    }
                    ErrorClass::SequenceConflict
                    | ErrorClass::Permanent
                    | ErrorClass::Unknown => {
                        metrics::record_relay_attempt("rejected");
                        Attempt::Rejected(detail)
                    }
                }
            }
        }
    }

    /// Submit with bounded, idempotent retries.
    pub async fn submit(
        &self,
        intent_hash: [u8; 32],
        request: &RelayRequest,
    ) -> Result<RelayReceipt, TransferError> {
        let hash_hex = bytes32_to_hex(&intent_hash);
        if request.intent_hash != hash_hex {
            return Err(TransferError::Validation(format!(
                "relay payload carries intent hash {} but {} was requested",
                request.intent_hash, hash_hex
            )));
        }
        if let Some(mut receipt) = self.cached(&intent_hash) {
            debug!(intent_hash = %hash_hex, "Relay receipt served from cache");
            receipt.deduplicated = true;
            return Ok(receipt);
        }

        let started = Instant::now();
        let retry = &self.settings.retry;
        let mut attempt = 0u32;

        loop {
            match self.attempt(request).await {
                Attempt::Accepted(receipt) => {
                    metrics::record_relay_latency("accepted", started.elapsed().as_secs_f64());
                    info!(
                        intent_hash = %hash_hex,
                        lock_tx_hash = ?receipt.lock_tx_hash,
                        deduplicated = receipt.deduplicated,
                        attempts = attempt + 1,
                        "Relay accepted submission"
                    );
                    self.remember(intent_hash, &receipt);
                    return Ok(receipt);
                }
                Attempt::Rejected(detail) => {
                    metrics::record_relay_latency("rejected", started.elapsed().as_secs_f64());
                    warn!(intent_hash = %hash_hex, error = %detail, "Relay rejected submission");
                    return Err(TransferError::RelayRejected(truncate_detail(&detail)));
                }
                Attempt::Transient(detail) if retry.should_retry(attempt) => {
                    let backoff = retry.backoff_for_attempt(attempt);
                    warn!(
                        intent_hash = %hash_hex,
                        attempt = attempt + 1,
                        max = retry.max_retries,
                        ?backoff,
                        error = %detail,
                        "Relay attempt failed, re-submitting with same intent hash"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Attempt::Transient(detail) => {
                    metrics::record_relay_latency("unavailable", started.elapsed().as_secs_f64());
                    warn!(intent_hash = %hash_hex, attempts = attempt + 1, error = %detail, "Relay unavailable");
                    return Err(TransferError::RelayUnavailable {
                        attempts: attempt + 1,
                        detail: truncate_detail(&detail),
                    });
                }
            }
        }
    }

    /// One status query, bounded by the per-attempt timeout
    pub async fn status(
        &self,
        intent_hash: &str,
    ) -> Result<Option<RelayStatusResponse>, TransferError> {
        let call = tokio::time::timeout(self.settings.attempt_timeout, self.client.status(intent_hash));
        match call.await {
            Err(_) | Ok(Err(RelayCallError::Timeout)) => {
                Err(TransferError::RelayTimeout(self.settings.attempt_timeout))
            }
            Ok(Err(RelayCallError::Transport(detail))) => Err(TransferError::RelayUnavailable {
                attempts: 1,
                detail: truncate_detail(&detail),
            }),
            Ok(Ok(status)) => Ok(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockRelay, ScriptedReply};
    use std::sync::Arc;

    fn fast_settings() -> RelaySettings {
        RelaySettings {
            attempt_timeout: Duration::from_millis(50),
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    fn request(hash: [u8; 32]) -> RelayRequest {
        RelayRequest {
            kind: BRIDGE_TRANSFER.to_string(),
            user: "0x1111111111111111111111111111111111111111".to_string(),
            amount: "1000".to_string(),
            fee: "10".to_string(),
            deadline: 1_900_000_000,
            signature: "0x00".to_string(),
            dst_chain_id: 56,
            recipient: "0x2222222222222222222222222222222222222222".to_string(),
            src_chain_id: 1,
            intent_hash: bytes32_to_hex(&hash),
            permit_nonce: "0".to_string(),
        }
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(request([7u8; 32])).unwrap();
        assert_eq!(json["type"], "bridge_transfer");
        assert_eq!(json["dstChainId"], 56);
        assert_eq!(json["srcChainId"], 1);
        assert!(json["intentHash"].as_str().unwrap().starts_with("0x0707"));
        assert!(json.get("permitNonce").is_some());
    }

    #[test]
    fn test_status_unknown_value_tolerated() {
        let parsed: RelayStatusResponse =
            serde_json::from_str(r#"{"status":"bridging"}"#).unwrap();
        assert_eq!(parsed.status, RelayProgress::Unknown);
    }

    #[tokio::test]
    async fn test_timeouts_then_success_locks_once() {
        let relay = Arc::new(MockRelay::new());
        relay.script([ScriptedReply::Hang, ScriptedReply::Hang]);
        let submitter = RelaySubmitter::new(relay.clone(), fast_settings());
        let hash = [1u8; 32];

        let receipt = submitter.submit(hash, &request(hash)).await.unwrap();
        assert!(receipt.lock_tx_hash.is_some());
        assert_eq!(relay.calls(), 3);
        assert_eq!(relay.locks(), 1);
        assert!(relay
            .seen_intent_hashes()
            .iter()
            .all(|h| *h == bytes32_to_hex(&hash)));
    }

    #[tokio::test]
    async fn test_already_submitted_is_success() {
        let relay = Arc::new(MockRelay::new());
        relay.script([ScriptedReply::Reject("intent already submitted".into())]);
        let submitter = RelaySubmitter::new(relay.clone(), fast_settings());

        let receipt = submitter.submit([2u8; 32], &request([2u8; 32])).await.unwrap();
        assert!(receipt.deduplicated);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let relay = Arc::new(MockRelay::new());
        relay.script([ScriptedReply::Reject("permit deadline expired".into())]);
        let submitter = RelaySubmitter::new(relay.clone(), fast_settings());

        let result = submitter.submit([3u8; 32], &request([3u8; 32])).await;
        assert!(matches!(result, Err(TransferError::RelayRejected(_))));
        assert_eq!(relay.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_unavailable() {
        let relay = Arc::new(MockRelay::new());
        relay.script(std::iter::repeat(ScriptedReply::Hang).take(10));
        let submitter = RelaySubmitter::new(relay.clone(), fast_settings());

        match submitter.submit([4u8; 32], &request([4u8; 32])).await {
            Err(TransferError::RelayUnavailable { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected RelayUnavailable, got {:?}", other),
        }
        assert_eq!(relay.locks(), 0);
    }

    #[tokio::test]
    async fn test_repeat_submission_served_from_cache() {
        let relay = Arc::new(MockRelay::new());
        let submitter = RelaySubmitter::new(relay.clone(), fast_settings());
        let hash = [5u8; 32];

        let first = submitter.submit(hash, &request(hash)).await.unwrap();
        let second = submitter.submit(hash, &request(hash)).await.unwrap();
        assert_eq!(first.lock_tx_hash, second.lock_tx_hash);
        assert!(second.deduplicated);
        assert_eq!(relay.calls(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_payload_hash_rejected() {
        let relay = Arc::new(MockRelay::new());
        let submitter = RelaySubmitter::new(relay.clone(), fast_settings());
        let result = submitter.submit([6u8; 32], &request([7u8; 32])).await;
        assert!(matches!(result, Err(TransferError::Validation(_))));
        assert_eq!(relay.calls(), 0);
    }
}
