//! Background status tracking and finalization
//!
//! Each pass asks the relay how COMMITTED and PROCESSING transfers are doing
//! and moves them along, then finalizes COMPLETED transfers whose challenge
//! window has elapsed. Consecutive relay failures trip a circuit breaker that
//! pauses the loop instead of hammering a relay that is down.
//!
//! Each status is scanned in id order from a cursor that survives between
//! passes, so a full batch of records the relay cannot answer for never hides
//! the records behind it.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::TransferError;
use crate::metrics;
use crate::relay::{RelayProgress, RelaySubmitter};
use crate::retry::RetryConfig;
use crate::state_machine::TransferStateMachine;
use crate::types::{TransferRecord, TransferStatus};

const COMPONENT: &str = "tracker";

/// Circuit breaker configuration for the tracker loop
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed passes before pausing
    pub threshold: u32,
    /// How long to pause when the circuit breaker trips
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(300), // 5 minutes
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    /// Records per status per pass
    pub batch_size: i64,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Backoff after a failed pass, by consecutive failure count
    pub backoff: RetryConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            circuit_breaker: CircuitBreakerConfig::default(),
            backoff: RetryConfig::default(),
        }
    }
}

/// What one pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrackerPass {
    pub advanced: usize,
    pub failed: usize,
    pub finalized: usize,
    pub relay_errors: usize,
}

#[derive(Debug, Clone)]
pub struct TrackerHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
}

/// Last id visited per scanned status, 0 for "start over"
#[derive(Debug, Default)]
struct Cursors {
    committed: AtomicI64,
    processing: AtomicI64,
    completed: AtomicI64,
}

impl Cursors {
    fn of(&self, status: TransferStatus) -> &AtomicI64 {
        match status {
            TransferStatus::Committed => &self.committed,
            TransferStatus::Processing => &self.processing,
            _ => &self.completed,
        }
    }
}

pub struct StatusTracker {
    machine: Arc<TransferStateMachine>,
    relay: Arc<RelaySubmitter>,
    config: TrackerConfig,
    consecutive_failures: u32,
    cursors: Cursors,
}

impl StatusTracker {
    pub fn new(
        machine: Arc<TransferStateMachine>,
        relay: Arc<RelaySubmitter>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            machine,
            relay,
            config,
            consecutive_failures: 0,
            cursors: Cursors::default(),
        }
    }

    pub fn health(&self) -> TrackerHealth {
        TrackerHealth {
            healthy: self.consecutive_failures < self.config.circuit_breaker.threshold,
            consecutive_failures: self.consecutive_failures,
        }
    }

    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> eyre::Result<()> {
        let mut cycle_count = 0u64;
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Status tracker starting poll loop"
        );

        loop {
            cycle_count += 1;
            if cycle_count % 12 == 1 {
                info!(
                    cycle = cycle_count,
                    consecutive_failures = self.consecutive_failures,
                    "Status tracker heartbeat"
                );
            }

            tokio::select! {
                _ = self.tick() => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping status tracker");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping status tracker");
                    return Ok(());
                }
            }
        }
    }

    async fn tick(&mut self) {
        let breaker = &self.config.circuit_breaker;
        if self.consecutive_failures >= breaker.threshold {
            warn!(
                failures = self.consecutive_failures,
                pause_secs = breaker.pause_duration.as_secs(),
                "Tracker circuit breaker tripped, pausing"
            );
            tokio::time::sleep(breaker.pause_duration).await;
            self.consecutive_failures = 0;
            metrics::set_consecutive_failures(COMPONENT, 0);
        }

        match self.process_once(Utc::now()).await {
            Ok(pass) if pass.relay_errors == 0 => {
                self.consecutive_failures = 0;
                metrics::set_consecutive_failures(COMPONENT, 0);
                metrics::record_successful_poll(COMPONENT);
                if pass != TrackerPass::default() {
                    debug!(?pass, "Tracker pass complete");
                }
            }
            Ok(pass) => self.record_failure(&format!("{} relay status queries failed", pass.relay_errors)).await,
            Err(e) => self.record_failure(&e.to_string()).await,
        }
    }

    async fn record_failure(&mut self, detail: &str) {
        self.consecutive_failures += 1;
        metrics::set_consecutive_failures(COMPONENT, self.consecutive_failures);
        let backoff = self
            .config
            .backoff
            .backoff_for_attempt(self.consecutive_failures);
        error!(
            error = %detail,
            consecutive_failures = self.consecutive_failures,
            next_backoff_secs = backoff.as_secs(),
            "Tracker pass failed, will retry with backoff"
        );
        tokio::time::sleep(backoff).await;
    }

    /// Next batch of `status` records after the cursor, wrapping to the
    /// oldest ones when the scan runs off the end.
    async fn next_page(&self, status: TransferStatus) -> Result<Vec<TransferRecord>, TransferError> {
        let store = self.machine.store();
        let limit = self.config.batch_size.max(1);
        let cursor = self.cursors.of(status);
        let after = cursor.load(Ordering::Relaxed);

        let mut page = store.list_by_status_after(status, after, limit).await?;
        if after > 0 && (page.len() as i64) < limit {
            let wrapped = store
                .list_by_status_after(status, 0, limit - page.len() as i64)
                .await?;
            page.extend(wrapped.into_iter().filter(|r| r.id <= after));
        }

        let next = if page.len() as i64 >= limit {
            page.last().map_or(0, |r| r.id)
        } else {
            0
        };
        cursor.store(next, Ordering::Relaxed);
        Ok(page)
    }

    /// One pass over a batch of in-flight and completed transfers as of `now`
    pub async fn process_once(&self, now: DateTime<Utc>) -> Result<TrackerPass, TransferError> {
        let mut pass = TrackerPass::default();

        for status in [TransferStatus::Committed, TransferStatus::Processing] {
            for record in self.next_page(status).await? {
                self.track(&record, &mut pass).await;
            }
        }

        for record in self.next_page(TransferStatus::Completed).await? {
            let due = self
                .machine
                .window_closes_at(&record)
                .is_some_and(|closes_at| now >= closes_at);
            if !due {
                continue;
            }
            match self.machine.finalize_at(record.id, now).await {
                Ok(_) => pass.finalized += 1,
                Err(e) => log_skip(&record, &e),
            }
        }
        Ok(pass)
    }

    async fn track(&self, record: &TransferRecord, pass: &mut TrackerPass) {
        let Some(intent_hash) = record.intent_hash.as_deref() else {
            return;
        };

        let status = match self.relay.status(intent_hash).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                debug!(id = record.id, intent_hash, "Relay does not know this intent yet");
                return;
            }
            Err(e) => {
                pass.relay_errors += 1;
                warn!(id = record.id, intent_hash, error = %e, "Relay status query failed");
                return;
            }
        };

        let result = match (record.status, status.status) {
            (TransferStatus::Committed, RelayProgress::Processing) => {
                self.machine.mark_processing(record.id).await
            }
            (TransferStatus::Committed, RelayProgress::Completed) => {
                match self.machine.mark_processing(record.id).await {
                    Ok(_) => {
                        self.machine
                            .mark_completed(record.id, status.lock_tx_hash.clone())
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            (TransferStatus::Processing, RelayProgress::Completed) => {
                self.machine
                    .mark_completed(record.id, status.lock_tx_hash.clone())
                    .await
            }
            (TransferStatus::Committed | TransferStatus::Processing, RelayProgress::Failed) => {
                let reason = status
                    .error
                    .clone()
                    .unwrap_or_else(|| "relay reported failure".to_string());
                match self.machine.fail(record.id, &reason).await {
                    Ok(r) => {
                        pass.failed += 1;
                        Ok(r)
                    }
                    Err(e) => Err(e),
                }
            }
            _ => return,
        };

        match result {
            Ok(updated) if updated.status != TransferStatus::Failed => pass.advanced += 1,
            Ok(_) => {}
            Err(e) => log_skip(record, &e),
        }
    }
}

fn log_skip(record: &TransferRecord, err: &TransferError) {
    match err {
        // Raced with a challenge or another writer; the next pass sees the new state
        TransferError::InvalidTransition { .. } | TransferError::ChallengeWindowOpen { .. } => {
            debug!(id = record.id, error = %err, "Skipping transfer this pass")
        }
        _ => warn!(id = record.id, error = %err, "Failed to advance transfer"),
    }
}
