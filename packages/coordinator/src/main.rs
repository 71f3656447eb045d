use std::sync::Arc;

use bridge_coordinator::api::{self, AppState};
use bridge_coordinator::chain::{ChainRpc, EvmChainRpc};
use bridge_coordinator::config::Config;
use bridge_coordinator::coordinator::{
    Components, CoordinatorSettings, PersistedSequenceFloor, TransferCoordinator,
};
use bridge_coordinator::journal::RecoveryJournal;
use bridge_coordinator::limits::{LimitConfig, LimitGuard};
use bridge_coordinator::metrics;
use bridge_coordinator::nonce_cache::NonceGasCache;
use bridge_coordinator::notify::{NotificationSink, WebhookSink};
use bridge_coordinator::permit::{LocalKeyCustody, PermitDomain, PermitSigner};
use bridge_coordinator::relay::{HttpRelayClient, RelaySettings, RelaySubmitter};
use bridge_coordinator::retry::RetryConfig;
use bridge_coordinator::state_machine::TransferStateMachine;
use bridge_coordinator::store::{MemoryStatusStore, PgStatusStore, StatusStore};
use bridge_coordinator::tracker::{CircuitBreakerConfig, StatusTracker, TrackerConfig};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting bridge transfer coordinator");

    let config = Config::load()?;
    tracing::info!(
        chain_id = config.chain.chain_id,
        destinations = config.protocol.destinations.len(),
        rpc_endpoints = config.chain.rpc_urls.len(),
        "Configuration loaded"
    );

    let store: Arc<dyn StatusStore> = match &config.database {
        Some(database) => {
            let store = PgStatusStore::connect(&database.url).await?;
            tracing::info!("Database connected, migrations complete");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, transfer records are kept in memory only");
            Arc::new(MemoryStatusStore::new())
        }
    };

    let chain: Arc<dyn ChainRpc> = Arc::new(EvmChainRpc::new(
        &config.chain.rpc_urls,
        config.chain.token_address,
    )?);
    let journal = match &config.journal.dir {
        Some(dir) => Some(Arc::new(RecoveryJournal::open(dir).await?)),
        None => None,
    };

    // Sequences already written to the store or journal are never handed out again
    let floor = Arc::new(PersistedSequenceFloor::new(store.clone(), journal.clone()));
    let nonces = Arc::new(NonceGasCache::new(
        chain.clone(),
        floor,
        config.protocol.nonce_refresh_every,
    ));
    let limits = Arc::new(LimitGuard::new(LimitConfig {
        user_ceiling: config.limits.user_ceiling,
        global_ceiling: config.limits.global_ceiling,
        period: chrono::Duration::from_std(config.limits.period)?,
    }));

    let custody = LocalKeyCustody::from_private_keys(&config.signer.private_keys)?;
    if custody.addresses().is_empty() {
        tracing::warn!("No signer keys configured, every transfer will fail at signing");
    }
    let domain = PermitDomain {
        name: config.chain.permit_domain_name.clone(),
        version: config.chain.permit_domain_version.clone(),
        chain_id: config.chain.chain_id,
        verifying_contract: config.chain.token_address,
    };
    let signer = Arc::new(PermitSigner::new(
        &domain,
        config.relay.fee_payer,
        config.protocol.permit_window.as_secs(),
        Arc::new(custody),
    ));

    let relay_client = Arc::new(HttpRelayClient::new(&config.relay.url, config.relay.timeout)?);
    let relay = Arc::new(RelaySubmitter::new(
        relay_client,
        RelaySettings {
            attempt_timeout: config.relay.timeout,
            retry: RetryConfig {
                max_retries: config.relay.max_retries,
                ..Default::default()
            },
            ..Default::default()
        },
    ));

    let machine = Arc::new(TransferStateMachine::new(
        store,
        chrono::Duration::from_std(config.protocol.challenge_period)?,
        RetryConfig::default(),
    ));

    let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
    if let Some(url) = &config.notify.webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url)?));
    }

    let settings = CoordinatorSettings {
        src_chain_id: config.chain.chain_id,
        decimals: config.chain.token_decimals,
        min_amount: config.protocol.min_amount,
        flat_fee: config.protocol.flat_fee,
        intent_ttl: config.protocol.intent_ttl,
        permit_window: config.protocol.permit_window,
        destinations: config.protocol.destinations.clone(),
    };
    let coordinator = Arc::new(TransferCoordinator::new(
        settings,
        Components {
            chain,
            nonces,
            limits,
            signer,
            relay: relay.clone(),
            machine: machine.clone(),
            journal,
            sinks,
        },
    ));

    let recovered = coordinator.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "Replayed journaled transfers");
    }

    // Create shutdown channels
    let (tracker_tx, tracker_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (api_tx, mut api_rx) = tokio::sync::mpsc::channel::<()>(1);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = tracker_tx.send(()).await;
        let _ = api_tx.send(()).await;
    });

    let mut tracker = StatusTracker::new(
        machine,
        relay,
        TrackerConfig {
            poll_interval: config.tracker.poll_interval,
            batch_size: config.tracker.batch_size,
            circuit_breaker: CircuitBreakerConfig {
                threshold: config.tracker.breaker_threshold,
                pause_duration: config.tracker.breaker_pause,
            },
            ..Default::default()
        },
    );

    if config.api.challenge_token.is_none() {
        tracing::warn!("CHALLENGE_TOKEN not set, challenge submissions will be refused");
    }

    let mut api_task = tokio::spawn(api::start_api_server(
        config.api.bind_address,
        AppState::new(coordinator, config.api.challenge_token.clone()),
        async move {
            let _ = api_rx.recv().await;
        },
    ));

    metrics::UP.set(1.0);
    tracing::info!("Coordinator initialized, starting processing");

    let tracker_result = tokio::select! {
        result = tracker.run(tracker_rx) => result,
        result = &mut api_task => {
            metrics::UP.set(0.0);
            return match result {
                Ok(Ok(())) => Err(eyre::eyre!("API server stopped unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            };
        }
    };
    if let Err(e) = tracker_result {
        tracing::error!(error = %e, "Status tracker error");
    }
    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "API server error"),
        Err(e) => tracing::error!(error = %e, "API server task failed"),
    }

    metrics::UP.set(0.0);
    tracing::info!("Bridge transfer coordinator stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_coordinator=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
