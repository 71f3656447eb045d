//! Coordinator configuration, loaded from `.env` and environment variables
//!
//! Amounts are given in human token units and converted to base units with
//! `TOKEN_DECIMALS` at load time.

use alloy::primitives::{Address, U256};
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain::parse_rpc_urls;
use crate::coordinator::Destination;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres when set, in-memory store otherwise
    pub database: Option<DatabaseConfig>,
    pub chain: ChainConfig,
    pub relay: RelayConfig,
    pub limits: LimitsConfig,
    pub protocol: ProtocolConfig,
    pub api: ApiConfig,
    pub signer: SignerConfig,
    pub tracker: TrackerSettings,
    pub journal: JournalConfig,
    pub notify: NotifyConfig,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Primary first, then fallbacks in order
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    /// ERC-2612 token that is bridged and verifies the permit
    pub token_address: Address,
    pub token_decimals: u8,
    pub permit_domain_name: String,
    pub permit_domain_version: String,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub url: String,
    /// Spender of every permit
    pub fee_payer: Address,
    pub timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Base units
    pub user_ceiling: U256,
    /// Base units
    pub global_ceiling: U256,
    pub period: Duration,
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Base units
    pub min_amount: U256,
    /// Base units
    pub flat_fee: U256,
    pub challenge_period: Duration,
    pub intent_ttl: Duration,
    pub permit_window: Duration,
    pub destinations: Vec<Destination>,
    /// Intent sequence reservations between chain nonce refreshes
    pub nonce_refresh_every: u64,
}

#[derive(Clone)]
pub struct ApiConfig {
    pub bind_address: SocketAddr,
    /// Bearer token for the challenge route; unset disables challenges
    pub challenge_token: Option<String>,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_address", &self.bind_address)
            .field(
                "challenge_token",
                &self.challenge_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct SignerConfig {
    /// Dev key custody; production custody lives outside the process
    pub private_keys: Vec<String>,
}

impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("private_keys", &format!("<{} redacted>", self.private_keys.len()))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub breaker_threshold: u32,
    pub breaker_pause: Duration,
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Journal disabled when unset
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

fn default_decimals() -> u8 {
    18
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9092))
}

/// Parse `"56:BSC,137:Polygon"`. Entries are enabled; a `!` prefix disables one.
pub fn parse_destinations(raw: &str) -> Result<Vec<Destination>> {
    let mut destinations: Vec<Destination> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (enabled, item) = match item.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, item),
        };
        let (id, label) = item
            .split_once(':')
            .ok_or_else(|| eyre!("destination '{}' must look like <chainId>:<label>", item))?;
        let chain_id: u64 = id
            .trim()
            .parse()
            .wrap_err_with(|| format!("destination chain id '{}' is not a number", id))?;
        if destinations.iter().any(|d| d.chain_id == chain_id) {
            return Err(eyre!("destination chain {} listed twice", chain_id));
        }
        destinations.push(Destination {
            chain_id,
            label: label.trim().to_string(),
            enabled,
        });
    }
    Ok(destinations)
}

/// Human amount to base units
fn parse_amount(key: &str, raw: &str, decimals: u8) -> Result<U256> {
    crate::types::parse_token_amount(raw, decimals)
        .map_err(|e| eyre!("{} is not a valid token amount: {}", key, e))
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| eyre!("{} environment variable is required", key))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| eyre!("{} has an invalid value '{}': {}", key, raw, e)),
            None => Ok(default),
        }
    }

    fn address(&self, key: &str) -> Result<Address> {
        self.required(key)?
            .trim()
            .parse()
            .map_err(|e| eyre!("{} must be a valid hex address: {}", key, e))
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let vars = Vars { lookup };

        let database = vars.get("DATABASE_URL").map(|url| DatabaseConfig { url });

        let rpc_urls = parse_rpc_urls(&vars.required("CHAIN_RPC_URL")?);
        let decimals = vars.parsed("TOKEN_DECIMALS", default_decimals())?;
        let chain = ChainConfig {
            rpc_urls,
            chain_id: vars
                .required("CHAIN_ID")?
                .parse()
                .wrap_err("CHAIN_ID must be a valid u64")?,
            token_address: vars.address("TOKEN_ADDRESS")?,
            token_decimals: decimals,
            permit_domain_name: vars.required("PERMIT_DOMAIN_NAME")?,
            permit_domain_version: vars
                .get("PERMIT_DOMAIN_VERSION")
                .unwrap_or_else(|| "1".to_string()),
        };

        let relay = RelayConfig {
            url: vars.required("RELAY_URL")?,
            fee_payer: vars.address("FEE_PAYER_ADDRESS")?,
            timeout: Duration::from_millis(vars.parsed("RELAY_TIMEOUT_MS", 15_000u64)?),
            max_retries: vars.parsed("RELAY_MAX_RETRIES", 3u32)?,
        };

        let limits = LimitsConfig {
            user_ceiling: parse_amount(
                "USER_LIMIT",
                &vars.get("USER_LIMIT").unwrap_or_else(|| "100".to_string()),
                decimals,
            )?,
            global_ceiling: parse_amount(
                "GLOBAL_LIMIT",
                &vars.get("GLOBAL_LIMIT").unwrap_or_else(|| "1000".to_string()),
                decimals,
            )?,
            period: Duration::from_secs(vars.parsed("LIMIT_PERIOD_SECS", 86_400u64)?),
        };

        let protocol = ProtocolConfig {
            min_amount: parse_amount(
                "MIN_AMOUNT",
                &vars.get("MIN_AMOUNT").unwrap_or_else(|| "0.1".to_string()),
                decimals,
            )?,
            flat_fee: parse_amount(
                "FLAT_FEE",
                &vars.get("FLAT_FEE").unwrap_or_else(|| "0".to_string()),
                decimals,
            )?,
            challenge_period: Duration::from_secs(vars.parsed("CHALLENGE_PERIOD_SECS", 900u64)?),
            intent_ttl: Duration::from_secs(vars.parsed("INTENT_TTL_SECS", 3_600u64)?),
            permit_window: Duration::from_secs(vars.parsed("PERMIT_WINDOW_SECS", 3_600u64)?),
            destinations: parse_destinations(&vars.required("DESTINATION_CHAINS")?)?,
            nonce_refresh_every: vars.parsed("NONCE_REFRESH_EVERY", 50u64)?,
        };

        let api = ApiConfig {
            bind_address: vars.parsed("API_BIND_ADDRESS", default_bind_address())?,
            challenge_token: vars
                .get("CHALLENGE_TOKEN")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        };

        let signer = SignerConfig {
            private_keys: vars
                .get("SIGNER_PRIVATE_KEYS")
                .map(|raw| {
                    raw.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        let tracker = TrackerSettings {
            poll_interval: Duration::from_millis(vars.parsed("TRACKER_POLL_INTERVAL_MS", 5_000u64)?),
            batch_size: vars.parsed("TRACKER_BATCH_SIZE", 100i64)?,
            breaker_threshold: vars.parsed("TRACKER_BREAKER_THRESHOLD", 10u32)?,
            breaker_pause: Duration::from_secs(vars.parsed("TRACKER_BREAKER_PAUSE_SECS", 300u64)?),
        };

        let journal = JournalConfig {
            dir: vars.get("JOURNAL_DIR").map(PathBuf::from),
        };

        let notify = NotifyConfig {
            webhook_url: vars.get("NOTIFY_WEBHOOK_URL"),
        };

        let config = Config {
            database,
            chain,
            relay,
            limits,
            protocol,
            api,
            signer,
            tracker,
            journal,
            notify,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(db) = &self.database {
            if !db.url.starts_with("postgres://") && !db.url.starts_with("postgresql://") {
                return Err(eyre!("DATABASE_URL must be a postgres:// URL"));
            }
        }

        if self.chain.rpc_urls.is_empty() {
            return Err(eyre!("chain.rpc_urls cannot be empty"));
        }
        if self.chain.token_address == Address::ZERO {
            return Err(eyre!("chain.token_address cannot be the zero address"));
        }
        if self.chain.permit_domain_name.is_empty() {
            return Err(eyre!("chain.permit_domain_name cannot be empty"));
        }

        if self.relay.url.is_empty() {
            return Err(eyre!("relay.url cannot be empty"));
        }
        if self.relay.fee_payer == Address::ZERO {
            return Err(eyre!("relay.fee_payer cannot be the zero address"));
        }
        if self.relay.timeout.is_zero() {
            return Err(eyre!("relay.timeout must be positive"));
        }

        if self.limits.user_ceiling.is_zero() || self.limits.global_ceiling.is_zero() {
            return Err(eyre!("limit ceilings must be greater than zero"));
        }
        if self.limits.user_ceiling > self.limits.global_ceiling {
            return Err(eyre!("USER_LIMIT cannot exceed GLOBAL_LIMIT"));
        }
        if self.limits.period.is_zero() {
            return Err(eyre!("limits.period must be positive"));
        }

        if self.protocol.min_amount.is_zero() {
            return Err(eyre!("protocol.min_amount must be greater than zero"));
        }
        if self.protocol.min_amount > self.limits.user_ceiling {
            return Err(eyre!("MIN_AMOUNT cannot exceed USER_LIMIT"));
        }
        if self.protocol.permit_window.is_zero() {
            return Err(eyre!("protocol.permit_window must be positive"));
        }
        if self.protocol.nonce_refresh_every == 0 {
            return Err(eyre!("NONCE_REFRESH_EVERY must be at least 1"));
        }
        if !self.protocol.destinations.iter().any(|d| d.enabled) {
            return Err(eyre!("at least one destination chain must be enabled"));
        }
        if self
            .protocol
            .destinations
            .iter()
            .any(|d| d.chain_id == self.chain.chain_id)
        {
            return Err(eyre!(
                "destination list contains the source chain {}",
                self.chain.chain_id
            ));
        }

        if self.tracker.batch_size <= 0 {
            return Err(eyre!("TRACKER_BATCH_SIZE must be positive"));
        }
        if self.tracker.breaker_threshold == 0 {
            return Err(eyre!("TRACKER_BREAKER_THRESHOLD must be at least 1"));
        }

        Ok(())
    }
}
