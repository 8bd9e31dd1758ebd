//! Configuration for the tower

use crate::error::ConfigError;

/// Tower configuration
#[derive(Debug, Clone)]
pub struct TowerConfig {
    /// Chain JSON-RPC endpoint URL
    pub json_rpc_url: String,

    /// Host name the HTTP listener binds to
    pub host_name: String,

    /// Host port the HTTP listener binds to
    pub host_port: u16,

    /// Private key used to sign response transactions
    pub responder_key: String,

    /// Private key used to sign appointment receipts
    pub receipt_key: String,

    /// Address of the on-chain accountability contract
    pub tower_contract_address: String,

    /// Confirmations required before a response is considered final
    pub watcher_response_confirmations: u64,

    /// Per-IP rate limit: maximum requests per window
    pub rate_limit_user_max: u32,

    /// Per-IP rate limit window in milliseconds
    pub rate_limit_user_window_ms: u64,

    /// Global rate limit: maximum requests per window
    pub rate_limit_global_max: u32,

    /// Global rate limit window in milliseconds
    pub rate_limit_global_window_ms: u64,

    /// Chain polling interval in milliseconds
    pub polling_interval_ms: u64,

    /// Number of recent heads retained for reorg detection
    pub reorg_window: usize,

    /// Garbage collection interval in blocks
    pub gc_interval_blocks: u64,

    /// Maximum depth of the responder gas queue
    pub max_queue_depth: usize,

    /// Replace-by-fee gas escalation rate in percent
    pub replacement_rate_percent: u32,

    /// Maximum broadcast attempts before an intent is abandoned
    pub max_attempts: u32,

    /// Per-attempt provider response timeout in milliseconds
    pub provider_response_timeout_ms: u64,

    /// Wait between broadcast attempts in milliseconds
    pub attempt_interval_ms: u64,

    /// Path of the embedded appointment database
    pub db_path: String,

    /// Minimum acceptable on-chain dispute period for state-channel modes
    pub state_channel_min_dispute_period: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_rpc() -> String {
    "http://localhost:8545".to_string()
}

fn default_db_path() -> String {
    "pisa-db".to_string()
}

impl TowerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            json_rpc_url: std::env::var("JSON_RPC_URL").unwrap_or_else(|_| default_rpc()),
            host_name: std::env::var("HOST_NAME").unwrap_or_else(|_| default_host()),
            host_port: parse_var("HOST_PORT", 3000)?,
            responder_key: std::env::var("RESPONDER_KEY")
                .map_err(|_| ConfigError::MissingEnvVar("RESPONDER_KEY".into()))?,
            receipt_key: std::env::var("RECEIPT_KEY")
                .map_err(|_| ConfigError::MissingEnvVar("RECEIPT_KEY".into()))?,
            tower_contract_address: std::env::var("TOWER_CONTRACT_ADDRESS")
                .map_err(|_| ConfigError::MissingEnvVar("TOWER_CONTRACT_ADDRESS".into()))?,
            watcher_response_confirmations: parse_var("WATCHER_RESPONSE_CONFIRMATIONS", 6)?,
            rate_limit_user_max: parse_var("RATE_LIMIT_USER_MAX", 30)?,
            rate_limit_user_window_ms: parse_var("RATE_LIMIT_USER_WINDOW_MS", 60_000)?,
            rate_limit_global_max: parse_var("RATE_LIMIT_GLOBAL_MAX", 300)?,
            rate_limit_global_window_ms: parse_var("RATE_LIMIT_GLOBAL_WINDOW_MS", 60_000)?,
            polling_interval_ms: parse_var("POLLING_INTERVAL_MS", 5_000)?,
            reorg_window: parse_var("REORG_WINDOW", 200)?,
            gc_interval_blocks: parse_var("GC_INTERVAL_BLOCKS", 10)?,
            max_queue_depth: parse_var("MAX_QUEUE_DEPTH", 12)?,
            replacement_rate_percent: parse_var("REPLACEMENT_RATE_PERCENT", 15)?,
            max_attempts: parse_var("MAX_ATTEMPTS", 10)?,
            provider_response_timeout_ms: parse_var("PROVIDER_RESPONSE_TIMEOUT_MS", 30_000)?,
            attempt_interval_ms: parse_var("ATTEMPT_INTERVAL_MS", 1_000)?,
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| default_db_path()),
            state_channel_min_dispute_period: parse_var("STATE_CHANNEL_MIN_DISPUTE_PERIOD", 20)?,
        })
    }
}

fn parse_var<T: std::str::FromStr + Copy>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("could not parse {raw:?}"),
        }),
    }
}
