//! Error types for the watchtower
//!
//! This module provides structured error types for better error handling,
//! monitoring, and debugging of the tower.

use thiserror::Error;

/// Main error type for the tower
#[derive(Error, Debug)]
pub enum TowerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed appointment request
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Protocol invariant violated during inspection
    #[error("Inspection error: {0}")]
    Inspection(#[from] InspectionError),

    /// Chain endpoint errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Durable store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invariant breach inside the tower
    #[error("Application error: {0}")]
    Application(String),

    /// Common ancestor of a reorg fell below the retained window
    #[error("Deep reorg: common ancestor below height {oldest_retained}, window {window}")]
    DeepReorg { oldest_retained: u64, window: usize },

    /// Responder exhausted its attempts for an intent
    #[error("Response failed for appointment {appointment_id} after {attempts} attempts")]
    ResponseFailed {
        appointment_id: String,
        attempts: u32,
    },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid private key format")]
    InvalidPrivateKey,

    #[error("Invalid address format: {0}")]
    InvalidAddress(String),
}

/// Request validation errors, returned to the client as 400
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Malformed request body: {0}")]
    Malformed(String),

    #[error("Invalid field {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("start_block {start} exceeds end_block {end}")]
    WindowInverted { start: u64, end: u64 },

    #[error("gas_limit must be positive")]
    ZeroGasLimit,

    #[error("payment_hash does not match the free tier constant")]
    PaymentHashMismatch,

    #[error("customer signature is invalid: {0}")]
    BadCustomerSignature(String),

    #[error("unknown mode {0}")]
    UnknownMode(u64),

    #[error("unparseable event declaration: {0}")]
    BadEventAbi(String),

    #[error("unparseable event filter arguments: {0}")]
    BadEventArgs(String),
}

/// Inspection errors, returned to the client as 400
#[derive(Error, Debug)]
pub enum InspectionError {
    #[error("target contract {address} has no deployed code")]
    NoContractCode { address: String },

    #[error("target contract bytecode does not match the expected runtime")]
    WrongContractCode,

    #[error("claimed round {claimed} is not greater than on-chain round {onchain}")]
    StaleRound { claimed: u64, onchain: u64 },

    #[error("dispute period {period} below configured minimum {minimum}")]
    DisputePeriodTooShort { period: u64, minimum: u64 },

    #[error("dispute period {period} not less than remaining window {remaining}")]
    DisputePeriodTooLong { period: u64, remaining: u64 },

    #[error("participant {address} has not signed the claimed state")]
    MissingParticipantSignature { address: String },

    #[error("appointment payload could not be decoded: {0}")]
    UndecodablePayload(String),

    #[error("appointment payload is empty")]
    EmptyPayload,
}

/// Chain endpoint errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("RPC request failed: {0}")]
    Rpc(String),

    #[error("provider did not respond within {ms}ms")]
    Timeout { ms: u64 },

    #[error("block {number} not available from provider")]
    MissingBlock { number: u64 },

    #[error("chain ID mismatch: expected {expected}, got {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },

    #[error("transaction signing failed: {0}")]
    Signing(String),
}

/// Durable store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    #[error("corrupt record at {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("record {id} already exists with different contents")]
    Conflict { id: String },

    #[error("locator {locator} already has a live appointment with job_id {live_job_id}")]
    StaleJob { locator: String, live_job_id: u64 },
}

/// Error severity levels for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Transient errors that may resolve on retry
    Transient,
    /// Errors requiring attention but not critical
    Warning,
    /// Critical errors requiring immediate attention
    Critical,
    /// Fatal errors that prevent operation
    Fatal,
}

impl TowerError {
    /// Get the severity level of this error
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TowerError::Config(_) => ErrorSeverity::Fatal,
            TowerError::Validation(_) => ErrorSeverity::Warning,
            TowerError::Inspection(_) => ErrorSeverity::Warning,
            TowerError::Provider(e) => e.severity(),
            TowerError::Store(_) => ErrorSeverity::Critical,
            TowerError::Application(_) => ErrorSeverity::Critical,
            TowerError::DeepReorg { .. } => ErrorSeverity::Fatal,
            TowerError::ResponseFailed { .. } => ErrorSeverity::Critical,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.severity(), ErrorSeverity::Transient)
    }

    /// Get a short error code for metrics/logging
    pub fn error_code(&self) -> &'static str {
        match self {
            TowerError::Config(_) => "CONFIG_ERROR",
            TowerError::Validation(_) => "VALIDATION_FAILED",
            TowerError::Inspection(_) => "INSPECTION_FAILED",
            TowerError::Provider(_) => "PROVIDER_ERROR",
            TowerError::Store(_) => "STORE_ERROR",
            TowerError::Application(_) => "APPLICATION_ERROR",
            TowerError::DeepReorg { .. } => "DEEP_REORG",
            TowerError::ResponseFailed { .. } => "RESPONSE_FAILED",
        }
    }
}

impl ProviderError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ProviderError::Rpc(_) => ErrorSeverity::Transient,
            ProviderError::Timeout { .. } => ErrorSeverity::Transient,
            ProviderError::MissingBlock { .. } => ErrorSeverity::Transient,
            ProviderError::ChainIdMismatch { .. } => ErrorSeverity::Fatal,
            ProviderError::Signing(_) => ErrorSeverity::Critical,
        }
    }
}

/// Result type alias using TowerError
pub type TowerResult<T> = std::result::Result<T, TowerError>;
