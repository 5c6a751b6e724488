//! Shared error taxonomy for the gateway, executor, and configuration loader.

use std::fmt;

/// Classification of a failed exchange call, mirroring the retry policy in §4.2 / §7.
#[derive(Debug)]
pub enum GatewayError {
    /// Rate limited by the exchange. `retry_after` is in seconds.
    RateLimit { retry_after: u64 },
    /// Network error, non-JSON body, HTTP 5xx, or a `code` known to be retryable.
    Transient(String),
    /// Bad params, invalid signature, insufficient balance, or any other `code`
    /// not known to be transient.
    Permanent(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::RateLimit { retry_after } => {
                write!(f, "rate limited (retry after {}s)", retry_after)
            }
            GatewayError::Transient(msg) => write!(f, "transient error: {}", msg),
            GatewayError::Permanent(msg) => write!(f, "permanent error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Classify a Bitunix response envelope (`code`, HTTP status, `msg`) into a [`GatewayError`].
pub fn classify_error(code: i64, http_status: u16, msg: &str) -> GatewayError {
    match (code, http_status) {
        (429, _) | (_, 429) => GatewayError::RateLimit { retry_after: 5 },
        (10007, _) | (_, 500..=599) => GatewayError::Transient(msg.to_string()),
        _ => GatewayError::Permanent(format!("code={} msg={}", code, msg)),
    }
}

/// Errors raised by the trade executor's signal-dispatch and Open sequence.
///
/// These are always caught at the scheduler-worker boundary (§7 propagation
/// policy) — they never unwind past `process_signal`.
#[derive(Debug)]
pub enum ExecutorError {
    NoConfig,
    SymbolDisabled,
    Gateway(GatewayError),
    OpenTimedOut(&'static str),
    PositionNotFound,
    InvalidQty(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::NoConfig => write!(f, "no configuration for symbol"),
            ExecutorError::SymbolDisabled => write!(f, "symbol disabled in configuration"),
            ExecutorError::Gateway(e) => write!(f, "gateway error: {}", e),
            ExecutorError::OpenTimedOut(stage) => write!(f, "open sequence timed out at: {}", stage),
            ExecutorError::PositionNotFound => write!(f, "no matching position on exchange"),
            ExecutorError::InvalidQty(msg) => write!(f, "invalid computed quantity: {}", msg),
        }
    }
}

impl std::error::Error for ExecutorError {}

impl From<GatewayError> for ExecutorError {
    fn from(e: GatewayError) -> Self {
        ExecutorError::Gateway(e)
    }
}

/// Errors raised while loading and validating the TOML configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read configuration file: {}", e),
            ConfigError::Parse(e) => write!(f, "could not parse configuration file: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}
