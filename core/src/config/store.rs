//! Configuration Store
//!
//! Handles loading/saving the TOML config file and validating it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ConfigError;
use crate::error::ErrorKind;

/// Unified gatelink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Where and how to reach the gateway
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Agent invocation settings
    #[serde(default)]
    pub execution: ExecutionSettings,

    /// Failure handling applied around calls
    #[serde(default)]
    pub resilience: ResilienceSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            gateway: GatewaySettings::default(),
            execution: ExecutionSettings::default(),
            resilience: ResilienceSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from the first config file found, or defaults, then apply env
    pub fn load_or_default() -> Self {
        let mut config = match super::find_config_file() {
            Some(path) => match Self::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
                    Self::default()
                }
            },
            None => Self::default(),
        };
        config.apply_env_overrides();
        config
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        super::get_config_dir().map(|d| d.join("config.toml"))
    }

    /// Override connection settings from `GATELINK_*` variables
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env("GATELINK_URL") {
            self.gateway.url = Some(url);
        }
        if let Some(url) = non_empty_env("GATELINK_REST_URL") {
            self.gateway.rest_url = Some(url);
        }
        if let Some(token) = non_empty_env(crate::identity::TOKEN_ENV) {
            self.gateway.token = Some(token);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gateway = &self.gateway;
        if gateway.url.is_none() && gateway.rest_url.is_none() {
            return Err(ConfigError::InvalidValue(
                "either gateway.url or gateway.rest_url must be set".to_string(),
            ));
        }
        if let Some(url) = &gateway.url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::InvalidValue(format!(
                    "gateway.url must be a ws:// or wss:// URL, got {}",
                    url
                )));
            }
        }
        if let Some(url) = &gateway.rest_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidValue(format!(
                    "gateway.rest_url must be an http:// or https:// URL, got {}",
                    url
                )));
            }
        }
        if gateway.connect_timeout_secs == 0 || gateway.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "gateway timeouts must be greater than 0".to_string(),
            ));
        }
        if self.execution.deadline_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "execution.deadline_secs must be greater than 0".to_string(),
            ));
        }
        if self.execution.method.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "execution.method must not be empty".to_string(),
            ));
        }

        let resilience = &self.resilience;
        if resilience.retry.backoff_base_ms > resilience.retry.backoff_max_ms {
            return Err(ConfigError::InvalidValue(
                "retry.backoff_base_ms must not exceed retry.backoff_max_ms".to_string(),
            ));
        }
        if resilience.circuit_breaker.failure_threshold == 0
            || resilience.circuit_breaker.half_open_max_calls == 0
        {
            return Err(ConfigError::InvalidValue(
                "circuit_breaker thresholds must be greater than 0".to_string(),
            ));
        }
        if resilience.rate_limit.max_calls == 0 || resilience.rate_limit.period_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "rate_limit.max_calls and rate_limit.period_ms must be greater than 0".to_string(),
            ));
        }
        if resilience.dedup.max_size == 0 {
            return Err(ConfigError::InvalidValue(
                "dedup.max_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Gateway endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// WebSocket endpoint (`ws://` or `wss://`)
    #[serde(default = "default_url")]
    pub url: Option<String>,

    /// REST fallback endpoint, used when no socket can be opened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_url: Option<String>,

    /// Bearer token (prefer the token file or GATELINK_TOKEN)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Token file location (defaults to `<config_dir>/gatelink/token.json`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<PathBuf>,

    /// Handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Default per-call timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            rest_url: None,
            token: None,
            token_path: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl GatewaySettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_url() -> Option<String> {
    Some("ws://127.0.0.1:18789".to_string())
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

/// Agent invocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// RPC method that starts a run
    #[serde(default = "default_method")]
    pub method: String,

    /// Overall deadline for one invocation, in seconds
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,

    /// Event kinds that carry run progress
    #[serde(default = "default_event_kinds")]
    pub event_kinds: Vec<String>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            method: default_method(),
            deadline_secs: default_deadline(),
            event_kinds: default_event_kinds(),
        }
    }
}

impl ExecutionSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

fn default_method() -> String {
    "chat.send".to_string()
}

fn default_deadline() -> u64 {
    600
}

fn default_event_kinds() -> Vec<String> {
    vec!["chat".to_string()]
}

/// Failure handling configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceSettings {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub dedup: DedupSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Error kinds retried unless overridden
    #[serde(default = "ErrorKind::default_retryable_set")]
    pub retryable: Vec<ErrorKind>,
    /// Kinds always retried, regardless of `retryable`
    #[serde(default)]
    pub always_retry: Vec<ErrorKind>,
    /// Kinds never retried, regardless of `retryable`
    #[serde(default)]
    pub never_retry: Vec<ErrorKind>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            jitter: true,
            retryable: ErrorKind::default_retryable_set(),
            always_retry: Vec::new(),
            never_retry: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_calls")]
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            half_open_max_calls: default_half_open_calls(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    30
}

fn default_half_open_calls() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,
    #[serde(default = "default_period")]
    pub period_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_calls: default_max_calls(),
            period_ms: default_period(),
        }
    }
}

fn default_max_calls() -> u32 {
    60
}

fn default_period() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dedup_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_dedup_size")]
    pub max_size: usize,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_dedup_ttl(),
            max_size: default_dedup_size(),
        }
    }
}

fn default_dedup_ttl() -> u64 {
    5
}

fn default_dedup_size() -> usize {
    1024
}
