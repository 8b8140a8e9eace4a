//! 网关配置：YAML 文件 + `AI_GATEWAY_*` 环境变量覆盖。
//!
//! Gateway configuration.
//!
//! Loaded from a YAML file, then overridden by environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `AI_GATEWAY_BIND` | `server.bind` |
//! | `AI_GATEWAY_LOG_JSON` | `server.json_logs` |
//! | `AI_GATEWAY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `AI_GATEWAY_CONNECT_TIMEOUT_SECS` | `transport.connect_timeout_secs` |
//! | `AI_GATEWAY_BREAKER_FAILURE_THRESHOLD` | `circuit_breaker.failure_threshold` |
//! | `AI_GATEWAY_BREAKER_COOLDOWN_SECS` | `circuit_breaker.cooldown_secs` |
//! | `AI_GATEWAY_CHUNK_TIMEOUT_SECS` | `timeouts.chunk_timeout_secs` |
//! | `AI_GATEWAY_REQUEST_TIMEOUT_SECS` | `timeouts.request_timeout_secs` |
//! | `AI_GATEWAY_CATALOG` | `catalog.path` |
//! | `AI_GATEWAY_STRICT_SYNC` | `catalog.strict` |
//! | `AI_PROXY_URL` | `transport.proxy` |
//! | `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET` | `azure_ad` when not set in the file |
//!
//! Every section is optional; defaults match a local development setup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::auth::StaticCaller;
use crate::credentials::AzureAdConfig;
use crate::resilience::{CircuitBreakerConfig, FailureClass, RetryPolicy};
use crate::transport::TransportConfig;
use crate::types::Provider;
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: BreakerConfig,
    pub timeouts: TimeoutConfig,
    pub azure_ad: Option<AzureAdConfig>,
    pub auth: AuthConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub retryable: Vec<FailureClass>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
            retryable: FailureClass::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// Per-chunk read timeout and whole-request deadline. `0` disables one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderTimeouts {
    pub chunk_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            chunk_timeout_secs: 60,
            request_timeout_secs: 600,
        }
    }
}

impl ProviderTimeouts {
    pub fn chunk_timeout(&self) -> Option<Duration> {
        (self.chunk_timeout_secs > 0).then(|| Duration::from_secs(self.chunk_timeout_secs))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// Default timeouts plus per-provider overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub chunk_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub per_provider: HashMap<Provider, ProviderTimeouts>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let d = ProviderTimeouts::default();
        Self {
            chunk_timeout_secs: d.chunk_timeout_secs,
            request_timeout_secs: d.request_timeout_secs,
            per_provider: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    pub fn for_provider(&self, provider: Provider) -> ProviderTimeouts {
        self.per_provider
            .get(&provider)
            .copied()
            .unwrap_or(ProviderTimeouts {
                chunk_timeout_secs: self.chunk_timeout_secs,
                request_timeout_secs: self.request_timeout_secs,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Members bypass the group check (never the disabled check).
    pub admin_group: Option<String>,
    /// Bearer token to caller.
    pub tokens: HashMap<String, StaticCaller>,
    /// When set, requests without a token get these groups instead of 401.
    pub anonymous_groups: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: Option<PathBuf>,
    pub refresh_secs: u64,
    /// Fail the refresh on the first invalid record instead of skipping it.
    pub strict: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: None,
            refresh_secs: 300,
            strict: false,
        }
    }
}

impl GatewayConfig {
    /// Read the YAML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read configuration: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        Self::from_yaml_str(&content)?.with_env_overrides()
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid configuration: {}", e),
                ErrorContext::new().with_source("config_loader"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("AI_GATEWAY_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = get("AI_GATEWAY_LOG_JSON") {
            self.server.json_logs = parse_flag("AI_GATEWAY_LOG_JSON", &v)?;
        }
        if let Some(v) = get("AI_GATEWAY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("AI_GATEWAY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("AI_GATEWAY_CONNECT_TIMEOUT_SECS") {
            self.transport.connect_timeout_secs = parse_env("AI_GATEWAY_CONNECT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("AI_GATEWAY_BREAKER_FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold =
                parse_env("AI_GATEWAY_BREAKER_FAILURE_THRESHOLD", &v)?;
        }
        if let Some(v) = get("AI_GATEWAY_BREAKER_COOLDOWN_SECS") {
            self.circuit_breaker.cooldown_secs = parse_env("AI_GATEWAY_BREAKER_COOLDOWN_SECS", &v)?;
        }
        if let Some(v) = get("AI_GATEWAY_CHUNK_TIMEOUT_SECS") {
            self.timeouts.chunk_timeout_secs =
                parse_env("AI_GATEWAY_CHUNK_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("AI_GATEWAY_REQUEST_TIMEOUT_SECS") {
            self.timeouts.request_timeout_secs =
                parse_env("AI_GATEWAY_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("AI_GATEWAY_CATALOG") {
            self.catalog.path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("AI_GATEWAY_STRICT_SYNC") {
            self.catalog.strict = parse_flag("AI_GATEWAY_STRICT_SYNC", &v)?;
        }
        if let Some(v) = get("AI_PROXY_URL") {
            self.transport.proxy = Some(v);
        }
        if self.azure_ad.is_none() {
            if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
                get("AZURE_TENANT_ID"),
                get("AZURE_CLIENT_ID"),
                get("AZURE_CLIENT_SECRET"),
            ) {
                self.azure_ad = Some(AzureAdConfig {
                    tenant_id,
                    client_id,
                    client_secret,
                    scope: "https://cognitiveservices.azure.com/.default".to_string(),
                    authority: "https://login.microsoftonline.com".to_string(),
                });
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be at least 1.0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.circuit_breaker.cooldown_secs > MAX_DURATION_SECS {
            return Err(invalid("circuit_breaker.cooldown_secs", "must be at most one day"));
        }
        if self.retry.base_delay_ms / 1000 > MAX_DURATION_SECS
            || self.retry.max_delay_ms / 1000 > MAX_DURATION_SECS
        {
            return Err(invalid("retry.max_delay_ms", "must be at most one day"));
        }
        let mut timeouts = vec![(
            "timeouts".to_string(),
            ProviderTimeouts {
                chunk_timeout_secs: self.timeouts.chunk_timeout_secs,
                request_timeout_secs: self.timeouts.request_timeout_secs,
            },
        )];
        timeouts.extend(
            self.timeouts
                .per_provider
                .iter()
                .map(|(p, t)| (format!("timeouts.per_provider.{}", p.as_str()), *t)),
        );
        for (path, t) in timeouts {
            if t.chunk_timeout_secs > MAX_DURATION_SECS {
                return Err(invalid(
                    &format!("{}.chunk_timeout_secs", path),
                    "must be at most one day",
                ));
            }
            if t.request_timeout_secs > MAX_DURATION_SECS {
                return Err(invalid(
                    &format!("{}.request_timeout_secs", path),
                    "must be at most one day",
                ));
            }
        }
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(invalid("server.bind", "must be a socket address like 0.0.0.0:8080"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.retry.max_attempts)
            .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .with_multiplier(self.retry.multiplier)
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_jitter(self.retry.jitter)
            .with_retryable(self.retry.retryable.iter().copied())
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.circuit_breaker.failure_threshold)
            .with_cooldown(Duration::from_secs(self.circuit_breaker.cooldown_secs))
    }
}

/// Upper bound for configured delays and timeouts.
const MAX_DURATION_SECS: u64 = 86_400;

fn invalid(field: &str, msg: &str) -> Error {
    Error::configuration_with_context(
        format!("{} {}", field, msg),
        ErrorContext::new()
            .with_field_path(field)
            .with_source("config_loader"),
    )
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        Error::configuration_with_context(
            format!("{} has an invalid value", key),
            ErrorContext::new()
                .with_field_path(key)
                .with_details(value.to_string())
                .with_source("env"),
        )
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => parse_env::<bool>(key, value),
    }
}
