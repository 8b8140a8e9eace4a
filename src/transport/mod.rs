//! 传输层：所有 provider 共享的 HTTP 客户端（连接超时、连接池、代理与 TLS）。
//!
//! The single outbound HTTP transport. It is configured once from
//! [`TransportConfig`] and shared by every provider client.

pub mod http;

pub use http::HttpTransport;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: u64,
    /// Explicit proxy for all outbound traffic.
    pub proxy: Option<String>,
    /// Honour `HTTPS_PROXY` / `HTTP_PROXY` / `NO_PROXY` when no explicit proxy is set.
    pub use_env_proxy: bool,
    /// Hosts that bypass the explicit proxy (comma separated, `NO_PROXY` syntax).
    pub no_proxy: Option<String>,
    /// Extra PEM CA bundle trusted in addition to the built-in roots.
    pub ca_bundle: Option<PathBuf>,
    /// PEM file holding the client certificate and its private key.
    pub client_cert: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 32,
            pool_idle_timeout_secs: 90,
            proxy: None,
            use_env_proxy: true,
            no_proxy: None,
            ca_bundle: None,
            client_cert: None,
            insecure_skip_verify: false,
        }
    }
}

impl TransportConfig {
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_env_proxy(mut self, enabled: bool) -> Self {
        self.use_env_proxy = enabled;
        self
    }

    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }
}
