//! Azure AD client-credentials token source.

use crate::transport::HttpTransport;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;
const MAX_EXPIRES_IN_SECS: u64 = 86_400;

/// Bearer token acquisition for Azure-hosted models.
#[async_trait]
pub trait AzureTokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureAdConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_authority")]
    pub authority: String,
}

fn default_scope() -> String {
    "https://cognitiveservices.azure.com/.default".to_string()
}

fn default_authority() -> String {
    "https://login.microsoftonline.com".to_string()
}

impl fmt::Debug for AzureAdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureAdConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .field("authority", &self.authority)
            .finish()
    }
}

impl AzureAdConfig {
    pub fn token_url(&self) -> Result<Url> {
        let raw = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/'),
            self.tenant_id
        );
        Url::parse(&raw).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid Azure AD token URL: {}", e),
                ErrorContext::new()
                    .with_field_path("azure_ad.authority")
                    .with_details(raw),
            )
        })
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Client-credentials flow with a cached token.
///
/// Concurrent callers wait on one refresh instead of each hitting the token endpoint.
pub struct AzureAdTokenClient {
    config: AzureAdConfig,
    token_url: Url,
    transport: HttpTransport,
    cache: Mutex<Option<CachedToken>>,
}

impl AzureAdTokenClient {
    pub fn new(config: AzureAdConfig, transport: HttpTransport) -> Result<Self> {
        let token_url = config.token_url()?;
        Ok(Self {
            config,
            token_url,
            transport,
            cache: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let body: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("client_secret", &self.config.client_secret)
            .append_pair("scope", &self.config.scope)
            .finish();

        debug!(tenant = %self.config.tenant_id, "requesting Azure AD token");
        let resp = self
            .transport
            .client()
            .post(self.token_url.clone())
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await
            .map_err(|e| Error::UpstreamFatal {
                status: None,
                attempts: 1,
                message: format!("Azure AD token request failed: {}", e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            warn!(http_status = status.as_u16(), "Azure AD token request rejected");
            return Err(Error::UpstreamFatal {
                status: None,
                attempts: 1,
                message: format!("Azure AD token request rejected with HTTP {}", status.as_u16()),
            });
        }

        let json: Value = HttpTransport::read_json(resp).await?;
        let value = json
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::UpstreamFatal {
                status: None,
                attempts: 1,
                message: "Azure AD response has no access_token".to_string(),
            })?
            .to_string();
        let expires_in = match json.get("expires_in") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
        .min(MAX_EXPIRES_IN_SECS);

        let now = Instant::now();
        Ok(CachedToken {
            value,
            expires_at: now
                .checked_add(Duration::from_secs(expires_in))
                .unwrap_or(now),
        })
    }
}

#[async_trait]
impl AzureTokenSource for AzureAdTokenClient {
    async fn token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if Instant::now() + REFRESH_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }
        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cache = Some(fresh);
        Ok(value)
    }
}
