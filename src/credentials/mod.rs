//! 凭据模块：把模型描述中的凭据引用解析为上游调用可用的密钥或令牌。
//!
//! Credential resolution for upstream calls.
//!
//! A model's [`CredentialRef`] names where its secret lives. The
//! [`CredentialResolver`] turns that reference into a [`Credential`] right
//! before each call, so rotated keys and refreshed tokens are picked up
//! without a catalog reload.

pub mod azure;

pub use azure::{AzureAdConfig, AzureAdTokenClient, AzureTokenSource};

use crate::types::CredentialRef;
use crate::{Error, ErrorContext, Result};
use std::fmt;
use std::sync::Arc;

/// Resolved secret, ready to be placed in a header.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Provider API key (header depends on the provider).
    ApiKey(String),
    /// OAuth2 access token sent as `Authorization: Bearer`.
    Bearer(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

impl Credential {
    pub fn secret(&self) -> &str {
        match self {
            Credential::ApiKey(s) | Credential::Bearer(s) => s,
        }
    }
}

#[derive(Clone, Default)]
pub struct CredentialResolver {
    azure: Option<Arc<dyn AzureTokenSource>>,
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("azure", &self.azure.is_some())
            .finish()
    }
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_azure(mut self, source: Arc<dyn AzureTokenSource>) -> Self {
        self.azure = Some(source);
        self
    }

    pub async fn resolve(&self, reference: &CredentialRef) -> Result<Option<Credential>> {
        match reference {
            CredentialRef::None => Ok(None),
            CredentialRef::Static { key } => Ok(Some(Credential::ApiKey(key.clone()))),
            CredentialRef::Env { var } => std::env::var(var)
                .map(|v| Some(Credential::ApiKey(v)))
                .map_err(|_| {
                    Error::configuration_with_context(
                        format!("environment variable {} is not set", var),
                        ErrorContext::new()
                            .with_field_path("credential.var")
                            .with_source("credentials"),
                    )
                }),
            CredentialRef::Keyring { service, account } => {
                let (service, account) = (service.clone(), account.clone());
                let lookup = tokio::task::spawn_blocking(move || {
                    keyring::Entry::new(&service, &account).and_then(|e| e.get_password())
                })
                .await
                .map_err(|e| Error::configuration(format!("keyring lookup panicked: {}", e)))?;
                lookup.map(|k| Some(Credential::ApiKey(k))).map_err(|e| {
                    Error::configuration_with_context(
                        format!("keyring lookup failed: {}", e),
                        ErrorContext::new()
                            .with_field_path("credential")
                            .with_source("credentials"),
                    )
                })
            }
            CredentialRef::AzureAd => {
                let source = self.azure.as_ref().ok_or_else(|| {
                    Error::configuration_with_context(
                        "model uses Azure AD credentials but azure_ad is not configured",
                        ErrorContext::new().with_field_path("azure_ad"),
                    )
                })?;
                Ok(Some(Credential::Bearer(source.token().await?)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedToken;

    #[async_trait]
    impl AzureTokenSource for FixedToken {
        async fn token(&self) -> Result<String> {
            Ok("aad-token".into())
        }
    }

    #[tokio::test]
    async fn test_static_and_none() {
        let r = CredentialResolver::new();
        assert_eq!(r.resolve(&CredentialRef::None).await.unwrap(), None);
        assert_eq!(
            r.resolve(&CredentialRef::Static { key: "k".into() })
                .await
                .unwrap(),
            Some(Credential::ApiKey("k".into()))
        );
    }

    #[tokio::test]
    async fn test_env_lookup() {
        std::env::set_var("AI_GATEWAY_TEST_CRED_KEY", "from-env");
        let r = CredentialResolver::new();
        let cred = r
            .resolve(&CredentialRef::Env {
                var: "AI_GATEWAY_TEST_CRED_KEY".into(),
            })
            .await
            .unwrap();
        assert_eq!(cred, Some(Credential::ApiKey("from-env".into())));

        let missing = r
            .resolve(&CredentialRef::Env {
                var: "AI_GATEWAY_TEST_CRED_MISSING".into(),
            })
            .await;
        assert!(matches!(missing, Err(Error::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_azure_requires_source() {
        assert!(CredentialResolver::new()
            .resolve(&CredentialRef::AzureAd)
            .await
            .is_err());
        let r = CredentialResolver::new().with_azure(Arc::new(FixedToken));
        assert_eq!(
            r.resolve(&CredentialRef::AzureAd).await.unwrap(),
            Some(Credential::Bearer("aad-token".into()))
        );
    }
}
