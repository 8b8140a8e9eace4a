//! Model descriptors and the closed enums they are built from.
//!
//! Provider, capability and status strings are parsed exactly once, when a
//! raw catalog record is registered. Nothing downstream branches on strings.

use crate::{Error, ErrorContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Upstream wire protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    AzureOpenAi,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::AzureOpenAi => "azure_openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Provider::OpenAi),
            "azure" | "azure_openai" | "azureopenai" | "azure-openai" => Ok(Provider::AzureOpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            other => Err(Error::validation_with_context(
                format!("unknown provider '{}'", other),
                ErrorContext::new()
                    .with_field_path("provider")
                    .with_details("expected one of: openai, azure_openai, anthropic"),
            )),
        }
    }
}

/// Endpoint shape a model can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Completion,
    Embeddings,
    Vision,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::Completion => "completion",
            Capability::Embeddings => "embeddings",
            Capability::Vision => "vision",
        }
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(Capability::Chat),
            "completion" | "completions" => Ok(Capability::Completion),
            "embeddings" | "embedding" => Ok(Capability::Embeddings),
            "vision" => Ok(Capability::Vision),
            other => Err(Error::validation_with_context(
                format!("unknown capability '{}'", other),
                ErrorContext::new().with_field_path("capabilities"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Active,
    Disabled,
}

impl FromStr for ModelStatus {
    type Err = Error;

    /// Lifecycle states other than approved all map to `Disabled`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "approved" => Ok(ModelStatus::Active),
            "disabled" | "new" | "pending" | "rejected" | "deprecated" | "retired" => {
                Ok(ModelStatus::Disabled)
            }
            other => Err(Error::validation_with_context(
                format!("unknown model status '{}'", other),
                ErrorContext::new().with_field_path("status"),
            )),
        }
    }
}

/// Where a model's upstream credential comes from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CredentialRef {
    #[default]
    None,
    Static {
        key: String,
    },
    Env {
        var: String,
    },
    Keyring {
        service: String,
        account: String,
    },
    /// Azure AD client-credentials token shared by all Azure models.
    AzureAd,
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialRef::None => f.write_str("None"),
            CredentialRef::Static { .. } => f.write_str("Static { key: <redacted> }"),
            CredentialRef::Env { var } => f.debug_struct("Env").field("var", var).finish(),
            CredentialRef::Keyring { service, account } => f
                .debug_struct("Keyring")
                .field("service", service)
                .field("account", account)
                .finish(),
            CredentialRef::AzureAd => f.write_str("AzureAd"),
        }
    }
}

/// Circuit breaker key: one breaker per provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub provider: Provider,
    pub base_url: String,
}

impl EndpointKey {
    pub fn new(provider: Provider, base_url: impl Into<String>) -> Self {
        Self {
            provider,
            base_url: base_url.into(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.provider, self.base_url)
    }
}

/// Read-only description of a routable model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    /// Unique technical name callers put in `model`.
    pub name: String,
    pub display_name: String,
    pub provider: Provider,
    pub base_url: Url,
    pub capabilities: BTreeSet<Capability>,
    pub credential: CredentialRef,
    pub status: ModelStatus,
    pub allowed_groups: BTreeSet<String>,
    /// Azure deployment name; defaults to the technical name.
    pub deployment: Option<String>,
    pub api_version: Option<String>,
    /// Model id sent upstream when it differs from the technical name.
    pub upstream_model: Option<String>,
}

impl ModelDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_active(&self) -> bool {
        self.status == ModelStatus::Active
    }

    pub fn wire_model(&self) -> &str {
        self.upstream_model.as_deref().unwrap_or(&self.name)
    }

    pub fn deployment(&self) -> &str {
        self.deployment.as_deref().unwrap_or(&self.name)
    }

    /// Base URL without a trailing slash, used for path joining and breaker keys.
    pub fn base(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    pub fn endpoint_key(&self) -> EndpointKey {
        EndpointKey::new(self.provider, self.base())
    }
}
