//! 授权模块：根据调用方所属组与模型状态决定是否放行。
//!
//! Authorization gate and the caller identity collaborator.
//!
//! [`AuthorizationGate::authorize`] is a pure decision over the caller's
//! groups and a resolved [`ModelDescriptor`]. Identity (bearer token to group
//! set) comes from an [`AuthorizationService`]; token issuance and validation
//! live outside the gateway, and [`StaticAuthorizationService`] is the
//! in-crate default backed by configuration.

use crate::types::ModelDescriptor;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No usable caller identity.
    Unauthenticated,
    /// Caller groups do not intersect the model's allowed groups.
    GroupNotAllowed,
    ModelDisabled,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "unauthenticated",
            DenyReason::GroupNotAllowed => "group_not_allowed",
            DenyReason::ModelDisabled => "model_disabled",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    GroupMember,
    AdminGroup,
}

impl AllowReason {
    pub fn code(&self) -> &'static str {
        match self {
            AllowReason::GroupMember => "group_member",
            AllowReason::AdminGroup => "admin_group",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Allow(AllowReason),
    Deny(DenyReason),
}

impl AuthorizationDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthorizationDecision::Allow(_))
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            AuthorizationDecision::Allow(r) => r.code(),
            AuthorizationDecision::Deny(r) => r.code(),
        }
    }

    /// Turn a deny into an `Authorization` error naming the model.
    pub fn into_result(self, model: &str) -> Result<AllowReason> {
        match self {
            AuthorizationDecision::Allow(r) => Ok(r),
            AuthorizationDecision::Deny(reason) => {
                let message = match reason {
                    DenyReason::ModelDisabled => format!("The model '{}' is disabled", model),
                    DenyReason::GroupNotAllowed => {
                        format!("You do not have access to the model '{}'", model)
                    }
                    DenyReason::Unauthenticated => "Missing or invalid credentials".to_string(),
                };
                Err(Error::denied(reason, message))
            }
        }
    }
}

/// Group-based access check.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationGate {
    admin_group: Option<String>,
}

impl AuthorizationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of `group` may use every active model.
    pub fn with_admin_group(mut self, group: impl Into<String>) -> Self {
        self.admin_group = Some(group.into());
        self
    }

    pub fn authorize(
        &self,
        caller_groups: &BTreeSet<String>,
        model: &ModelDescriptor,
    ) -> AuthorizationDecision {
        if !model.is_active() {
            return AuthorizationDecision::Deny(DenyReason::ModelDisabled);
        }
        if let Some(admin) = &self.admin_group {
            if caller_groups.contains(admin) {
                return AuthorizationDecision::Allow(AllowReason::AdminGroup);
            }
        }
        if caller_groups
            .intersection(&model.allowed_groups)
            .next()
            .is_some()
        {
            AuthorizationDecision::Allow(AllowReason::GroupMember)
        } else {
            AuthorizationDecision::Deny(DenyReason::GroupNotAllowed)
        }
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub subject: String,
    pub groups: BTreeSet<String>,
}

/// Maps a bearer token to the caller's identity and groups.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn identify(&self, bearer: Option<&str>) -> Result<CallerIdentity>;
}

/// Configured caller entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCaller {
    pub subject: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Token table from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizationService {
    tokens: HashMap<String, StaticCaller>,
    anonymous_groups: Option<BTreeSet<String>>,
}

impl StaticAuthorizationService {
    pub fn new(tokens: HashMap<String, StaticCaller>) -> Self {
        Self {
            tokens,
            anonymous_groups: None,
        }
    }

    /// Requests without a bearer token are admitted with these groups.
    pub fn with_anonymous_groups(mut self, groups: impl IntoIterator<Item = String>) -> Self {
        self.anonymous_groups = Some(groups.into_iter().collect());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>, caller: StaticCaller) -> Self {
        self.tokens.insert(token.into(), caller);
        self
    }
}

#[async_trait]
impl AuthorizationService for StaticAuthorizationService {
    async fn identify(&self, bearer: Option<&str>) -> Result<CallerIdentity> {
        match bearer {
            Some(token) => self
                .tokens
                .get(token)
                .map(|c| CallerIdentity {
                    subject: c.subject.clone(),
                    groups: c.groups.iter().cloned().collect(),
                })
                .ok_or_else(|| {
                    Error::denied(DenyReason::Unauthenticated, "Invalid bearer token")
                }),
            None => match &self.anonymous_groups {
                Some(groups) => Ok(CallerIdentity {
                    subject: "anonymous".to_string(),
                    groups: groups.clone(),
                }),
                None => Err(Error::denied(
                    DenyReason::Unauthenticated,
                    "Missing bearer token",
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CredentialRef, ModelStatus, Provider};
    use url::Url;

    fn model(status: ModelStatus, groups: &[&str]) -> ModelDescriptor {
        ModelDescriptor {
            name: "gpt-4o".into(),
            display_name: "GPT-4o".into(),
            provider: Provider::OpenAi,
            base_url: Url::parse("https://api.openai.com/v1").unwrap(),
            capabilities: Default::default(),
            credential: CredentialRef::None,
            status,
            allowed_groups: groups.iter().map(|g| g.to_string()).collect(),
            deployment: None,
            api_version: None,
            upstream_model: None,
        }
    }

    fn groups(g: &[&str]) -> BTreeSet<String> {
        g.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_group_intersection() {
        let gate = AuthorizationGate::new();
        let m = model(ModelStatus::Active, &["research", "ops"]);
        assert_eq!(
            gate.authorize(&groups(&["ops"]), &m),
            AuthorizationDecision::Allow(AllowReason::GroupMember)
        );
        assert_eq!(
            gate.authorize(&groups(&["sales"]), &m),
            AuthorizationDecision::Deny(DenyReason::GroupNotAllowed)
        );
        assert_eq!(
            gate.authorize(&groups(&[]), &m),
            AuthorizationDecision::Deny(DenyReason::GroupNotAllowed)
        );
    }

    #[test]
    fn test_disabled_model_denied_even_for_admin() {
        let gate = AuthorizationGate::new().with_admin_group("admins");
        let m = model(ModelStatus::Disabled, &["research"]);
        let decision = gate.authorize(&groups(&["admins", "research"]), &m);
        assert_eq!(decision, AuthorizationDecision::Deny(DenyReason::ModelDisabled));
        assert_eq!(decision.reason_code(), "model_disabled");

        let err = decision.into_result("gpt-4o").unwrap_err();
        assert!(matches!(
            err,
            Error::Authorization {
                reason: DenyReason::ModelDisabled,
                ..
            }
        ));
    }

    #[test]
    fn test_admin_bypasses_group_check() {
        let gate = AuthorizationGate::new().with_admin_group("admins");
        let m = model(ModelStatus::Active, &["research"]);
        assert!(gate.authorize(&groups(&["admins"]), &m).is_allowed());
    }

    #[tokio::test]
    async fn test_static_service() {
        let svc = StaticAuthorizationService::default().with_token(
            "t-1",
            StaticCaller {
                subject: "alice".into(),
                groups: vec!["research".into()],
            },
        );
        let id = svc.identify(Some("t-1")).await.unwrap();
        assert_eq!(id.subject, "alice");
        assert!(id.groups.contains("research"));
        assert!(svc.identify(Some("nope")).await.is_err());
        assert!(svc.identify(None).await.is_err());

        let open = svc.with_anonymous_groups(vec!["public".to_string()]);
        assert!(open.identify(None).await.unwrap().groups.contains("public"));
    }
}
