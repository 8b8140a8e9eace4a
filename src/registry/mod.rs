//! 模型目录：以无锁快照缓存模型描述，按技术名 O(1) 解析，并由外部仓库异步刷新
//!
//! Model catalog.
//!
//! [`ModelResolver`] serves lookups from an immutable snapshot held in an
//! [`ArcSwap`]. A refresh builds a complete new snapshot from a
//! [`ModelRepository`] and swaps it in; in-flight requests keep the
//! descriptor `Arc` they already resolved.
//!
//! Raw records carry provider, capability and status as strings. They are
//! parsed once here into closed enums. A record that fails to parse is either
//! skipped and reported (default) or aborts the whole refresh (`strict`).

pub mod file;

pub use file::FileModelRepository;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::types::{Capability, CredentialRef, ModelDescriptor, ModelStatus, Provider};
use crate::{Error, ErrorContext, Result};

/// Model record as stored by the catalog owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub provider: String,
    pub base_url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub credential: CredentialRef,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub upstream_model: Option<String>,
}

fn default_status() -> String {
    "active".to_string()
}

impl ModelRecord {
    /// Validate and convert into a descriptor.
    pub fn into_descriptor(self) -> Result<ModelDescriptor> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation_with_context(
                "model name must not be empty",
                ErrorContext::new().with_field_path("name"),
            ));
        }
        let provider: Provider = self.provider.parse()?;
        let base_url = url::Url::parse(self.base_url.trim()).map_err(|e| {
            Error::validation_with_context(
                format!("invalid base URL: {}", e),
                ErrorContext::new()
                    .with_field_path("base_url")
                    .with_details(self.base_url.clone()),
            )
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::validation_with_context(
                format!("unsupported base URL scheme '{}'", base_url.scheme()),
                ErrorContext::new().with_field_path("base_url"),
            ));
        }
        let capabilities = self
            .capabilities
            .iter()
            .map(|c| c.parse::<Capability>())
            .collect::<Result<BTreeSet<_>>>()?;
        let status: ModelStatus = self.status.parse()?;

        Ok(ModelDescriptor {
            display_name: self.display_name.unwrap_or_else(|| name.clone()),
            name,
            provider,
            base_url,
            capabilities,
            credential: self.credential,
            status,
            allowed_groups: self.groups.into_iter().collect(),
            deployment: self.deployment,
            api_version: self.api_version,
            upstream_model: self.upstream_model,
        })
    }
}

/// Source of model records (owned by an external catalog).
#[async_trait]
pub trait ModelRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<ModelRecord>>;

    async fn list_by_group(&self, group: &str) -> Result<Vec<ModelRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.groups.iter().any(|g| g == group))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub name: String,
    pub reason: String,
}

/// Outcome of one catalog refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub loaded: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

type Catalog = BTreeMap<String, Arc<ModelDescriptor>>;

/// Name-to-descriptor lookup over a hot-swappable snapshot.
#[derive(Debug)]
pub struct ModelResolver {
    catalog: ArcSwap<Catalog>,
    strict: bool,
}

impl Default for ModelResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelResolver {
    pub fn new() -> Self {
        Self {
            catalog: ArcSwap::from_pointee(Catalog::new()),
            strict: false,
        }
    }

    /// Abort a refresh on the first invalid record instead of skipping it.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_models(self, models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        self.replace(models);
        self
    }

    /// Swap in a catalog built from already validated descriptors.
    pub fn replace(&self, models: impl IntoIterator<Item = ModelDescriptor>) {
        let catalog: Catalog = models
            .into_iter()
            .map(|m| (m.name.clone(), Arc::new(m)))
            .collect();
        self.catalog.store(Arc::new(catalog));
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<ModelDescriptor>> {
        self.catalog
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                model: name.to_string(),
            })
    }

    /// Every model, in name order.
    pub fn list(&self) -> Vec<Arc<ModelDescriptor>> {
        self.catalog.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.catalog.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the catalog from raw records.
    ///
    /// In strict mode the current catalog is kept when any record is invalid.
    pub fn apply(&self, records: Vec<ModelRecord>) -> Result<SyncReport> {
        let mut catalog = Catalog::new();
        let mut report = SyncReport::default();

        for record in records {
            let name = record.name.clone();
            let outcome = record.into_descriptor().and_then(|d| {
                if catalog.contains_key(&d.name) {
                    Err(Error::validation_with_context(
                        "duplicate model name",
                        ErrorContext::new().with_field_path("name"),
                    ))
                } else {
                    Ok(d)
                }
            });
            match outcome {
                Ok(d) => {
                    catalog.insert(d.name.clone(), Arc::new(d));
                }
                Err(e) if self.strict => {
                    warn!(model = %name, error = %e, "invalid model record, catalog left unchanged");
                    return Err(Error::configuration_with_context(
                        format!("invalid model record '{}': {}", name, e),
                        ErrorContext::new().with_source("model_sync"),
                    ));
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "skipping invalid model record");
                    report.rejected.push(RejectedRecord {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.loaded = catalog.len();
        self.catalog.store(Arc::new(catalog));
        info!(
            loaded = report.loaded,
            rejected = report.rejected.len(),
            "model catalog refreshed"
        );
        Ok(report)
    }

    pub async fn refresh(&self, repository: &dyn ModelRepository) -> Result<SyncReport> {
        let records = repository.list().await?;
        self.apply(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, provider: &str) -> ModelRecord {
        ModelRecord {
            name: name.into(),
            display_name: None,
            provider: provider.into(),
            base_url: "https://api.example.com/v1".into(),
            capabilities: vec!["chat".into()],
            credential: CredentialRef::None,
            status: "active".into(),
            groups: vec!["staff".into()],
            deployment: None,
            api_version: None,
            upstream_model: None,
        }
    }

    struct Fixed(Vec<ModelRecord>);

    #[async_trait]
    impl ModelRepository for Fixed {
        async fn list(&self) -> Result<Vec<ModelRecord>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_record_conversion() {
        let mut r = record("gpt-4o", "Azure");
        r.capabilities = vec!["chat".into(), "vision".into()];
        r.status = "approved".into();
        let d = r.into_descriptor().unwrap();
        assert_eq!(d.provider, Provider::AzureOpenAi);
        assert_eq!(d.display_name, "gpt-4o");
        assert!(d.supports(Capability::Vision));
        assert!(d.is_active());
        assert!(d.allowed_groups.contains("staff"));
    }

    #[test]
    fn test_invalid_records() {
        assert!(record("m", "gemini").into_descriptor().is_err());
        let mut bad_url = record("m", "openai");
        bad_url.base_url = "ftp://x".into();
        assert!(bad_url.into_descriptor().is_err());
        let mut bad_cap = record("m", "openai");
        bad_cap.capabilities = vec!["telepathy".into()];
        assert!(bad_cap.into_descriptor().is_err());
        assert!(record("  ", "openai").into_descriptor().is_err());
    }

    #[test]
    fn test_lenient_sync_skips_and_reports() {
        let resolver = ModelResolver::new();
        let report = resolver
            .apply(vec![
                record("a", "openai"),
                record("b", "unknown"),
                record("a", "anthropic"),
            ])
            .unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].name, "b");
        assert_eq!(resolver.resolve("a").unwrap().provider, Provider::OpenAi);
    }

    #[test]
    fn test_strict_sync_keeps_old_catalog() {
        let resolver = ModelResolver::new().with_strict(true);
        resolver.apply(vec![record("a", "openai")]).unwrap();
        let err = resolver
            .apply(vec![record("b", "openai"), record("c", "unknown")])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(resolver.resolve("a").is_ok());
        assert!(resolver.resolve("b").is_err());
    }

    #[test]
    fn test_resolve_and_list() {
        let resolver = ModelResolver::new();
        let mut disabled = record("old", "openai");
        disabled.status = "disabled".into();
        let mut other = record("private", "openai");
        other.groups = vec!["research".into()];
        resolver
            .apply(vec![record("a", "openai"), disabled, other])
            .unwrap();

        // disabled models still resolve; the gate rejects them
        assert!(!resolver.resolve("old").unwrap().is_active());
        assert!(matches!(
            resolver.resolve("missing"),
            Err(Error::NotFound { .. })
        ));

        let names: Vec<String> = resolver.list().iter().map(|m| m.name.clone()).collect();
        assert_eq!(names, vec!["a", "old", "private"]);
        assert_eq!(resolver.len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_swaps_snapshot() {
        let resolver = ModelResolver::new();
        resolver.apply(vec![record("a", "openai")]).unwrap();
        let held = resolver.resolve("a").unwrap();

        let repo = Fixed(vec![record("b", "anthropic")]);
        let report = resolver.refresh(&repo).await.unwrap();
        assert!(report.is_clean());
        assert!(resolver.resolve("a").is_err());
        // a resolved descriptor outlives the swap
        assert_eq!(held.name, "a");

        let staff = repo.list_by_group("staff").await.unwrap();
        assert_eq!(staff.len(), 1);
        assert!(repo.list_by_group("nobody").await.unwrap().is_empty());
    }
}
