//! YAML-file model repository.
//!
//! ```yaml
//! models:
//!   - name: gpt-4o
//!     provider: openai
//!     base_url: https://api.openai.com/v1
//!     capabilities: [chat, vision]
//!     credential: { source: env, var: OPENAI_API_KEY }
//!     groups: [staff]
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::{ModelRecord, ModelRepository};
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<ModelRecord>,
}

/// Reads the whole catalog file on every `list`, so edits are picked up by
/// the next refresh.
#[derive(Debug, Clone)]
pub struct FileModelRepository {
    path: PathBuf,
}

impl FileModelRepository {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parse(content: &str) -> Result<Vec<ModelRecord>> {
        let file: CatalogFile = serde_yaml::from_str(content)?;
        Ok(file.models)
    }
}

#[async_trait]
impl ModelRepository for FileModelRepository {
    async fn list(&self) -> Result<Vec<ModelRecord>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read model catalog: {}", e),
                ErrorContext::new()
                    .with_field_path("catalog.path")
                    .with_details(self.path.display().to_string()),
            )
        })?;
        Self::parse(&content).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid model catalog: {}", e),
                ErrorContext::new().with_details(self.path.display().to_string()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CredentialRef;

    const CATALOG: &str = r#"
models:
  - name: gpt-4o
    provider: openai
    base_url: https://api.openai.com/v1
    capabilities: [chat, vision]
    credential: { source: env, var: OPENAI_API_KEY }
    groups: [staff]
  - name: claude
    provider: anthropic
    base_url: https://api.anthropic.com/v1
    capabilities: [chat]
    status: disabled
"#;

    #[test]
    fn test_parse_catalog() {
        let records = FileModelRepository::parse(CATALOG).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].credential,
            CredentialRef::Env {
                var: "OPENAI_API_KEY".into()
            }
        );
        assert_eq!(records[1].status, "disabled");
        assert!(records[1].groups.is_empty());
    }

    #[tokio::test]
    async fn test_list_reads_file() {
        let path = std::env::temp_dir().join(format!("catalog-{}.yaml", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, CATALOG).await.unwrap();
        let repo = FileModelRepository::new(&path);
        let records = repo.list().await.unwrap();
        assert_eq!(records[1].name, "claude");
        tokio::fs::remove_file(&path).await.unwrap();

        let err = repo.list().await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
