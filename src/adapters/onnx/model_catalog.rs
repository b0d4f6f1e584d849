use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::application::ports::ModelCatalogPort;
use crate::domain::config::ModelConfig;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::model::ModelFiles;

/// Resolves model identifiers to `<root>/<identifier>/` directories.
pub struct OnnxModelCatalog {
    root: PathBuf,
}

impl OnnxModelCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ModelCatalogPort for OnnxModelCatalog {
    async fn resolve(&self, model: &ModelConfig) -> DomainResult<ModelFiles> {
        let name = model.model_identifier.trim();
        if name.is_empty() {
            return Err(DomainError::InvalidInput("model identifier empty".into()));
        }
        if Path::new(name).is_absolute() || name.split('/').any(|part| part == "..") {
            return Err(DomainError::InvalidInput(format!("invalid model identifier: {name}")));
        }

        let dir = self.root.join(name);
        let onnx_path = dir.join("model.onnx");
        let config_path = dir.join("config.json");
        for required in [&onnx_path, &config_path] {
            if !tokio::fs::try_exists(required).await.unwrap_or(false) {
                return Err(DomainError::NotFound(format!(
                    "model file not found: {}",
                    required.display()
                )));
            }
        }

        let preprocessor = dir.join("preprocessor_config.json");
        let preprocessor_path = tokio::fs::try_exists(&preprocessor)
            .await
            .unwrap_or(false)
            .then_some(preprocessor);

        Ok(ModelFiles {
            name: name.to_string(),
            onnx_path,
            config_path,
            preprocessor_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ModelConfig {
        ModelConfig {
            model_identifier: name.to_string(),
            ..ModelConfig::default()
        }
    }

    #[tokio::test]
    async fn resolves_complete_model_dir() -> anyhow::Result<()> {
        let root = tempfile::TempDir::new()?;
        let dir = root.path().join("facebook/detr-resnet-50");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("model.onnx"), b"onnx")?;
        std::fs::write(dir.join("config.json"), b"{}")?;

        let catalog = OnnxModelCatalog::new(root.path());
        let files = catalog.resolve(&config("facebook/detr-resnet-50")).await?;
        assert_eq!(files.onnx_path, dir.join("model.onnx"));
        assert!(files.preprocessor_path.is_none());

        std::fs::write(dir.join("preprocessor_config.json"), b"{}")?;
        let files = catalog.resolve(&config("facebook/detr-resnet-50")).await?;
        assert_eq!(files.preprocessor_path, Some(dir.join("preprocessor_config.json")));
        Ok(())
    }

    #[tokio::test]
    async fn missing_files_are_not_found() -> anyhow::Result<()> {
        let root = tempfile::TempDir::new()?;
        std::fs::create_dir_all(root.path().join("m"))?;
        std::fs::write(root.path().join("m/model.onnx"), b"onnx")?;

        let catalog = OnnxModelCatalog::new(root.path());
        let err = catalog.resolve(&config("m")).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_escaping_identifiers() {
        let catalog = OnnxModelCatalog::new("models");
        let err = catalog.resolve(&config("../secrets")).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidInput(_)));
    }
}
