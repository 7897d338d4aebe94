//! honed - validation-refinement engine
//!
//! Wires the checkpoint store, adapters and collaborators from a [`Config`]
//! into an [`Orchestrator`].

pub mod adapter;
pub mod admission;
pub mod aggregator;
pub mod checkpoint;
pub mod collaborator;
pub mod orchestrator;
pub mod process;
pub mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hone_core::{Config, ConfigError};
use thiserror::Error;
use tracing::info;

use adapter::build_adapters;
use checkpoint::CheckpointError;
use collaborator::{CodeGenerator, CommandCollaborator, Planner, UnconfiguredGenerator};
use orchestrator::{Orchestrator, OrchestratorSettings};
use storage::SqliteStore;

pub use orchestrator::OrchestratorError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default database path (`$XDG_DATA_HOME/honed/hone.db`).
pub fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("honed").join("hone.db")
}

/// A configured engine: the store plus the orchestrator driving runs over it.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    db_path: PathBuf,
    orchestrator: Orchestrator,
}

impl Engine {
    /// Validate `config`, open the store at `db_path` and build the
    /// orchestrator. When `generator_cmd` is set it serves as planner,
    /// generator and documenter.
    pub async fn new(config: Config, db_path: &Path) -> Result<Self, EngineError> {
        config.validate()?;

        let store = SqliteStore::new(db_path).await?;
        store.migrate_embedded().await?;

        let adapters = build_adapters(&config);
        let settings = OrchestratorSettings::from_config(&config);

        let orchestrator = match &config.generator_cmd {
            Some(cmd) => {
                let collaborator = Arc::new(CommandCollaborator::new(
                    cmd.clone(),
                    std::env::current_dir()?,
                    Duration::from_secs(config.generator_timeout_sec),
                ));
                let generator: Arc<dyn CodeGenerator> =
                    Arc::<CommandCollaborator>::clone(&collaborator);
                let planner: Arc<dyn Planner> = Arc::<CommandCollaborator>::clone(&collaborator);
                Orchestrator::builder(Arc::new(store), generator, adapters)
                    .planner(planner)
                    .documenter(collaborator)
                    .settings(settings)
                    .build()
            }
            None => Orchestrator::builder(Arc::new(store), Arc::new(UnconfiguredGenerator), adapters)
                .settings(settings)
                .build(),
        };

        info!(
            db = %db_path.display(),
            adapters = config.adapters.len(),
            max_concurrent = config.max_concurrent_workflows,
            policy = config.admission_policy.as_str(),
            "engine ready"
        );

        Ok(Self {
            config,
            db_path: db_path.to_path_buf(),
            orchestrator,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn engine_opens_store_and_validates_config() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("hone.db");
        let engine = Engine::new(Config::default(), &db_path).await.unwrap();
        assert!(db_path.exists());
        assert!(engine.orchestrator().active_runs().await.is_empty());
        assert_eq!(engine.db_path(), db_path);
    }

    #[tokio::test]
    async fn engine_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.adapters.push("tflint".to_string());
        let err = Engine::new(config, &dir.path().join("hone.db")).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::MissingAdapterCommand(_))));
    }

    #[test]
    fn default_db_path_ends_with_hone_db() {
        assert!(default_db_path().ends_with("honed/hone.db"));
    }
}
