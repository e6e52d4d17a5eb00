//! Wiring shared by every command: configuration, job store, registry.

use anyhow::{Context, Result};
use kiln_connectors::{ConnectorRegistry, LocalConnector};
use kiln_orchestrator::{JobStore, KilnConfig, NotificationSink, Orchestrator};
use kiln_training::DryRunTrainer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct App {
    config: KilnConfig,
    state_dir: PathBuf,
}

impl App {
    /// Loads `config_path` if given, otherwise the global and local config files.
    pub fn load(config_path: Option<&Path>, state_dir: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => KilnConfig::load_from_file(path)?,
            None => KilnConfig::discover_and_load()?,
        };
        let state_dir = state_dir.unwrap_or_else(|| config.state_dir());
        Ok(Self { config, state_dir })
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn registry() -> ConnectorRegistry {
        ConnectorRegistry::new().with(Arc::new(LocalConnector::new()))
    }

    pub fn open_store(&self) -> Result<Arc<JobStore>> {
        let store = JobStore::open(&self.state_dir)
            .with_context(|| format!("Failed to open job store at {}", self.state_dir.display()))?;
        Ok(Arc::new(store))
    }

    /// Orchestrator over the persisted store, training locally with the dry-run trainer.
    pub fn orchestrator(
        &self,
        sink: Arc<dyn NotificationSink>,
        step_delay_ms: Option<u64>,
    ) -> Result<Orchestrator> {
        let step_delay =
            Duration::from_millis(step_delay_ms.unwrap_or(self.config.local.step_delay_ms));
        Ok(Orchestrator::builder(Self::registry())
            .store(self.open_store()?)
            .sink(sink)
            .trainer(Arc::new(DryRunTrainer::new(step_delay)))
            .config(self.config.orchestrator_config())
            .build())
    }
}
