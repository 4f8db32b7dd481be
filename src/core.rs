//! Top-level assembly: owns a handle to every subsystem and the background
//! task handles for the long-running sampler/cleaner/hot-reload loops.

use std::path::PathBuf;
use std::sync::Arc;

use crate::checkpoint::{Cas, CheckpointManager, CheckpointPaths, Timeline};
use crate::config::Config;
use crate::error::{Result, ShannonError};
use crate::hooks::Hooks;
use crate::notify::NotificationCenter;
use crate::registry::Registry;

/// Wires up the on-disk layout under `project_root` and owns every
/// subsystem's `Arc` handle plus the background loops started on top of
/// them. Dropping or calling [`ShannonCore::shutdown`] stops those loops
/// within the configured grace budget.
pub struct ShannonCore {
    pub config: Config,
    pub paths: CheckpointPaths,
    pub notifications: Arc<NotificationCenter>,
    pub checkpoints: Arc<CheckpointManager>,
    pub registry: Arc<Registry>,
    pub hooks: Arc<Hooks>,
}

impl ShannonCore {
    pub async fn open(project_root: PathBuf, config: Config) -> Result<Self> {
        let paths = CheckpointPaths::new(project_root);
        tokio::fs::create_dir_all(&paths.root)
            .await
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("creating project root: {e}")))?;

        let notifications = Arc::new(NotificationCenter::new());

        let checkpoints = Arc::new(
            CheckpointManager::open(paths.root.clone(), config.cas.compression_level, notifications.clone()).await?,
        );

        let registry = Arc::new(
            Registry::open(&paths.registry_db(), config.registry.clone())
                .await
                .map_err(ShannonError::Storage)?,
        );

        let hooks = Arc::new(
            Hooks::open(
                Some(paths.hooks_dir()),
                paths.root.join("sandbox"),
                notifications.clone(),
                &config.hooks,
            )
            .await?,
        );

        log::info!("shannon core opened at {}", paths.root.display());

        Ok(Self {
            config,
            paths,
            notifications,
            checkpoints,
            registry,
            hooks,
        })
    }

    /// Starts the tracker sampler, monitor sampler, cleaner, and hook
    /// hot-reloader background loops.
    pub async fn start(&self) {
        self.registry.start(&self.config.registry).await;
        self.hooks.start(&self.config.hooks).await;
    }

    /// Signals every background loop and joins them within the configured
    /// grace budget.
    pub async fn shutdown(&self) {
        let grace = self.config.shutdown_grace();
        self.hooks.shutdown(grace).await;
        self.registry.shutdown(grace).await;
        log::info!("shannon core shut down at {}", self.paths.root.display());
    }

    pub fn cas(&self) -> Arc<Cas> {
        self.checkpoints.cas()
    }

    pub fn timeline(&self) -> Arc<Timeline> {
        self.checkpoints.timeline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_shuts_down_cleanly() {
        let dir = tempfile::TempDir::new().unwrap();
        let core = ShannonCore::open(dir.path().to_path_buf(), Config::default()).await.unwrap();
        core.start().await;
        core.shutdown().await;
    }
}
