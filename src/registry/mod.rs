//! Cross-session process registry: tracks OS processes backing Claude
//! sessions, validates them against live system state, monitors their
//! resource usage, and periodically reconciles the registry with reality.

pub mod cleaner;
pub mod monitor;
pub mod storage;
pub mod tracker;
pub mod validator;

pub use cleaner::{CleanupStats, RegistryCleaner};
pub use monitor::{AlertSeverity, ResourceAlert, ResourceMonitor, ResourceStats, ResourceType};
pub use storage::{HistoryEntry, Message, ProcessEntry, ProcessStatus, RegistryStorage};
pub use tracker::{ProcessInfo, ProcessTracker, SystemStats};
pub use validator::{ProcessValidator, RecommendedAction, ValidationResult, ValidationStatus};

use std::path::Path;
use std::sync::Arc;

use crate::config::RegistryConfig;

/// Owns the full registry subsystem: storage, tracker, validator, monitor,
/// and cleaner wired together, with their background loops started and
/// stopped as a unit.
pub struct Registry {
    pub storage: Arc<RegistryStorage>,
    pub tracker: Arc<ProcessTracker>,
    pub validator: Arc<ProcessValidator>,
    pub monitor: Arc<ResourceMonitor>,
    pub cleaner: Arc<RegistryCleaner>,
}

impl Registry {
    pub async fn open(db_path: &Path, config: RegistryConfig) -> anyhow::Result<Self> {
        let storage = Arc::new(RegistryStorage::open(db_path).await?);
        let tracker = Arc::new(ProcessTracker::new(storage.clone()));
        let validator = Arc::new(ProcessValidator::new(storage.clone(), tracker.clone(), config.clone()));
        let monitor = Arc::new(ResourceMonitor::new(storage.clone(), tracker.clone(), config.monitor_history_size));
        let cleaner = Arc::new(RegistryCleaner::new(
            storage.clone(),
            validator.clone(),
            config.clone(),
            tracker.hostname().to_string(),
        ));

        Ok(Self {
            storage,
            tracker,
            validator,
            monitor,
            cleaner,
        })
    }

    pub async fn start(&self, config: &RegistryConfig) {
        self.tracker
            .start_tracking(std::time::Duration::from_secs(config.tracker_sample_interval_secs))
            .await;
        self.monitor
            .start_monitoring(std::time::Duration::from_secs(config.monitor_sample_interval_secs))
            .await;
        self.cleaner
            .start_periodic_cleanup(std::time::Duration::from_secs(config.cleaner_interval_secs))
            .await;
    }

    pub async fn shutdown(&self, grace: std::time::Duration) {
        self.cleaner.stop_periodic_cleanup(grace).await;
        self.monitor.stop_monitoring(grace).await;
        self.tracker.stop_tracking(grace).await;
    }
}
