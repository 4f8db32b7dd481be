//! Hook execution subsystem: a trigger-indexed catalogue of user-defined
//! hooks, a sandboxed executor for their actions, and a library of built-in
//! templates for common automations.

pub mod config;
pub mod engine;
pub mod registry;
pub mod sandbox;
pub mod templates;

pub use config::{Hook, HookAction, HookActionType, HookCondition, HookTrigger};
pub use engine::{CustomFunction, ExecutionResult, HookEngine};
pub use registry::HookRegistry;
pub use sandbox::{ExecutionOutcome, HookSandbox, SandboxLimits};
pub use templates::{HookTemplate, TemplateManager, VariableDef};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::HookConfig;
use crate::error::Result;
use crate::notify::NotificationCenter;

/// Owns the full hook subsystem: registry, sandbox, and engine wired
/// together, with hot-reload started and stopped as a unit.
pub struct Hooks {
    pub registry: Arc<HookRegistry>,
    pub sandbox: Arc<HookSandbox>,
    pub engine: Arc<HookEngine>,
    pub templates: Arc<TemplateManager>,
}

impl Hooks {
    pub async fn open(
        hooks_dir: Option<PathBuf>,
        sandbox_root: PathBuf,
        notifications: Arc<NotificationCenter>,
        config: &HookConfig,
    ) -> Result<Self> {
        let templates_dir = hooks_dir.as_ref().map(|d| d.join("templates"));

        let registry = Arc::new(HookRegistry::new(hooks_dir));
        registry.initialize().await?;

        let sandbox = Arc::new(HookSandbox::new(
            sandbox_root,
            SandboxLimits {
                max_memory_bytes: config.sandbox_max_memory_bytes,
                max_cpu_time_secs: config.sandbox_max_cpu_time_secs,
                max_file_size_bytes: config.sandbox_max_file_size_bytes,
                max_processes: config.sandbox_max_processes,
                max_open_files: config.sandbox_max_open_files,
            },
        ));
        sandbox.initialize().await?;

        let engine = Arc::new(HookEngine::new(
            registry.clone(),
            sandbox.clone(),
            notifications,
            HashMap::new(),
            config.execution_history_size,
        ));

        let templates = Arc::new(TemplateManager::new());
        templates.initialize(templates_dir.as_deref()).await?;

        Ok(Self {
            registry,
            sandbox,
            engine,
            templates,
        })
    }

    pub async fn start(&self, config: &HookConfig) {
        self.registry
            .start_hot_reload(Duration::from_secs(config.reload_poll_interval_secs))
            .await;
        if let Err(e) = self.registry.start_watch_reload(Duration::from_millis(200)).await {
            log::warn!("filesystem watch for hooks unavailable, relying on polling: {e}");
        }
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.registry.stop_watch_reload(grace).await;
        self.registry.stop_hot_reload(grace).await;
    }

    pub async fn install_template(&self, template_name: &str, hook_name: &str, variables: Option<HashMap<String, serde_json::Value>>) -> Result<Hook> {
        let hook = self.templates.create_hook_from_template(template_name, hook_name, variables, None).await?;
        self.registry.register(hook.clone()).await?;
        Ok(hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_with_empty_hooks_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let hooks = Hooks::open(
            None,
            dir.path().join("sandbox"),
            Arc::new(NotificationCenter::new()),
            &HookConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(hooks.registry.list_hooks(None, false, None).await.len(), 0);
    }

    #[tokio::test]
    async fn install_template_registers_hook() {
        let dir = tempfile::TempDir::new().unwrap();
        let hooks = Hooks::open(
            None,
            dir.path().join("sandbox"),
            Arc::new(NotificationCenter::new()),
            &HookConfig::default(),
        )
        .await
        .unwrap();

        let vars = HashMap::from([("message".to_string(), serde_json::json!("release"))]);
        hooks.install_template("git_commit", "release-commit", Some(vars)).await.unwrap();
        assert!(hooks.registry.get_hook("release-commit").await.is_some());
    }
}
