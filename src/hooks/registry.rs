use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use crate::error::{Result, ShannonError};

use super::config::{Hook, HookTrigger};

struct Inner {
    hooks: HashMap<String, Hook>,
    trigger_index: HashMap<HookTrigger, HashSet<String>>,
    file_mtimes: HashMap<PathBuf, std::time::SystemTime>,
}

struct RateLimitState {
    last_execution: HashMap<String, chrono::DateTime<chrono::Utc>>,
    execution_log: HashMap<String, Vec<chrono::DateTime<chrono::Utc>>>,
}

/// In-memory hook catalogue, indexed by trigger, with hot-reload from a
/// directory of JSON files and sliding-window rate-limit bookkeeping.
pub struct HookRegistry {
    hooks_dir: Option<PathBuf>,
    inner: RwLock<Inner>,
    rate_limits: RwLock<RateLimitState>,
    stop: Arc<Notify>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    watch_stop: Arc<Notify>,
    watch_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HookRegistry {
    pub fn new(hooks_dir: Option<PathBuf>) -> Self {
        Self {
            hooks_dir,
            inner: RwLock::new(Inner {
                hooks: HashMap::new(),
                trigger_index: HashMap::new(),
                file_mtimes: HashMap::new(),
            }),
            rate_limits: RwLock::new(RateLimitState {
                last_execution: HashMap::new(),
                execution_log: HashMap::new(),
            }),
            stop: Arc::new(Notify::new()),
            task: tokio::sync::Mutex::new(None),
            watch_stop: Arc::new(Notify::new()),
            watch_task: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        if let Some(dir) = self.hooks_dir.clone() {
            let loaded = self.scan_directory(&dir).await?;
            log::info!("hook registry initialized with {loaded} hooks from {}", dir.display());
        }
        Ok(())
    }

    pub async fn register(&self, hook: Hook) -> Result<()> {
        hook.validate()?;
        let mut inner = self.inner.write().await;
        if inner.hooks.contains_key(&hook.name) {
            return Err(ShannonError::Validation(format!("hook name already registered: {}", hook.name)));
        }
        for trigger in &hook.triggers {
            inner.trigger_index.entry(*trigger).or_default().insert(hook.name.clone());
        }
        log::info!("registered hook {} (triggers={:?}, priority={})", hook.name, hook.triggers, hook.priority);
        inner.hooks.insert(hook.name.clone(), hook);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(hook) = inner.hooks.remove(name) else {
            return false;
        };
        for trigger in &hook.triggers {
            if let Some(names) = inner.trigger_index.get_mut(trigger) {
                names.remove(name);
                if names.is_empty() {
                    inner.trigger_index.remove(trigger);
                }
            }
        }
        log::info!("unregistered hook {name}");
        true
    }

    pub async fn get_hook(&self, name: &str) -> Option<Hook> {
        self.inner.read().await.hooks.get(name).cloned()
    }

    pub async fn list_hooks(&self, trigger: Option<HookTrigger>, enabled_only: bool, tags: Option<&[String]>) -> Vec<Hook> {
        let inner = self.inner.read().await;
        let mut hooks: Vec<Hook> = inner.hooks.values().cloned().collect();

        if let Some(trigger) = trigger {
            hooks.retain(|h| h.matches_trigger(trigger));
        }
        if enabled_only {
            hooks.retain(|h| h.enabled);
        }
        if let Some(tags) = tags {
            hooks.retain(|h| tags.iter().any(|t| h.tags.contains(t)));
        }
        hooks.sort_by(|a, b| b.priority.cmp(&a.priority));
        hooks
    }

    pub async fn get_hooks_for_trigger(&self, trigger: HookTrigger, context: Option<&serde_json::Value>) -> Result<Vec<Hook>> {
        let names: HashSet<String> = {
            let inner = self.inner.read().await;
            let mut names = inner.trigger_index.get(&trigger).cloned().unwrap_or_default();
            if trigger != HookTrigger::Custom {
                names.extend(inner.trigger_index.get(&HookTrigger::Custom).cloned().unwrap_or_default());
            }
            names
        };

        let mut hooks = Vec::new();
        for name in names {
            let Some(hook) = self.get_hook(&name).await else { continue };
            if !hook.enabled {
                continue;
            }
            let passes = match context {
                Some(ctx) => hook.evaluate_conditions(ctx)?,
                None => true,
            };
            if passes {
                hooks.push(hook);
            }
        }
        hooks.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(hooks)
    }

    pub async fn enable_hook(&self, name: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(hook) = inner.hooks.get_mut(name) else { return false };
        hook.enabled = true;
        hook.updated_at = chrono::Utc::now();
        true
    }

    pub async fn disable_hook(&self, name: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(hook) = inner.hooks.get_mut(name) else { return false };
        hook.enabled = false;
        hook.updated_at = chrono::Utc::now();
        true
    }

    /// Refuses execution if the hook is within its cooldown window or has
    /// already used up its sliding 60-second execution budget.
    pub async fn check_rate_limit(&self, hook: &Hook) -> bool {
        let mut state = self.rate_limits.write().await;
        let now = chrono::Utc::now();

        if let Some(cooldown) = hook.cooldown {
            if let Some(last) = state.last_execution.get(&hook.name) {
                if (now - *last).num_milliseconds() as f64 / 1000.0 < cooldown {
                    return false;
                }
            }
        }

        if let Some(limit) = hook.rate_limit {
            let log = state.execution_log.entry(hook.name.clone()).or_default();
            log.retain(|t| (now - *t).num_seconds() < 60);
            if log.len() as u32 >= limit {
                return false;
            }
        }

        true
    }

    pub async fn record_execution(&self, hook: &Hook) {
        let mut state = self.rate_limits.write().await;
        let now = chrono::Utc::now();
        state.last_execution.insert(hook.name.clone(), now);
        state.execution_log.entry(hook.name.clone()).or_default().push(now);
    }

    pub async fn scan_directory(&self, directory: &Path) -> Result<usize> {
        if !directory.exists() {
            return Ok(0);
        }
        let mut loaded = 0;

        let entries = std::fs::read_dir(directory)
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("reading hooks dir {}: {e}", directory.display())))?;

        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let mtime = match entry.metadata().and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(_) => continue,
            };

            {
                let inner = self.inner.read().await;
                if inner.file_mtimes.get(&path) == Some(&mtime) {
                    continue;
                }
            }

            match Hook::from_file(&path) {
                Ok(hook) => {
                    self.unregister(&hook.name).await;
                    if let Err(e) = self.register(hook).await {
                        log::error!("failed to register hook from {}: {e}", path.display());
                        continue;
                    }
                    self.inner.write().await.file_mtimes.insert(path.clone(), mtime);
                    loaded += 1;
                }
                Err(e) => log::error!("failed to load hook from {}: {e}", path.display()),
            }
        }

        log::info!("loaded {loaded} hooks from {}", directory.display());
        Ok(loaded)
    }

    pub async fn reload(&self) -> Result<usize> {
        match &self.hooks_dir {
            Some(dir) => self.scan_directory(&dir.clone()).await,
            None => Ok(0),
        }
    }

    pub async fn save_hook(&self, hook: &Hook, directory: Option<&Path>) -> Result<PathBuf> {
        let directory = directory
            .or(self.hooks_dir.as_deref())
            .ok_or_else(|| ShannonError::Storage(anyhow::anyhow!("no directory specified for saving hook")))?;

        std::fs::create_dir_all(directory)
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("creating hooks dir: {e}")))?;

        let filename = format!("{}.json", hook.name.replace(' ', "_").to_lowercase());
        let filepath = directory.join(filename);
        hook.save_to_file(&filepath)?;

        if let Ok(mtime) = std::fs::metadata(&filepath).and_then(|m| m.modified()) {
            self.inner.write().await.file_mtimes.insert(filepath.clone(), mtime);
        }
        log::info!("saved hook {} to {}", hook.name, filepath.display());
        Ok(filepath)
    }

    /// Starts a background task that polls the hooks directory for changes on
    /// an interval, as a coarser complement to any filesystem-event watch.
    pub async fn start_hot_reload(self: &Arc<Self>, interval: std::time::Duration) {
        if self.hooks_dir.is_none() {
            return;
        }
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                if let Err(e) = this.reload().await {
                    log::error!("hook hot-reload failed: {e}");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = this.stop.notified() => return,
                }
            }
        }));
    }

    pub async fn stop_hot_reload(&self, grace: std::time::Duration) {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else { return };
        self.stop.notify_waiters();
        let _ = tokio::time::timeout(grace, handle).await;
    }

    /// Starts a filesystem watch on the hooks directory for environments
    /// where the poll interval in [`start_hot_reload`] is too coarse.
    /// Debounces bursts of events behind a short delay before reloading.
    pub async fn start_watch_reload(self: &Arc<Self>, debounce: std::time::Duration) -> Result<()> {
        let Some(dir) = self.hooks_dir.clone() else { return Ok(()) };
        let mut watch_task = self.watch_task.lock().await;
        if watch_task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        })
        .map_err(|e| ShannonError::Os(anyhow::anyhow!("creating filesystem watcher: {e}")))?;
        notify::Watcher::watch(&mut watcher, &dir, notify::RecursiveMode::NonRecursive)
            .map_err(|e| ShannonError::Os(anyhow::anyhow!("watching hooks dir {}: {e}", dir.display())))?;

        let this = Arc::clone(self);
        *watch_task = Some(tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the task.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        if event.is_none() {
                            return;
                        }
                        tokio::time::sleep(debounce).await;
                        while rx.try_recv().is_ok() {}
                        if let Err(e) = this.reload().await {
                            log::error!("hook watch-reload failed: {e}");
                        }
                    }
                    _ = this.watch_stop.notified() => return,
                }
            }
        }));
        Ok(())
    }

    pub async fn stop_watch_reload(&self, grace: std::time::Duration) {
        let mut watch_task = self.watch_task.lock().await;
        let Some(handle) = watch_task.take() else { return };
        self.watch_stop.notify_waiters();
        let _ = tokio::time::timeout(grace, handle).await;
    }

    pub async fn stats(&self) -> serde_json::Value {
        let inner = self.inner.read().await;
        let trigger_counts: HashMap<String, usize> = inner
            .trigger_index
            .iter()
            .map(|(t, names)| (format!("{t:?}"), names.len()))
            .collect();
        serde_json::json!({
            "total_hooks": inner.hooks.len(),
            "enabled_hooks": inner.hooks.values().filter(|h| h.enabled).count(),
            "trigger_counts": trigger_counts,
            "hooks_with_rate_limits": inner.hooks.values().filter(|h| h.rate_limit.is_some() || h.cooldown.is_some()).count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::config::{HookAction, HookActionType};

    fn sample_hook(name: &str, trigger: HookTrigger) -> Hook {
        Hook {
            name: name.into(),
            description: String::new(),
            triggers: vec![trigger],
            actions: vec![HookAction {
                kind: HookActionType::Log,
                ..Default::default()
            }],
            enabled: true,
            priority: 0,
            conditions: vec![],
            async_execution: false,
            timeout: None,
            retry_count: 0,
            retry_delay: 1.0,
            sandbox: true,
            allowed_paths: vec![],
            environment: HashMap::new(),
            rate_limit: None,
            cooldown: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn register_then_lookup_by_trigger() {
        let registry = HookRegistry::new(None);
        registry.register(sample_hook("h1", HookTrigger::FileModify)).await.unwrap();

        let hooks = registry.get_hooks_for_trigger(HookTrigger::FileModify, None).await.unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].name, "h1");
    }

    #[tokio::test]
    async fn custom_hook_matches_any_trigger() {
        let registry = HookRegistry::new(None);
        registry.register(sample_hook("custom", HookTrigger::Custom)).await.unwrap();

        let hooks = registry.get_hooks_for_trigger(HookTrigger::SessionStart, None).await.unwrap();
        assert_eq!(hooks.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_blocks_after_threshold() {
        let registry = HookRegistry::new(None);
        let mut hook = sample_hook("limited", HookTrigger::Custom);
        hook.rate_limit = Some(2);

        assert!(registry.check_rate_limit(&hook).await);
        registry.record_execution(&hook).await;
        assert!(registry.check_rate_limit(&hook).await);
        registry.record_execution(&hook).await;
        assert!(!registry.check_rate_limit(&hook).await);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = HookRegistry::new(None);
        registry.register(sample_hook("h1", HookTrigger::Custom)).await.unwrap();
        assert!(registry.register(sample_hook("h1", HookTrigger::Custom)).await.is_err());
    }
}
