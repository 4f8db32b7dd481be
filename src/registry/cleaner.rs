use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::RegistryConfig;

use super::storage::{ProcessEntry, ProcessStatus, RegistryStorage};
use super::validator::{ProcessValidator, ValidationStatus};

#[derive(Debug, Clone, Serialize)]
pub struct CleanupStats {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub processes_checked: usize,
    pub processes_removed: usize,
    pub zombies_killed: usize,
    pub orphans_registered: usize,
    pub stale_entries_removed: usize,
    pub history_entries_purged: usize,
    pub messages_expired: usize,
    pub errors: Vec<String>,
}

impl CleanupStats {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            completed_at: started_at,
            processes_checked: 0,
            processes_removed: 0,
            zombies_killed: 0,
            orphans_registered: 0,
            stale_entries_removed: 0,
            history_entries_purged: 0,
            messages_expired: 0,
            errors: Vec::new(),
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"session_[a-f0-9-]+").unwrap())
}

fn extract_session_id(cmdline: &[String]) -> Option<String> {
    for (i, arg) in cmdline.iter().enumerate() {
        if matches!(arg.as_str(), "--session" | "--session-id" | "-s") {
            if let Some(next) = cmdline.get(i + 1) {
                return Some(next.clone());
            }
        } else if let Some(value) = arg.strip_prefix("--session=") {
            return Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("--session-id=") {
            return Some(value.to_string());
        }
    }

    let joined = cmdline.join(" ");
    session_id_pattern().find(&joined).map(|m| m.as_str().to_string())
}

/// Periodic reconciliation between what the registry believes and what the OS
/// actually has running: removes dead/hijacked/zombie entries, registers
/// orphaned Claude processes, and enforces storage retention.
pub struct RegistryCleaner {
    storage: Arc<RegistryStorage>,
    validator: Arc<ProcessValidator>,
    config: RegistryConfig,
    hostname: String,
    stop: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryCleaner {
    pub fn new(storage: Arc<RegistryStorage>, validator: Arc<ProcessValidator>, config: RegistryConfig, hostname: String) -> Self {
        Self {
            storage,
            validator,
            config,
            hostname,
            stop: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub async fn start_periodic_cleanup(self: &Arc<Self>, interval: std::time::Duration) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            log::warn!("cleanup task already running");
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            this.cleanup_loop(interval).await;
        }));
        log::info!("started periodic cleanup with {:?} interval", interval);
    }

    pub async fn stop_periodic_cleanup(&self, grace: std::time::Duration) {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else { return };
        self.stop.notify_waiters();
        if tokio::time::timeout(grace, handle).await.is_err() {
            log::warn!("cleanup task didn't stop within grace period");
        }
        log::info!("stopped periodic cleanup");
    }

    async fn cleanup_loop(&self, interval: std::time::Duration) {
        loop {
            match self.cleanup_now(false).await {
                Ok(stats) if stats.processes_removed > 0 || !stats.errors.is_empty() => {
                    log::info!("periodic cleanup: {stats:?}", stats = stats);
                }
                Err(e) => log::error!("error in cleanup loop: {e}"),
                _ => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.stop.notified() => return,
            }
        }
    }

    pub async fn cleanup_now(&self, deep_clean: bool) -> anyhow::Result<CleanupStats> {
        let started_at = Utc::now();
        let mut stats = CleanupStats::new(started_at);

        log::info!("starting registry cleanup (deep_clean={deep_clean})");

        if let Err(e) = self.cleanup_processes(&mut stats).await {
            stats.errors.push(e.to_string());
        }
        if let Err(e) = self.cleanup_orphans(&mut stats).await {
            stats.errors.push(e.to_string());
        }
        if let Err(e) = self.cleanup_storage(&mut stats, deep_clean).await {
            stats.errors.push(e.to_string());
        }

        stats.completed_at = Utc::now();
        log::info!(
            "cleanup completed in {:.1}s: {} processes removed, {} zombies killed, {} stale entries removed",
            stats.duration_seconds(),
            stats.processes_removed,
            stats.zombies_killed,
            stats.stale_entries_removed
        );
        Ok(stats)
    }

    async fn cleanup_processes(&self, stats: &mut CleanupStats) -> anyhow::Result<()> {
        let results = self.validator.validate_all_processes(false).await?;
        stats.processes_checked = results.len();

        for result in &results {
            if result.status == ValidationStatus::Valid {
                continue;
            }

            let outcome = match result.status {
                ValidationStatus::Missing | ValidationStatus::Hijacked => {
                    self.storage.remove_process(result.pid, &result.host).await?;
                    stats.processes_removed += 1;
                    Ok(())
                }
                ValidationStatus::Zombie => {
                    if self.kill_zombie(result.pid).await {
                        stats.zombies_killed += 1;
                    }
                    self.storage.remove_process(result.pid, &result.host).await?;
                    stats.processes_removed += 1;
                    Ok(())
                }
                ValidationStatus::Stale => {
                    if self.is_truly_stale(result.pid).await {
                        self.storage.remove_process(result.pid, &result.host).await?;
                        stats.processes_removed += 1;
                    }
                    Ok(())
                }
                _ => Ok(()),
            };

            if let Err(e) = outcome {
                let e: anyhow::Error = e;
                log::error!("failed to clean up {:?} process {}: {e}", result.status, result.pid);
                stats.errors.push(format!("process {}: {e}", result.pid));
            }
        }
        Ok(())
    }

    async fn cleanup_orphans(&self, stats: &mut CleanupStats) -> anyhow::Result<()> {
        let orphans = self.validator.find_orphaned_processes().await?;
        for orphan in orphans {
            let session_id = extract_session_id(&orphan.cmdline).unwrap_or_else(|| format!("orphan_{}", orphan.pid));

            let entry = ProcessEntry {
                pid: orphan.pid,
                session_id,
                project_path: None,
                command: orphan.name.clone(),
                args: orphan.cmdline.iter().skip(1).cloned().collect(),
                env: std::collections::HashMap::new(),
                status: ProcessStatus::Running,
                started_at: orphan.create_time,
                last_seen: Utc::now(),
                host: self.hostname.clone(),
                port: None,
                user: orphan.username.clone(),
                metadata: serde_json::json!({"orphan": true}),
                cpu_percent: Some(orphan.cpu_percent),
                memory_mb: Some(orphan.memory_rss_bytes as f64 / (1024.0 * 1024.0)),
                disk_read_mb: None,
                disk_write_mb: None,
            };

            match self.storage.register_process(&entry).await {
                Ok(()) => {
                    stats.orphans_registered += 1;
                    log::info!("registered orphan process {}", orphan.pid);
                }
                Err(e) => {
                    log::error!("failed to register orphan {}: {e}", orphan.pid);
                    stats.errors.push(format!("orphan {}: {e}", orphan.pid));
                }
            }
        }
        Ok(())
    }

    async fn cleanup_storage(&self, stats: &mut CleanupStats, deep_clean: bool) -> anyhow::Result<()> {
        let threshold_secs = self.config.stale_process_hours * 3600;
        stats.stale_entries_removed += self.storage.cleanup_stale_processes(threshold_secs).await?;
        stats.messages_expired += self.storage.cleanup_expired_messages().await?;

        if deep_clean {
            stats.history_entries_purged += self
                .storage
                .purge_old_history(self.config.history_retention_days)
                .await?;
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn kill_zombie(&self, pid: i64) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let target = Pid::from_raw(pid as i32);
        let _ = kill(target, Signal::SIGCHLD);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        kill(target, Signal::SIGKILL).is_ok()
    }

    #[cfg(not(unix))]
    async fn kill_zombie(&self, _pid: i64) -> bool {
        false
    }

    #[cfg(unix)]
    async fn is_truly_stale(&self, pid: i64) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // A null signal probes liveness without side effects.
        kill(Pid::from_raw(pid as i32), None).is_err()
    }

    #[cfg(not(unix))]
    async fn is_truly_stale(&self, _pid: i64) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_session_id_from_flag_forms() {
        assert_eq!(
            extract_session_id(&["claude".into(), "--session".into(), "abc123".into()]),
            Some("abc123".into())
        );
        assert_eq!(
            extract_session_id(&["claude".into(), "--session=xyz".into()]),
            Some("xyz".into())
        );
        assert_eq!(
            extract_session_id(&["claude".into(), "run".into(), "session_deadbeef-1".into()]),
            Some("session_deadbeef-1".into())
        );
        assert_eq!(extract_session_id(&["claude".into()]), None);
    }
}
