use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use sysinfo::{Pid, System};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::storage::{ProcessEntry, ProcessStatus, RegistryStorage};

/// Aggregate, host-wide counterpart to `ProcessInfo`: load on the machine as a
/// whole rather than any single tracked process.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub hostname: String,
    pub tracked_process_count: usize,
    pub total_cpu_percent: f64,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
}

/// A point-in-time snapshot of an OS process, independent of what the registry
/// has on file for it.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: i64,
    pub name: String,
    pub cmdline: Vec<String>,
    pub create_time: DateTime<Utc>,
    pub status: String,
    pub username: Option<String>,
    pub cpu_percent: f64,
    pub memory_rss_bytes: u64,
    pub memory_vms_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub num_threads: u64,
    pub open_files: u64,
    pub connections: u64,
}

impl ProcessInfo {
    fn from_sysinfo(pid: Pid, process: &sysinfo::Process) -> Self {
        let cmdline: Vec<String> = process
            .cmd()
            .iter()
            .map(|s| s.to_string_lossy().to_string())
            .collect();

        Self {
            pid: pid.as_u32() as i64,
            name: process.name().to_string_lossy().to_string(),
            cmdline,
            create_time: DateTime::from_timestamp(process.start_time() as i64, 0)
                .unwrap_or_else(Utc::now),
            status: format!("{:?}", process.status()).to_lowercase(),
            username: process.user_id().map(|u| u.to_string()),
            cpu_percent: process.cpu_usage() as f64,
            memory_rss_bytes: process.memory(),
            memory_vms_bytes: process.virtual_memory(),
            disk_read_bytes: process.disk_usage().total_read_bytes,
            disk_write_bytes: process.disk_usage().total_written_bytes,
            num_threads: process.tasks().map(|t| t.len() as u64).unwrap_or(1),
            open_files: open_fd_count(pid.as_u32()).unwrap_or(0),
            connections: connection_count(pid.as_u32()).unwrap_or(0),
        }
    }
}

/// Counts entries under `/proc/<pid>/fd`; best-effort, returns `None` off Linux
/// or when the directory is inaccessible (process gone, permission denied).
#[cfg(target_os = "linux")]
fn open_fd_count(pid: u32) -> Option<u64> {
    std::fs::read_dir(format!("/proc/{pid}/fd"))
        .ok()
        .map(|entries| entries.filter_map(std::result::Result::ok).count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn open_fd_count(_pid: u32) -> Option<u64> {
    None
}

/// Counts open sockets under `/proc/<pid>/net/{tcp,tcp6,udp,udp6}`, mirroring
/// `open_fd_count`'s best-effort procfs approach. Each file's first line is a
/// header, so the count is entries minus one (clamped at zero).
#[cfg(target_os = "linux")]
fn connection_count(pid: u32) -> Option<u64> {
    let mut total = 0u64;
    let mut found_any = false;
    for proto in ["tcp", "tcp6", "udp", "udp6"] {
        if let Ok(contents) = std::fs::read_to_string(format!("/proc/{pid}/net/{proto}")) {
            found_any = true;
            total += contents.lines().count().saturating_sub(1) as u64;
        }
    }
    found_any.then_some(total)
}

#[cfg(not(target_os = "linux"))]
fn connection_count(_pid: u32) -> Option<u64> {
    None
}

fn map_status(status: &str) -> ProcessStatus {
    match status {
        "run" | "runnable" => ProcessStatus::Running,
        "sleep" => ProcessStatus::Idle,
        "disksleep" => ProcessStatus::Busy,
        "stop" => ProcessStatus::Stopped,
        "zombie" => ProcessStatus::Zombie,
        "dead" => ProcessStatus::Stopped,
        _ => ProcessStatus::Running,
    }
}

fn is_claude_process(name: &str, cmdline: &[String]) -> bool {
    if name.to_lowercase().contains("claude") {
        return true;
    }
    let joined = cmdline.join(" ").to_lowercase();
    joined.contains("claude")
}

/// Tracks OS processes backing Claude sessions and periodically samples their
/// resource usage into the registry.
pub struct ProcessTracker {
    storage: Arc<RegistryStorage>,
    hostname: String,
    system: Mutex<System>,
    tracked_pids: RwLock<HashSet<i64>>,
    stop: Arc<tokio::sync::Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessTracker {
    pub fn new(storage: Arc<RegistryStorage>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());

        Self {
            storage,
            hostname,
            system: Mutex::new(System::new()),
            tracked_pids: RwLock::new(HashSet::new()),
            stop: Arc::new(tokio::sync::Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub async fn start_tracking(self: &Arc<Self>, interval: std::time::Duration) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            log::warn!("process tracking already running");
            return;
        }

        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            this.tracking_loop(interval).await;
        }));
        log::info!("started process tracking with {:?} interval", interval);
    }

    pub async fn stop_tracking(&self, grace: std::time::Duration) {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else {
            return;
        };
        self.stop.notify_waiters();
        if tokio::time::timeout(grace, handle).await.is_err() {
            log::warn!("tracking task didn't stop within grace period");
        }
        log::info!("stopped process tracking");
    }

    async fn tracking_loop(&self, interval: std::time::Duration) {
        loop {
            if let Err(e) = self.refresh_tracked().await {
                log::error!("error in tracking loop: {e}");
            }

            if let Err(e) = self
                .storage
                .cleanup_stale_processes((interval.as_secs() * 10) as i64)
                .await
            {
                log::error!("failed to clean up stale processes: {e}");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.stop.notified() => return,
            }
        }
    }

    pub async fn track_process(
        &self,
        pid: i64,
        session_id: &str,
        project_path: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> anyhow::Result<ProcessEntry> {
        let info = self
            .inspect(pid)
            .await
            .with_context(|| format!("failed to inspect process {pid}"))?
            .ok_or_else(|| anyhow::anyhow!("process {pid} not found"))?;

        let entry = ProcessEntry {
            pid,
            session_id: session_id.to_string(),
            project_path: project_path.map(str::to_string),
            command: info.name.clone(),
            args: info.cmdline.iter().skip(1).cloned().collect(),
            env: HashMap::new(),
            status: map_status(&info.status),
            started_at: info.create_time,
            last_seen: Utc::now(),
            host: self.hostname.clone(),
            port: None,
            user: info.username.clone(),
            metadata: metadata.unwrap_or(serde_json::json!({})),
            cpu_percent: Some(info.cpu_percent),
            memory_mb: Some(info.memory_rss_bytes as f64 / (1024.0 * 1024.0)),
            disk_read_mb: Some(info.disk_read_bytes as f64 / (1024.0 * 1024.0)),
            disk_write_mb: Some(info.disk_write_bytes as f64 / (1024.0 * 1024.0)),
        };

        self.storage.register_process(&entry).await?;
        self.tracked_pids.write().await.insert(pid);
        log::info!("started tracking process {pid} for session {session_id}");
        Ok(entry)
    }

    pub async fn untrack_process(&self, pid: i64) -> anyhow::Result<()> {
        self.tracked_pids.write().await.remove(&pid);
        self.storage.remove_process(pid, &self.hostname).await?;
        log::info!("stopped tracking process {pid}");
        Ok(())
    }

    pub async fn get_process_info(&self, pid: i64) -> anyhow::Result<Option<ProcessInfo>> {
        self.inspect(pid).await
    }

    /// Host-wide load snapshot, independent of any single tracked process.
    pub async fn get_system_stats(&self) -> SystemStats {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        system.refresh_cpu_usage();
        SystemStats {
            hostname: self.hostname.clone(),
            tracked_process_count: self.tracked_pids.read().await.len(),
            total_cpu_percent: system.global_cpu_usage() as f64,
            total_memory_bytes: system.total_memory(),
            used_memory_bytes: system.used_memory(),
        }
    }

    async fn inspect(&self, pid: i64) -> anyhow::Result<Option<ProcessInfo>> {
        let mut system = self.system.lock().await;
        let sys_pid = Pid::from_u32(pid as u32);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sys_pid]), true);
        Ok(system.process(sys_pid).map(|p| ProcessInfo::from_sysinfo(sys_pid, p)))
    }

    pub async fn find_claude_processes(&self) -> Vec<ProcessInfo> {
        let mut system = self.system.lock().await;
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let info = ProcessInfo::from_sysinfo(*pid, process);
                is_claude_process(&info.name, &info.cmdline).then_some(info)
            })
            .collect()
    }

    /// Compares what's tracked against the OS, applying the 1-second creation-time
    /// tolerance to distinguish a live process from a PID reused by something else.
    pub async fn validate_tracked_processes(&self) -> anyhow::Result<(Vec<i64>, Vec<i64>)> {
        let mut alive = Vec::new();
        let mut dead = Vec::new();

        let entries = self
            .storage
            .get_all_processes(None, Some(&self.hostname))
            .await?;

        for entry in entries {
            match self.inspect(entry.pid).await? {
                Some(info) if (info.create_time - entry.started_at).num_seconds().abs() < 1 => {
                    alive.push(entry.pid);
                }
                _ => dead.push(entry.pid),
            }
        }

        for pid in &dead {
            self.storage
                .update_process_status(*pid, &self.hostname, ProcessStatus::Stopped, None)
                .await?;
        }

        Ok((alive, dead))
    }

    async fn refresh_tracked(&self) -> anyhow::Result<()> {
        let pids: Vec<i64> = self.tracked_pids.read().await.iter().copied().collect();
        for pid in pids {
            match self.inspect(pid).await? {
                Some(info) => {
                    self.storage
                        .update_process_resources(
                            pid,
                            &self.hostname,
                            Some(info.cpu_percent),
                            Some(info.memory_rss_bytes as f64 / (1024.0 * 1024.0)),
                            Some(info.disk_read_bytes as f64 / (1024.0 * 1024.0)),
                            Some(info.disk_write_bytes as f64 / (1024.0 * 1024.0)),
                        )
                        .await?;

                    let status = if info.cpu_percent > 50.0 {
                        ProcessStatus::Busy
                    } else if info.cpu_percent > 0.0 {
                        ProcessStatus::Running
                    } else {
                        ProcessStatus::Idle
                    };
                    self.storage
                        .update_process_status(pid, &self.hostname, status, None)
                        .await?;
                }
                None => {
                    self.tracked_pids.write().await.remove(&pid);
                    self.storage
                        .update_process_status(pid, &self.hostname, ProcessStatus::Stopped, None)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_detection_matches_name_or_cmdline() {
        assert!(is_claude_process("claude", &[]));
        assert!(is_claude_process("node", &["node".into(), "claude-code".into()]));
        assert!(!is_claude_process("bash", &["bash".into(), "-c".into(), "ls".into()]));
    }

    #[tokio::test]
    async fn get_system_stats_reports_tracked_count() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(
            RegistryStorage::open(&dir.path().join("registry.db"))
                .await
                .unwrap(),
        );
        let tracker = ProcessTracker::new(storage.clone());

        let pid = std::process::id() as i64;
        tracker.track_process(pid, "session-y", None, None).await.unwrap();

        let stats = tracker.get_system_stats().await;
        assert_eq!(stats.tracked_process_count, 1);
        assert_eq!(stats.hostname, tracker.hostname());
        assert!(stats.total_memory_bytes > 0);
    }

    #[tokio::test]
    async fn track_current_process_registers_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(
            RegistryStorage::open(&dir.path().join("registry.db"))
                .await
                .unwrap(),
        );
        let tracker = ProcessTracker::new(storage.clone());

        let pid = std::process::id() as i64;
        let entry = tracker
            .track_process(pid, "session-x", None, None)
            .await
            .unwrap();

        assert_eq!(entry.pid, pid);
        let fetched = storage.get_process(pid, tracker.hostname()).await.unwrap();
        assert!(fetched.is_some());
    }
}
