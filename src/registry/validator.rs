use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::config::RegistryConfig;

use super::storage::{ProcessEntry, ProcessStatus, RegistryStorage};
use super::tracker::{ProcessInfo, ProcessTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Stale,
    Zombie,
    Hijacked,
    Missing,
    Unhealthy,
    ResourceExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    RemoveFromRegistry,
    KillAndRemove,
    RefreshTracking,
    MonitorClosely,
    InvestigateHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub pid: i64,
    pub host: String,
    pub status: ValidationStatus,
    pub process_status: Option<ProcessStatus>,
    pub reason: String,
    pub details: serde_json::Value,
    pub recommended_action: Option<RecommendedAction>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }
}

fn determine_status(info: &ProcessInfo) -> ProcessStatus {
    if info.status == "zombie" {
        ProcessStatus::Zombie
    } else if info.status == "stop" || info.status == "dead" {
        ProcessStatus::Stopped
    } else if info.cpu_percent > 50.0 {
        ProcessStatus::Busy
    } else if info.cpu_percent > 0.0 {
        ProcessStatus::Running
    } else {
        ProcessStatus::Idle
    }
}

fn collect_health_issues(info: &ProcessInfo, config: &RegistryConfig) -> Vec<String> {
    let mut issues = Vec::new();
    if info.open_files > config.open_files_threshold {
        issues.push(format!("excessive open files: {}", info.open_files));
    }
    if info.connections > config.connections_threshold {
        issues.push(format!("excessive connections: {}", info.connections));
    }
    if info.num_threads > config.threads_threshold {
        issues.push(format!("excessive threads: {}", info.num_threads));
    }
    issues
}

fn is_same_process(entry: &ProcessEntry, info: &ProcessInfo) -> bool {
    let time_diff = (info.create_time - entry.started_at).num_seconds().abs();
    if time_diff > 1 {
        return false;
    }
    let command_lower = entry.command.to_lowercase();
    let name_lower = info.name.to_lowercase();
    if !name_lower.contains(&command_lower) {
        let cmdline_joined = info.cmdline.join(" ");
        if !cmdline_joined.contains(&entry.command) {
            return false;
        }
    }
    true
}

/// Classifies tracked process entries against live OS state and configured
/// health thresholds, producing a recommended remediation for each problem.
pub struct ProcessValidator {
    storage: Arc<RegistryStorage>,
    tracker: Arc<ProcessTracker>,
    config: RegistryConfig,
}

impl ProcessValidator {
    pub fn new(storage: Arc<RegistryStorage>, tracker: Arc<ProcessTracker>, config: RegistryConfig) -> Self {
        Self {
            storage,
            tracker,
            config,
        }
    }

    pub async fn validate_process(&self, entry: &ProcessEntry) -> anyhow::Result<ValidationResult> {
        let Some(info) = self.tracker.get_process_info(entry.pid).await? else {
            return Ok(ValidationResult {
                pid: entry.pid,
                host: entry.host.clone(),
                status: ValidationStatus::Missing,
                process_status: Some(ProcessStatus::Stopped),
                reason: "process no longer exists".into(),
                details: serde_json::json!({"last_seen": entry.last_seen}),
                recommended_action: Some(RecommendedAction::RemoveFromRegistry),
            });
        };

        if !is_same_process(entry, &info) {
            return Ok(ValidationResult {
                pid: entry.pid,
                host: entry.host.clone(),
                status: ValidationStatus::Hijacked,
                process_status: Some(ProcessStatus::Stopped),
                reason: "pid has been reused by a different process".into(),
                details: serde_json::json!({
                    "original_command": entry.command,
                    "current_command": info.name,
                    "original_start": entry.started_at,
                    "current_start": info.create_time,
                }),
                recommended_action: Some(RecommendedAction::RemoveFromRegistry),
            });
        }

        if info.status == "zombie" {
            let zombie_duration = (Utc::now() - entry.last_seen).num_seconds();
            if zombie_duration > self.config.zombie_threshold_secs as i64 {
                return Ok(ValidationResult {
                    pid: entry.pid,
                    host: entry.host.clone(),
                    status: ValidationStatus::Zombie,
                    process_status: Some(ProcessStatus::Zombie),
                    reason: format!("process has been zombie for {zombie_duration}s"),
                    details: serde_json::json!({"zombie_since": entry.last_seen}),
                    recommended_action: Some(RecommendedAction::KillAndRemove),
                });
            }
        }

        let stale_duration = (Utc::now() - entry.last_seen).num_seconds();
        if stale_duration > self.config.stale_threshold_secs as i64 {
            return Ok(ValidationResult {
                pid: entry.pid,
                host: entry.host.clone(),
                status: ValidationStatus::Stale,
                process_status: Some(entry.status),
                reason: format!("process not updated for {stale_duration}s"),
                details: serde_json::json!({
                    "last_seen": entry.last_seen,
                    "threshold_seconds": self.config.stale_threshold_secs,
                }),
                recommended_action: Some(RecommendedAction::RefreshTracking),
            });
        }

        let mut resource_issues = Vec::new();
        if info.cpu_percent >= self.config.cpu_threshold_percent {
            resource_issues.push(format!("high cpu usage: {:.1}%", info.cpu_percent));
        }
        let memory_mb = info.memory_rss_bytes as f64 / (1024.0 * 1024.0);
        if memory_mb >= self.config.memory_threshold_mb {
            resource_issues.push(format!("high memory usage: {memory_mb:.0}MB"));
        }
        if !resource_issues.is_empty() {
            return Ok(ValidationResult {
                pid: entry.pid,
                host: entry.host.clone(),
                status: ValidationStatus::ResourceExceeded,
                process_status: Some(ProcessStatus::Busy),
                reason: resource_issues.join("; "),
                details: serde_json::json!({
                    "cpu_percent": info.cpu_percent,
                    "memory_mb": memory_mb,
                }),
                recommended_action: Some(RecommendedAction::MonitorClosely),
            });
        }

        let health_issues = collect_health_issues(&info, &self.config);
        if !health_issues.is_empty() {
            return Ok(ValidationResult {
                pid: entry.pid,
                host: entry.host.clone(),
                status: ValidationStatus::Unhealthy,
                process_status: Some(entry.status),
                reason: health_issues.join("; "),
                details: serde_json::json!({
                    "open_files": info.open_files,
                    "connections": info.connections,
                    "threads": info.num_threads,
                }),
                recommended_action: Some(RecommendedAction::InvestigateHealth),
            });
        }

        Ok(ValidationResult {
            pid: entry.pid,
            host: entry.host.clone(),
            status: ValidationStatus::Valid,
            process_status: Some(determine_status(&info)),
            reason: "process is healthy and running normally".into(),
            details: serde_json::json!({
                "cpu_percent": info.cpu_percent,
                "memory_mb": memory_mb,
            }),
            recommended_action: None,
        })
    }

    pub async fn validate_all_processes(&self, fix_issues: bool) -> anyhow::Result<Vec<ValidationResult>> {
        let entries = self
            .storage
            .get_all_processes(None, Some(self.tracker.hostname()))
            .await?;

        let mut results = Vec::with_capacity(entries.len());
        for entry in &entries {
            let result = self.validate_process(entry).await?;
            if fix_issues {
                self.apply_fix(&result).await?;
            }
            results.push(result);
        }

        let valid = results.iter().filter(|r| r.is_valid()).count();
        log::info!("validated {} processes: {valid} valid, {} with issues", results.len(), results.len() - valid);
        Ok(results)
    }

    pub async fn validate_session(&self, session_id: &str) -> anyhow::Result<(bool, Vec<ValidationResult>)> {
        let entries = self.storage.get_session_processes(session_id, None).await?;
        let mut results = Vec::with_capacity(entries.len());
        for entry in &entries {
            results.push(self.validate_process(entry).await?);
        }
        let all_valid = results.iter().all(|r| r.is_valid());
        Ok((all_valid, results))
    }

    pub async fn check_port_conflicts(&self) -> anyhow::Result<Vec<serde_json::Value>> {
        let entries = self
            .storage
            .get_all_processes(Some(ProcessStatus::Running), None)
            .await?;

        let mut by_port: std::collections::HashMap<i64, Vec<&ProcessEntry>> = std::collections::HashMap::new();
        for entry in &entries {
            if let Some(port) = entry.port {
                by_port.entry(port).or_default().push(entry);
            }
        }

        Ok(by_port
            .into_iter()
            .filter(|(_, entries)| entries.len() > 1)
            .map(|(port, entries)| {
                serde_json::json!({
                    "port": port,
                    "processes": entries.iter().map(|e| serde_json::json!({
                        "pid": e.pid, "host": e.host, "session_id": e.session_id, "command": e.command,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect())
    }

    pub async fn find_orphaned_processes(&self) -> anyhow::Result<Vec<ProcessInfo>> {
        let claude_processes = self.tracker.find_claude_processes().await;
        let registered = self
            .storage
            .get_all_processes(None, Some(self.tracker.hostname()))
            .await?;
        let registered_pids: std::collections::HashSet<i64> = registered.iter().map(|p| p.pid).collect();

        let orphans: Vec<ProcessInfo> = claude_processes
            .into_iter()
            .filter(|p| !registered_pids.contains(&p.pid))
            .collect();

        if !orphans.is_empty() {
            log::warn!("found {} orphaned claude processes", orphans.len());
        }
        Ok(orphans)
    }

    async fn apply_fix(&self, result: &ValidationResult) -> anyhow::Result<()> {
        let Some(action) = result.recommended_action else {
            return Ok(());
        };

        match action {
            RecommendedAction::RemoveFromRegistry => {
                self.storage.remove_process(result.pid, &result.host).await?;
                log::info!("removed {:?} process {}", result.status, result.pid);
            }
            RecommendedAction::KillAndRemove => {
                #[cfg(unix)]
                {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(result.pid as i32),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
                self.storage.remove_process(result.pid, &result.host).await?;
                log::info!("killed and removed zombie process {}", result.pid);
            }
            RecommendedAction::RefreshTracking => {
                if let Some(entry) = self.storage.get_process(result.pid, &result.host).await? {
                    self.tracker
                        .track_process(
                            result.pid,
                            &entry.session_id,
                            entry.project_path.as_deref(),
                            Some(entry.metadata.clone()),
                        )
                        .await?;
                    log::info!("refreshed tracking for stale process {}", result.pid);
                }
            }
            RecommendedAction::MonitorClosely => {
                self.storage
                    .update_process_status(
                        result.pid,
                        &result.host,
                        result.process_status.unwrap_or(ProcessStatus::Busy),
                        Some(&serde_json::json!({"monitoring": "high_resource_usage"})),
                    )
                    .await?;
            }
            RecommendedAction::InvestigateHealth => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn sample_entry() -> ProcessEntry {
        ProcessEntry {
            pid: 1234,
            session_id: "session_abc".into(),
            project_path: Some("/tmp/project".into()),
            command: "claude".into(),
            args: vec![],
            env: std::collections::HashMap::new(),
            status: ProcessStatus::Running,
            started_at: Utc::now(),
            last_seen: Utc::now(),
            host: "localhost".into(),
            port: None,
            user: Some("root".into()),
            metadata: serde_json::json!({}),
            cpu_percent: Some(0.0),
            memory_mb: Some(0.0),
            disk_read_mb: Some(0.0),
            disk_write_mb: Some(0.0),
        }
    }

    fn sample_info(entry: &ProcessEntry) -> ProcessInfo {
        ProcessInfo {
            pid: entry.pid,
            name: "claude".into(),
            cmdline: vec!["claude".into(), "--session".into(), "session_abc".into()],
            status: "run".into(),
            create_time: entry.started_at,
            username: Some("root".into()),
            cpu_percent: 1.0,
            memory_rss_bytes: 1024 * 1024,
            memory_vms_bytes: 2 * 1024 * 1024,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            open_files: 5,
            connections: 2,
            num_threads: 2,
        }
    }

    #[test]
    fn same_process_matches_on_command_and_start_time() {
        let entry = sample_entry();
        let info = sample_info(&entry);
        assert!(is_same_process(&entry, &info));
    }

    #[test]
    fn different_start_time_is_hijack() {
        let entry = sample_entry();
        let mut info = sample_info(&entry);
        info.create_time = entry.started_at + chrono::Duration::seconds(120);
        assert!(!is_same_process(&entry, &info));
    }

    #[test]
    fn different_command_is_hijack() {
        let entry = sample_entry();
        let mut info = sample_info(&entry);
        info.name = "evil".into();
        info.cmdline = vec!["evil".into()];
        assert!(!is_same_process(&entry, &info));
    }

    #[test]
    fn determine_status_flags_zombie() {
        let entry = sample_entry();
        let mut info = sample_info(&entry);
        info.status = "zombie".into();
        assert_eq!(determine_status(&info), ProcessStatus::Zombie);
    }

    #[test]
    fn determine_status_flags_busy_above_cpu_threshold() {
        let entry = sample_entry();
        let mut info = sample_info(&entry);
        info.cpu_percent = 75.0;
        assert_eq!(determine_status(&info), ProcessStatus::Busy);
    }

    #[test]
    fn excessive_connections_is_a_health_issue() {
        let entry = sample_entry();
        let mut info = sample_info(&entry);
        info.connections = 150;
        let config = RegistryConfig::default();
        let issues = collect_health_issues(&info, &config);
        assert!(issues.iter().any(|i| i.contains("connections")));
    }

    #[test]
    fn healthy_process_has_no_issues() {
        let entry = sample_entry();
        let info = sample_info(&entry);
        let config = RegistryConfig::default();
        assert!(collect_health_issues(&info, &config).is_empty());
    }
}
