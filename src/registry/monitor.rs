use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::storage::{ProcessStatus, RegistryStorage};
use super::tracker::ProcessTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    DiskIo,
    NetworkIo,
    FileHandles,
    Threads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceAlert {
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub resource_type: ResourceType,
    pub pid: Option<i64>,
    pub session_id: Option<String>,
    pub message: String,
    pub current_value: f64,
    pub threshold_value: f64,
    pub duration_seconds: f64,
    pub previous_alerts: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceStats {
    pub current_value: f64,
    pub avg_1min: Option<f64>,
    pub avg_5min: Option<f64>,
    pub avg_15min: Option<f64>,
    pub peak_value: Option<f64>,
    pub peak_time: Option<DateTime<Utc>>,
}

struct Sample {
    timestamp: DateTime<Utc>,
    value: f64,
}

/// Identifies one ring buffer / alert-state slot: a resource type scoped either
/// to the whole system (`scope: None`) or to a single tracked pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SampleKey {
    resource_type: ResourceType,
    scope: Option<i64>,
}

impl SampleKey {
    fn string(&self) -> String {
        match self.scope {
            Some(pid) => format!("{:?}_{pid}", self.resource_type),
            None => format!("{:?}_system", self.resource_type),
        }
    }
}

fn thresholds(resource_type: ResourceType) -> Vec<(AlertSeverity, f64)> {
    match resource_type {
        ResourceType::Cpu => vec![
            (AlertSeverity::Emergency, 95.0),
            (AlertSeverity::Critical, 90.0),
            (AlertSeverity::Warning, 70.0),
        ],
        ResourceType::Memory => vec![
            (AlertSeverity::Emergency, 8192.0),
            (AlertSeverity::Critical, 4096.0),
            (AlertSeverity::Warning, 2048.0),
        ],
        ResourceType::FileHandles => vec![
            (AlertSeverity::Emergency, 2000.0),
            (AlertSeverity::Critical, 1000.0),
            (AlertSeverity::Warning, 500.0),
        ],
        ResourceType::Threads => vec![
            (AlertSeverity::Emergency, 200.0),
            (AlertSeverity::Critical, 100.0),
            (AlertSeverity::Warning, 50.0),
        ],
        // No threshold-crossing alerts are defined for these yet; they are
        // still sampled into ring buffers for `stats`.
        ResourceType::DiskIo | ResourceType::NetworkIo => vec![],
    }
}

/// Tracks resource usage over a rolling window and raises threshold-crossing
/// alerts with hysteresis: re-emits only on severity escalation, not on every
/// sample within the same severity band.
pub struct ResourceMonitor {
    storage: Arc<RegistryStorage>,
    tracker: Arc<ProcessTracker>,
    history_size: usize,
    history: Mutex<HashMap<SampleKey, VecDeque<Sample>>>,
    active_alerts: Mutex<HashMap<String, ResourceAlert>>,
    stop: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(storage: Arc<RegistryStorage>, tracker: Arc<ProcessTracker>, history_size: usize) -> Self {
        Self {
            storage,
            tracker,
            history_size,
            history: Mutex::new(HashMap::new()),
            active_alerts: Mutex::new(HashMap::new()),
            stop: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub async fn start_monitoring(self: &Arc<Self>, interval: std::time::Duration) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            log::warn!("resource monitoring already running");
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            this.monitoring_loop(interval).await;
        }));
        log::info!("started resource monitoring with {:?} interval", interval);
    }

    pub async fn stop_monitoring(&self, grace: std::time::Duration) {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else { return };
        self.stop.notify_waiters();
        if tokio::time::timeout(grace, handle).await.is_err() {
            log::warn!("monitoring task didn't stop within grace period");
        }
        log::info!("stopped resource monitoring");
    }

    async fn monitoring_loop(&self, interval: std::time::Duration) {
        loop {
            if let Err(e) = self.sample_once().await {
                log::error!("error in monitoring loop: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.stop.notified() => return,
            }
        }
    }

    async fn sample_once(&self) -> anyhow::Result<Vec<ResourceAlert>> {
        let mut alerts = Vec::new();

        let processes = self
            .storage
            .get_all_processes(Some(ProcessStatus::Running), Some(self.tracker.hostname()))
            .await?;

        for entry in &processes {
            let Some(info) = self.tracker.get_process_info(entry.pid).await? else {
                continue;
            };

            self.storage
                .update_process_resources(
                    entry.pid,
                    &entry.host,
                    Some(info.cpu_percent),
                    Some(info.memory_rss_bytes as f64 / (1024.0 * 1024.0)),
                    Some(info.disk_read_bytes as f64 / (1024.0 * 1024.0)),
                    Some(info.disk_write_bytes as f64 / (1024.0 * 1024.0)),
                )
                .await?;

            if let Some(alert) = self
                .check_threshold(ResourceType::Cpu, info.cpu_percent, Some(entry.pid), Some(&entry.session_id))
                .await
            {
                alerts.push(alert);
            }
            let memory_mb = info.memory_rss_bytes as f64 / (1024.0 * 1024.0);
            if let Some(alert) = self
                .check_threshold(ResourceType::Memory, memory_mb, Some(entry.pid), Some(&entry.session_id))
                .await
            {
                alerts.push(alert);
            }
            if let Some(alert) = self
                .check_threshold(
                    ResourceType::FileHandles,
                    info.open_files as f64,
                    Some(entry.pid),
                    Some(&entry.session_id),
                )
                .await
            {
                alerts.push(alert);
            }
            if let Some(alert) = self
                .check_threshold(
                    ResourceType::Threads,
                    info.num_threads as f64,
                    Some(entry.pid),
                    Some(&entry.session_id),
                )
                .await
            {
                alerts.push(alert);
            }
        }

        for alert in &alerts {
            log::warn!("{}", alert.message);
        }

        Ok(alerts)
    }

    /// Returns `Some(alert)` only when the severity escalates past the previously
    /// held severity for this `(resource_type, scope)` key; otherwise updates
    /// duration in place (or clears the held alert once the value drops out).
    async fn check_threshold(
        &self,
        resource_type: ResourceType,
        value: f64,
        pid: Option<i64>,
        session_id: Option<&str>,
    ) -> Option<ResourceAlert> {
        self.record_sample(pid, resource_type, value).await;

        let key = SampleKey { resource_type, scope: pid }.string();
        let triggered = thresholds(resource_type)
            .into_iter()
            .find(|(_, threshold)| value >= *threshold);

        let mut active = self.active_alerts.lock().await;

        let Some((severity, threshold_value)) = triggered else {
            active.remove(&key);
            return None;
        };

        if let Some(existing) = active.get_mut(&key) {
            if severity <= existing.severity {
                existing.duration_seconds = (Utc::now() - existing.timestamp).num_seconds() as f64;
                return None;
            }
        }

        let previous_alerts = active.get(&key).map(|a| a.previous_alerts + 1).unwrap_or(0);
        let message = match pid {
            Some(pid) => format!(
                "process {pid} {resource_type:?} usage ({value:.1}) exceeds {severity:?} threshold ({threshold_value})"
            ),
            None => format!(
                "system {resource_type:?} usage ({value:.1}) exceeds {severity:?} threshold ({threshold_value})"
            ),
        };

        let alert = ResourceAlert {
            timestamp: Utc::now(),
            severity,
            resource_type,
            pid,
            session_id: session_id.map(str::to_string),
            message,
            current_value: value,
            threshold_value,
            duration_seconds: 0.0,
            previous_alerts,
        };
        active.insert(key, alert.clone());
        Some(alert)
    }

    /// Records a sample into the ring buffer for `(scope, resource_type)`, where
    /// `scope` is `None` for system-wide sampling or `Some(pid)` for a tracked process.
    pub async fn record_sample(&self, scope: Option<i64>, resource_type: ResourceType, value: f64) {
        let mut history = self.history.lock().await;
        let buffer = history
            .entry(SampleKey { resource_type, scope })
            .or_insert_with(|| VecDeque::with_capacity(self.history_size));
        if buffer.len() == self.history_size {
            buffer.pop_front();
        }
        buffer.push_back(Sample { timestamp: Utc::now(), value });
    }

    pub async fn record_system_sample(&self, resource_type: ResourceType, value: f64) {
        self.record_sample(None, resource_type, value).await;
    }

    /// Derived statistics for `(scope, resource_type)`: current value, windowed
    /// averages, and peak value/time over the retained ring buffer.
    pub async fn stats(&self, scope: Option<i64>, resource_type: ResourceType) -> ResourceStats {
        let history = self.history.lock().await;
        let Some(buffer) = history.get(&SampleKey { resource_type, scope }) else {
            return ResourceStats::default();
        };
        let now = Utc::now();
        let windowed = |secs: i64| -> Option<f64> {
            let samples: Vec<f64> = buffer
                .iter()
                .filter(|s| (now - s.timestamp).num_seconds() <= secs)
                .map(|s| s.value)
                .collect();
            if samples.is_empty() {
                None
            } else {
                Some(samples.iter().sum::<f64>() / samples.len() as f64)
            }
        };

        let peak = buffer
            .iter()
            .fold(None, |peak: Option<&Sample>, s| match peak {
                Some(p) if p.value >= s.value => Some(p),
                _ => Some(s),
            });

        ResourceStats {
            current_value: buffer.back().map(|s| s.value).unwrap_or(0.0),
            avg_1min: windowed(60),
            avg_5min: windowed(300),
            avg_15min: windowed(900),
            peak_value: peak.map(|s| s.value),
            peak_time: peak.map(|s| s.timestamp),
        }
    }

    pub async fn system_stats(&self, resource_type: ResourceType) -> ResourceStats {
        self.stats(None, resource_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_monitor() -> (tempfile::TempDir, Arc<ResourceMonitor>) {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(RegistryStorage::open(&dir.path().join("registry.db")).await.unwrap());
        let tracker = Arc::new(ProcessTracker::new(storage.clone()));
        (dir, Arc::new(ResourceMonitor::new(storage, tracker, 180)))
    }

    #[tokio::test]
    async fn alert_escalates_only_on_higher_severity() {
        let (_dir, monitor) = new_monitor().await;

        let first = monitor.check_threshold(ResourceType::Cpu, 75.0, None, None).await;
        assert!(first.is_some());
        assert_eq!(first.unwrap().severity, AlertSeverity::Warning);

        // Same severity band: no re-emission.
        let second = monitor.check_threshold(ResourceType::Cpu, 80.0, None, None).await;
        assert!(second.is_none());

        // Escalates to critical: emits again.
        let third = monitor.check_threshold(ResourceType::Cpu, 92.0, None, None).await;
        assert_eq!(third.unwrap().severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn alert_clears_when_value_drops_below_thresholds() {
        let (_dir, monitor) = new_monitor().await;
        monitor.check_threshold(ResourceType::Cpu, 75.0, None, None).await;
        let cleared = monitor.check_threshold(ResourceType::Cpu, 10.0, None, None).await;
        assert!(cleared.is_none());

        // Crossing the warning threshold again now re-emits (state was cleared).
        let reemitted = monitor.check_threshold(ResourceType::Cpu, 75.0, None, None).await;
        assert!(reemitted.is_some());
    }

    #[tokio::test]
    async fn alert_does_not_reemit_on_deescalation() {
        let (_dir, monitor) = new_monitor().await;

        let first = monitor.check_threshold(ResourceType::Cpu, 92.0, None, None).await;
        assert_eq!(first.unwrap().severity, AlertSeverity::Critical);

        // Drops back to warning band: still above a threshold, so no clear, but
        // must not re-emit since warning is lower than the held critical severity.
        let deescalated = monitor.check_threshold(ResourceType::Cpu, 75.0, None, None).await;
        assert!(deescalated.is_none());

        // Escalating past critical again does emit.
        let reescalated = monitor.check_threshold(ResourceType::Cpu, 96.0, None, None).await;
        assert_eq!(reescalated.unwrap().severity, AlertSeverity::Emergency);
    }

    #[tokio::test]
    async fn per_pid_stats_are_tracked_separately_from_system() {
        let (_dir, monitor) = new_monitor().await;
        monitor.check_threshold(ResourceType::Cpu, 10.0, Some(42), None).await;
        monitor.check_threshold(ResourceType::Cpu, 80.0, None, None).await;

        let pid_stats = monitor.stats(Some(42), ResourceType::Cpu).await;
        let system_stats = monitor.stats(None, ResourceType::Cpu).await;
        assert_eq!(pid_stats.current_value, 10.0);
        assert_eq!(system_stats.current_value, 80.0);
        assert_eq!(system_stats.peak_value, Some(80.0));
        assert!(system_stats.peak_time.is_some());
    }
}
