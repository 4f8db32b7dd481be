use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;

/// Lifecycle status of a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Idle,
    Busy,
    Stopping,
    Stopped,
    Crashed,
    Zombie,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Zombie => "zombie",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "starting" => Self::Starting,
            "running" => Self::Running,
            "idle" => Self::Idle,
            "busy" => Self::Busy,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "crashed" => Self::Crashed,
            "zombie" => Self::Zombie,
            other => anyhow::bail!("unknown process status: {other}"),
        })
    }
}

/// A registered process entry, primary-keyed by `(pid, host)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: i64,
    pub session_id: String,
    pub project_path: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub host: String,
    pub port: Option<i64>,
    pub user: Option<String>,
    pub metadata: serde_json::Value,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub disk_read_mb: Option<f64>,
    pub disk_write_mb: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub pid: i64,
    pub host: String,
    pub session_id: String,
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub from_session: String,
    pub to_session: Option<String>,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<ProcessEntry> {
    let args: String = row.get("args")?;
    let env: String = row.get("env")?;
    let metadata: String = row.get("metadata")?;
    let status: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let last_seen: String = row.get("last_seen")?;

    Ok(ProcessEntry {
        pid: row.get("pid")?,
        session_id: row.get("session_id")?,
        project_path: row.get("project_path")?,
        command: row.get("command")?,
        args: serde_json::from_str(&args).unwrap_or_default(),
        env: serde_json::from_str(&env).unwrap_or_default(),
        status: ProcessStatus::parse(&status).unwrap_or(ProcessStatus::Running),
        started_at: started_at.parse().unwrap_or_else(|_| Utc::now()),
        last_seen: last_seen.parse().unwrap_or_else(|_| Utc::now()),
        host: row.get("host")?,
        port: row.get("port")?,
        user: row.get("user")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        cpu_percent: row.get("cpu_percent")?,
        memory_mb: row.get("memory_mb")?,
        disk_read_mb: row.get("disk_read_mb")?,
        disk_write_mb: row.get("disk_write_mb")?,
    })
}

/// SQLite-backed store for the process registry. All SQL work funnels through one
/// async mutex; WAL mode lets readers proceed without blocking on checkpoint I/O.
pub struct RegistryStorage {
    conn: Mutex<Connection>,
}

impl RegistryStorage {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create registry db directory")?;
        }

        let path = db_path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> anyhow::Result<Connection> {
            let conn = Connection::open(&path).context("failed to open registry database")?;
            conn.busy_timeout(std::time::Duration::from_secs(30))?;
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;

                 CREATE TABLE IF NOT EXISTS processes (
                     pid INTEGER NOT NULL,
                     host TEXT NOT NULL,
                     session_id TEXT NOT NULL,
                     project_path TEXT,
                     command TEXT NOT NULL,
                     args TEXT NOT NULL,
                     env TEXT NOT NULL,
                     status TEXT NOT NULL,
                     started_at TEXT NOT NULL,
                     last_seen TEXT NOT NULL,
                     port INTEGER,
                     user TEXT,
                     metadata TEXT NOT NULL,
                     cpu_percent REAL,
                     memory_mb REAL,
                     disk_read_mb REAL,
                     disk_write_mb REAL,
                     PRIMARY KEY (pid, host),
                     CHECK (status IN ('starting','running','idle','busy',
                                       'stopping','stopped','crashed','zombie'))
                 );

                 CREATE INDEX IF NOT EXISTS idx_processes_session ON processes(session_id);
                 CREATE INDEX IF NOT EXISTS idx_processes_status ON processes(status);
                 CREATE INDEX IF NOT EXISTS idx_processes_project ON processes(project_path);
                 CREATE INDEX IF NOT EXISTS idx_processes_last_seen ON processes(last_seen);

                 CREATE TABLE IF NOT EXISTS process_history (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     pid INTEGER NOT NULL,
                     host TEXT NOT NULL,
                     session_id TEXT NOT NULL,
                     event_type TEXT NOT NULL,
                     event_time TEXT NOT NULL,
                     old_status TEXT,
                     new_status TEXT,
                     details TEXT,
                     CHECK (event_type IN ('registered','status_changed','updated','removed'))
                 );

                 CREATE TABLE IF NOT EXISTS messages (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     from_session TEXT NOT NULL,
                     to_session TEXT,
                     message_type TEXT NOT NULL,
                     payload TEXT NOT NULL,
                     created_at TEXT NOT NULL,
                     read_at TEXT,
                     expires_at TEXT NOT NULL
                 );",
            )
            .context("failed to initialize registry schema")?;
            Ok(conn)
        })
        .await
        .context("registry init task panicked")??;

        log::info!("registry storage initialized at {:?}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn record_history(
        conn: &Connection,
        pid: i64,
        host: &str,
        session_id: &str,
        event_type: &str,
        old_status: Option<&str>,
        new_status: Option<&str>,
        details: Option<&str>,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO process_history
                 (pid, host, session_id, event_type, event_time, old_status, new_status, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                pid,
                host,
                session_id,
                event_type,
                Utc::now().to_rfc3339(),
                old_status,
                new_status,
                details
            ],
        )?;
        Ok(())
    }

    pub async fn register_process(&self, entry: &ProcessEntry) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT pid FROM processes WHERE pid = ?1 AND host = ?2",
                rusqlite::params![entry.pid, entry.host],
                |row| row.get(0),
            )
            .ok();

        let tx = conn.unchecked_transaction()?;
        if existing.is_some() {
            tx.execute(
                "UPDATE processes SET
                     session_id=?1, project_path=?2, command=?3, args=?4, env=?5,
                     status=?6, last_seen=?7, port=?8, user=?9, metadata=?10,
                     cpu_percent=?11, memory_mb=?12, disk_read_mb=?13, disk_write_mb=?14
                 WHERE pid=?15 AND host=?16",
                rusqlite::params![
                    entry.session_id,
                    entry.project_path,
                    entry.command,
                    serde_json::to_string(&entry.args)?,
                    serde_json::to_string(&entry.env)?,
                    entry.status.as_str(),
                    entry.last_seen.to_rfc3339(),
                    entry.port,
                    entry.user,
                    serde_json::to_string(&entry.metadata)?,
                    entry.cpu_percent,
                    entry.memory_mb,
                    entry.disk_read_mb,
                    entry.disk_write_mb,
                    entry.pid,
                    entry.host,
                ],
            )?;
            Self::record_history(
                &tx,
                entry.pid,
                &entry.host,
                &entry.session_id,
                "updated",
                None,
                None,
                Some("process information updated"),
            )?;
        } else {
            tx.execute(
                "INSERT INTO processes (
                     pid, session_id, project_path, command, args, env, status,
                     started_at, last_seen, host, port, user, metadata,
                     cpu_percent, memory_mb, disk_read_mb, disk_write_mb
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                rusqlite::params![
                    entry.pid,
                    entry.session_id,
                    entry.project_path,
                    entry.command,
                    serde_json::to_string(&entry.args)?,
                    serde_json::to_string(&entry.env)?,
                    entry.status.as_str(),
                    entry.started_at.to_rfc3339(),
                    entry.last_seen.to_rfc3339(),
                    entry.host,
                    entry.port,
                    entry.user,
                    serde_json::to_string(&entry.metadata)?,
                    entry.cpu_percent,
                    entry.memory_mb,
                    entry.disk_read_mb,
                    entry.disk_write_mb,
                ],
            )?;
            Self::record_history(
                &tx,
                entry.pid,
                &entry.host,
                &entry.session_id,
                "registered",
                None,
                Some(entry.status.as_str()),
                Some(&format!("process registered: {}", entry.command)),
            )?;
        }
        tx.commit()?;

        log::debug!("registered process {} on {}", entry.pid, entry.host);
        Ok(())
    }

    pub async fn get_process(&self, pid: i64, host: &str) -> anyhow::Result<Option<ProcessEntry>> {
        let conn = self.conn.lock().await;
        let result = conn
            .query_row(
                "SELECT * FROM processes WHERE pid = ?1 AND host = ?2",
                rusqlite::params![pid, host],
                row_to_entry,
            )
            .ok();
        Ok(result)
    }

    pub async fn get_session_processes(
        &self,
        session_id: &str,
        status: Option<ProcessStatus>,
    ) -> anyhow::Result<Vec<ProcessEntry>> {
        let conn = self.conn.lock().await;
        let mut entries = Vec::new();
        if let Some(status) = status {
            let mut stmt = conn.prepare(
                "SELECT * FROM processes WHERE session_id = ?1 AND status = ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![session_id, status.as_str()], row_to_entry)?;
            for row in rows {
                entries.push(row?);
            }
        } else {
            let mut stmt = conn.prepare("SELECT * FROM processes WHERE session_id = ?1")?;
            let rows = stmt.query_map(rusqlite::params![session_id], row_to_entry)?;
            for row in rows {
                entries.push(row?);
            }
        }
        Ok(entries)
    }

    pub async fn get_all_processes(
        &self,
        status: Option<ProcessStatus>,
        host: Option<&str>,
    ) -> anyhow::Result<Vec<ProcessEntry>> {
        let conn = self.conn.lock().await;
        let mut query = "SELECT * FROM processes WHERE 1=1".to_string();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = status {
            query.push_str(" AND status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }
        if let Some(host) = host {
            query.push_str(" AND host = ?");
            params.push(Box::new(host.to_string()));
        }

        let mut stmt = conn.prepare(&query)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub async fn update_process_status(
        &self,
        pid: i64,
        host: &str,
        status: ProcessStatus,
        metadata: Option<&serde_json::Value>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let current: Option<(String, String)> = conn
            .query_row(
                "SELECT status, session_id FROM processes WHERE pid=?1 AND host=?2",
                rusqlite::params![pid, host],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        let Some((old_status, session_id)) = current else {
            log::warn!("process {pid} on {host} not found");
            return Ok(());
        };

        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        if let Some(metadata) = metadata {
            tx.execute(
                "UPDATE processes SET status=?1, last_seen=?2, metadata=?3 WHERE pid=?4 AND host=?5",
                rusqlite::params![status.as_str(), now, serde_json::to_string(metadata)?, pid, host],
            )?;
        } else {
            tx.execute(
                "UPDATE processes SET status=?1, last_seen=?2 WHERE pid=?3 AND host=?4",
                rusqlite::params![status.as_str(), now, pid, host],
            )?;
        }

        if old_status != status.as_str() {
            Self::record_history(
                &tx,
                pid,
                host,
                &session_id,
                "status_changed",
                Some(&old_status),
                Some(status.as_str()),
                Some(&format!("status changed from {old_status} to {}", status.as_str())),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn update_process_resources(
        &self,
        pid: i64,
        host: &str,
        cpu_percent: Option<f64>,
        memory_mb: Option<f64>,
        disk_read_mb: Option<f64>,
        disk_write_mb: Option<f64>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE processes SET last_seen=?1, cpu_percent=COALESCE(?2, cpu_percent),
                 memory_mb=COALESCE(?3, memory_mb), disk_read_mb=COALESCE(?4, disk_read_mb),
                 disk_write_mb=COALESCE(?5, disk_write_mb)
             WHERE pid=?6 AND host=?7",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                cpu_percent,
                memory_mb,
                disk_read_mb,
                disk_write_mb,
                pid,
                host
            ],
        )?;
        Ok(())
    }

    pub async fn remove_process(&self, pid: i64, host: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let current: Option<(String, String)> = conn
            .query_row(
                "SELECT session_id, status FROM processes WHERE pid=?1 AND host=?2",
                rusqlite::params![pid, host],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        let Some((session_id, status)) = current else {
            return Ok(());
        };

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM processes WHERE pid=?1 AND host=?2",
            rusqlite::params![pid, host],
        )?;
        Self::record_history(
            &tx,
            pid,
            host,
            &session_id,
            "removed",
            Some(&status),
            None,
            Some("process removed from registry"),
        )?;
        tx.commit()?;
        log::debug!("removed process {pid} on {host}");
        Ok(())
    }

    pub async fn cleanup_stale_processes(&self, stale_threshold_secs: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().await;
        let threshold = (Utc::now() - ChronoDuration::seconds(stale_threshold_secs)).to_rfc3339();

        let mut stmt = conn.prepare(
            "SELECT pid, host, session_id, status FROM processes WHERE last_seen < ?1",
        )?;
        let stale: Vec<(i64, String, String, String)> = stmt
            .query_map(rusqlite::params![threshold], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let tx = conn.unchecked_transaction()?;
        for (pid, host, session_id, status) in &stale {
            Self::record_history(
                &tx,
                *pid,
                host,
                session_id,
                "removed",
                Some(status),
                None,
                Some(&format!("stale process (not seen for {stale_threshold_secs}s)")),
            )?;
        }
        tx.execute("DELETE FROM processes WHERE last_seen < ?1", rusqlite::params![threshold])?;
        tx.commit()?;

        if !stale.is_empty() {
            log::info!("cleaned up {} stale processes", stale.len());
        }
        Ok(stale.len())
    }

    pub async fn send_message(
        &self,
        from_session: &str,
        to_session: Option<&str>,
        message_type: &str,
        payload: &serde_json::Value,
        ttl_secs: i64,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(ttl_secs);
        conn.execute(
            "INSERT INTO messages (from_session, to_session, message_type, payload, created_at, expires_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            rusqlite::params![
                from_session,
                to_session,
                message_type,
                serde_json::to_string(payload)?,
                now.to_rfc3339(),
                expires_at.to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_messages(&self, session_id: &str, unread_only: bool) -> anyhow::Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        let query = if unread_only {
            "SELECT * FROM messages WHERE (to_session = ?1 OR to_session IS NULL)
                 AND read_at IS NULL AND expires_at > ?2 ORDER BY created_at"
        } else {
            "SELECT * FROM messages WHERE (to_session = ?1 OR to_session IS NULL)
                 AND expires_at > ?2 ORDER BY created_at"
        };

        let mut stmt = conn.prepare(query)?;
        let rows = stmt.query_map(rusqlite::params![session_id, now], |row| {
            let payload: String = row.get("payload")?;
            let created_at: String = row.get("created_at")?;
            let read_at: Option<String> = row.get("read_at")?;
            let expires_at: String = row.get("expires_at")?;
            Ok(Message {
                id: row.get("id")?,
                from_session: row.get("from_session")?,
                to_session: row.get("to_session")?,
                message_type: row.get("message_type")?,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
                read_at: read_at.and_then(|s| s.parse().ok()),
                expires_at: expires_at.parse().unwrap_or_else(|_| Utc::now()),
            })
        })?;

        let mut messages = Vec::new();
        let mut ids = Vec::new();
        for row in rows {
            let message = row?;
            ids.push(message.id);
            messages.push(message);
        }

        if unread_only && !ids.is_empty() {
            let tx = conn.unchecked_transaction()?;
            for id in &ids {
                tx.execute(
                    "UPDATE messages SET read_at=?1 WHERE id=?2",
                    rusqlite::params![Utc::now().to_rfc3339(), id],
                )?;
            }
            tx.commit()?;
        }

        Ok(messages)
    }

    pub async fn cleanup_expired_messages(&self) -> anyhow::Result<usize> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let removed = conn.execute("DELETE FROM messages WHERE expires_at < ?1", rusqlite::params![now])?;
        Ok(removed)
    }

    pub async fn get_process_history(
        &self,
        pid: Option<i64>,
        session_id: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock().await;
        let mut query = "SELECT * FROM process_history WHERE 1=1".to_string();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(pid) = pid {
            query.push_str(" AND pid = ?");
            params.push(Box::new(pid));
        }
        if let Some(session_id) = session_id {
            query.push_str(" AND session_id = ?");
            params.push(Box::new(session_id.to_string()));
        }
        query.push_str(" ORDER BY event_time DESC LIMIT ?");
        params.push(Box::new(limit));

        let mut stmt = conn.prepare(&query)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let event_time: String = row.get("event_time")?;
            Ok(HistoryEntry {
                id: row.get("id")?,
                pid: row.get("pid")?,
                host: row.get("host")?,
                session_id: row.get("session_id")?,
                event_type: row.get("event_type")?,
                event_time: event_time.parse().unwrap_or_else(|_| Utc::now()),
                old_status: row.get("old_status")?,
                new_status: row.get("new_status")?,
                details: row.get("details")?,
            })
        })?;

        let mut history = Vec::new();
        for row in rows {
            history.push(row?);
        }
        Ok(history)
    }

    /// Enforces retention: deletes history rows older than `retention_days`.
    pub async fn purge_old_history(&self, retention_days: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - ChronoDuration::days(retention_days)).to_rfc3339();
        let purged = conn.execute(
            "DELETE FROM process_history WHERE event_time < ?1",
            rusqlite::params![cutoff],
        )?;
        if purged > 0 {
            log::info!("purged {purged} old process_history rows");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(pid: i64, host: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            session_id: "session-1".into(),
            project_path: Some("/tmp/project".into()),
            command: "claude".into(),
            args: vec!["--foo".into()],
            env: HashMap::new(),
            status: ProcessStatus::Running,
            started_at: Utc::now(),
            last_seen: Utc::now(),
            host: host.into(),
            port: None,
            user: Some("alice".into()),
            metadata: serde_json::json!({}),
            cpu_percent: Some(1.0),
            memory_mb: Some(10.0),
            disk_read_mb: None,
            disk_write_mb: None,
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = RegistryStorage::open(&dir.path().join("registry.db")).await.unwrap();

        let entry = sample_entry(100, "host-a");
        storage.register_process(&entry).await.unwrap();

        let fetched = storage.get_process(100, "host-a").await.unwrap().unwrap();
        assert_eq!(fetched.command, "claude");
        assert_eq!(fetched.session_id, "session-1");
    }

    #[tokio::test]
    async fn reregistering_same_pid_updates_in_place() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = RegistryStorage::open(&dir.path().join("registry.db")).await.unwrap();

        let mut entry = sample_entry(200, "host-a");
        storage.register_process(&entry).await.unwrap();
        entry.command = "claude-updated".into();
        storage.register_process(&entry).await.unwrap();

        let all = storage.get_all_processes(None, Some("host-a")).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].command, "claude-updated");

        let history = storage.get_process_history(Some(200), None, 10).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn status_change_records_history_row() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = RegistryStorage::open(&dir.path().join("registry.db")).await.unwrap();

        let entry = sample_entry(300, "host-a");
        storage.register_process(&entry).await.unwrap();
        storage
            .update_process_status(300, "host-a", ProcessStatus::Stopped, None)
            .await
            .unwrap();

        let fetched = storage.get_process(300, "host-a").await.unwrap().unwrap();
        assert_eq!(fetched.status, ProcessStatus::Stopped);

        let history = storage.get_process_history(Some(300), None, 10).await.unwrap();
        assert!(history.iter().any(|h| h.event_type == "status_changed"));
    }

    #[tokio::test]
    async fn purge_old_history_deletes_rows_past_retention() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = RegistryStorage::open(&dir.path().join("registry.db")).await.unwrap();

        let entry = sample_entry(400, "host-a");
        storage.register_process(&entry).await.unwrap();

        // Retention of 0 days purges everything already recorded.
        let purged = storage.purge_old_history(0).await.unwrap();
        assert!(purged >= 1);
    }

    #[tokio::test]
    async fn broadcast_message_is_visible_to_any_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = RegistryStorage::open(&dir.path().join("registry.db")).await.unwrap();

        storage
            .send_message("sender", None, "ping", &serde_json::json!({"x": 1}), 3600)
            .await
            .unwrap();

        let messages = storage.get_messages("anyone", true).await.unwrap();
        assert_eq!(messages.len(), 1);

        // Second read finds nothing unread.
        let messages_again = storage.get_messages("anyone", true).await.unwrap();
        assert!(messages_again.is_empty());
    }
}
