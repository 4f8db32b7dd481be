use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::cas::Cas;
use super::timeline::Timeline;
use super::{Checkpoint, CheckpointDiff, CheckpointFilter, CheckpointPaths, CheckpointStats};
use crate::notify::NotificationCenter;

/// Orchestrates checkpoint creation, retrieval, diffing, restore and GC over a CAS
/// and timeline rooted at a single project directory.
pub struct CheckpointManager {
    paths: CheckpointPaths,
    cas: Arc<Cas>,
    timeline: Arc<Timeline>,
    notifications: Arc<NotificationCenter>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    refs: RwLock<HashMap<String, String>>,
    head: RwLock<Option<String>>,
}

impl CheckpointManager {
    pub async fn open(
        root: PathBuf,
        compression_level: i32,
        notifications: Arc<NotificationCenter>,
    ) -> Result<Self> {
        let paths = CheckpointPaths::new(root);
        tokio::fs::create_dir_all(paths.checkpoints_dir()).await?;
        tokio::fs::create_dir_all(paths.refs_dir()).await?;

        let cas = Cas::open(paths.cas_dir(), compression_level).await?;
        let timeline = Arc::new(Timeline::open(paths.timeline_file(), paths.branches_file()).await?);

        let checkpoints = Self::load_checkpoints(&paths.checkpoints_dir()).await?;
        let refs = Self::load_refs(&paths.refs_dir()).await?;
        let head = Self::load_head(&paths.head_file()).await?;

        log::info!(
            "checkpoint manager initialized: {} checkpoints, {} refs, head={:?}",
            checkpoints.len(),
            refs.len(),
            head
        );

        Ok(Self {
            paths,
            cas,
            timeline,
            notifications,
            checkpoints: RwLock::new(checkpoints),
            refs: RwLock::new(refs),
            head: RwLock::new(head),
        })
    }

    async fn load_checkpoints(dir: &Path) -> Result<HashMap<String, Checkpoint>> {
        let mut map = HashMap::new();
        if !dir.exists() {
            return Ok(map);
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(data) => match serde_json::from_str::<Checkpoint>(&data) {
                    Ok(cp) => {
                        map.insert(cp.id.clone(), cp);
                    }
                    Err(e) => log::error!("failed to parse checkpoint {path:?}: {e}"),
                },
                Err(e) => log::error!("failed to read checkpoint {path:?}: {e}"),
            }
        }
        Ok(map)
    }

    async fn load_refs(dir: &Path) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        if !dir.exists() {
            return Ok(map);
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let (Some(name), Ok(content)) = (
                path.file_name().and_then(|n| n.to_str()),
                tokio::fs::read_to_string(&path).await,
            ) {
                map.insert(name.to_string(), content.trim().to_string());
            }
        }
        Ok(map)
    }

    async fn load_head(path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(path).await?;
        Ok(Some(content.trim().to_string()))
    }

    /// Writes each file to CAS, assembles and persists a checkpoint record, moves HEAD,
    /// and records a timeline entry.
    pub async fn create_checkpoint(
        &self,
        files: HashMap<PathBuf, Vec<u8>>,
        message: &str,
        author: &str,
        parent_id: Option<String>,
        tags: Vec<String>,
    ) -> Result<Checkpoint> {
        let parent_id = match parent_id {
            Some(p) => Some(p),
            None => self.head.read().await.clone(),
        };

        let mut file_hashes = HashMap::with_capacity(files.len());
        let mut total_size = 0u64;
        for (path, content) in &files {
            let hash = self
                .cas
                .store(content, Some(serde_json::json!({ "path": path })))
                .await?;
            total_size += content.len() as u64;
            file_hashes.insert(path.clone(), hash);
        }

        let checkpoint = Checkpoint {
            id: Uuid::new_v4().simple().to_string(),
            parent_id: parent_id.clone(),
            created_at: Utc::now(),
            message: message.to_string(),
            author: author.to_string(),
            tags,
            stats: CheckpointStats {
                file_count: files.len(),
                total_size,
            },
            files: file_hashes,
        };

        self.save_checkpoint(&checkpoint).await?;
        self.update_head(Some(checkpoint.id.clone())).await?;
        self.timeline
            .add_checkpoint(&checkpoint.id, message, author, parent_id, None)
            .await?;

        self.notifications.notify(
            "checkpoint",
            &format!("Checkpoint created: {message}"),
            serde_json::json!({ "checkpoint_id": checkpoint.id, "file_count": checkpoint.stats.file_count }),
        );

        log::info!(
            "checkpoint created: {} ({} files)",
            checkpoint.id,
            checkpoint.stats.file_count
        );

        Ok(checkpoint)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        {
            let mut checkpoints = self.checkpoints.write().await;
            checkpoints.insert(checkpoint.id.clone(), checkpoint.clone());
        }
        let path = self.paths.checkpoint_file(&checkpoint.id);
        let json = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&path, json)
            .await
            .context("failed to write checkpoint file")?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, id: &str) -> Option<Checkpoint> {
        self.checkpoints.read().await.get(id).cloned()
    }

    pub async fn list_checkpoints(&self, filter: CheckpointFilter) -> Vec<Checkpoint> {
        let checkpoints = self.checkpoints.read().await;
        let mut list: Vec<Checkpoint> = checkpoints.values().cloned().collect();
        drop(checkpoints);

        if let Some(since) = filter.since {
            list.retain(|c| c.created_at >= since);
        }
        if let Some(until) = filter.until {
            list.retain(|c| c.created_at <= until);
        }
        if !filter.tags.is_empty() {
            let wanted: HashSet<&String> = filter.tags.iter().collect();
            list.retain(|c| c.tags.iter().any(|t| wanted.contains(t)));
        }

        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            list.truncate(limit);
        }
        list
    }

    pub async fn get_checkpoint_files(
        &self,
        id: &str,
        paths: Option<&[PathBuf]>,
    ) -> Result<HashMap<PathBuf, Vec<u8>>> {
        let checkpoint = self
            .get_checkpoint(id)
            .await
            .ok_or_else(|| anyhow::anyhow!("checkpoint not found: {id}"))?;

        let wanted: Vec<PathBuf> = match paths {
            Some(p) => p.to_vec(),
            None => checkpoint.files.keys().cloned().collect(),
        };

        let mut files = HashMap::new();
        for path in wanted {
            let Some(hash) = checkpoint.files.get(&path) else {
                continue;
            };
            match self.cas.retrieve(hash).await? {
                Some(content) => {
                    files.insert(path, content);
                }
                None => log::warn!("content missing for {path:?} in checkpoint {id}"),
            }
        }

        Ok(files)
    }

    pub async fn diff(&self, from_id: Option<&str>, to_id: &str) -> Result<CheckpointDiff> {
        let to_checkpoint = self
            .get_checkpoint(to_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("checkpoint not found: {to_id}"))?;

        let from_files: HashMap<PathBuf, String> = match from_id {
            Some(id) => {
                self.get_checkpoint(id)
                    .await
                    .ok_or_else(|| anyhow::anyhow!("checkpoint not found: {id}"))?
                    .files
            }
            None => HashMap::new(),
        };

        let to_files = &to_checkpoint.files;
        let from_keys: HashSet<&PathBuf> = from_files.keys().collect();
        let to_keys: HashSet<&PathBuf> = to_files.keys().collect();

        let added: Vec<PathBuf> = to_keys.difference(&from_keys).map(|p| (*p).clone()).collect();
        let removed: Vec<PathBuf> = from_keys.difference(&to_keys).map(|p| (*p).clone()).collect();

        let mut modified = Vec::new();
        let mut unchanged_count = 0;
        for path in from_keys.intersection(&to_keys) {
            if from_files[*path] != to_files[*path] {
                modified.push((*path).clone());
            } else {
                unchanged_count += 1;
            }
        }

        let total_changes = added.len() + removed.len() + modified.len();

        Ok(CheckpointDiff {
            added,
            removed,
            modified,
            unchanged_count,
            total_changes,
        })
    }

    /// Destructive restore: materializes the checkpoint's file set onto `target_dir`,
    /// deleting any file present on disk but absent from the checkpoint, then moves HEAD.
    pub async fn restore_checkpoint(&self, id: &str, target_dir: &Path) -> Result<HashMap<PathBuf, Vec<u8>>> {
        let files = self.get_checkpoint_files(id, None).await?;

        let mut current_files = Vec::new();
        collect_files(target_dir, target_dir, &mut current_files)?;

        for current in current_files {
            if !files.contains_key(&current) {
                let full_path = target_dir.join(&current);
                if let Err(e) = tokio::fs::remove_file(&full_path).await {
                    log::warn!("failed to delete {current:?} not present in checkpoint: {e}");
                }
            }
        }

        for (path, content) in &files {
            let full_path = target_dir.join(path);
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full_path, content).await?;
        }

        self.update_head(Some(id.to_string())).await?;
        self.timeline.add_restore(id, "system").await?;

        self.notifications.notify(
            "checkpoint",
            &format!("Checkpoint restored: {id}"),
            serde_json::json!({ "checkpoint_id": id, "file_count": files.len() }),
        );

        log::info!("checkpoint restored: {id} ({} files)", files.len());
        Ok(files)
    }

    /// Deletes a checkpoint. If it was HEAD, HEAD becomes the checkpoint's parent, or
    /// null if it had none — never an arbitrary surviving checkpoint.
    pub async fn delete_checkpoint(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut checkpoints = self.checkpoints.write().await;
            checkpoints.remove(id)
        };
        let Some(checkpoint) = removed else {
            return Ok(false);
        };

        let path = self.paths.checkpoint_file(id);
        let _ = tokio::fs::remove_file(&path).await;

        let mut head = self.head.write().await;
        if head.as_deref() == Some(id) {
            *head = checkpoint.parent_id.clone();
            drop(head);
            self.persist_head(checkpoint.parent_id.as_deref()).await?;
        }

        log::info!("checkpoint deleted: {id}");
        Ok(true)
    }

    pub async fn gc(&self) -> Result<(usize, u64)> {
        let keep: HashSet<String> = {
            let checkpoints = self.checkpoints.read().await;
            checkpoints.values().flat_map(|c| c.files.values().cloned()).collect()
        };
        self.cas.gc(&keep).await
    }

    pub async fn create_ref(&self, name: &str, checkpoint_id: &str) -> Result<()> {
        if self.get_checkpoint(checkpoint_id).await.is_none() {
            anyhow::bail!("checkpoint not found: {checkpoint_id}");
        }
        {
            let mut refs = self.refs.write().await;
            refs.insert(name.to_string(), checkpoint_id.to_string());
        }
        tokio::fs::write(self.paths.ref_file(name), checkpoint_id).await?;
        log::info!("ref created: {name} -> {checkpoint_id}");
        Ok(())
    }

    pub async fn get_ref(&self, name: &str) -> Option<String> {
        self.refs.read().await.get(name).cloned()
    }

    pub async fn delete_ref(&self, name: &str) -> Result<bool> {
        let removed = self.refs.write().await.remove(name).is_some();
        if removed {
            let _ = tokio::fs::remove_file(self.paths.ref_file(name)).await;
        }
        Ok(removed)
    }

    pub async fn list_refs(&self) -> HashMap<String, String> {
        self.refs.read().await.clone()
    }

    pub async fn update_head(&self, checkpoint_id: Option<String>) -> Result<()> {
        {
            let mut head = self.head.write().await;
            *head = checkpoint_id.clone();
        }
        self.persist_head(checkpoint_id.as_deref()).await
    }

    async fn persist_head(&self, checkpoint_id: Option<&str>) -> Result<()> {
        match checkpoint_id {
            Some(id) => {
                tokio::fs::write(self.paths.head_file(), id).await?;
            }
            None => {
                let _ = tokio::fs::remove_file(self.paths.head_file()).await;
            }
        }
        Ok(())
    }

    pub async fn get_head(&self) -> Option<String> {
        self.head.read().await.clone()
    }

    pub fn timeline(&self) -> Arc<Timeline> {
        Arc::clone(&self.timeline)
    }

    pub fn cas(&self) -> Arc<Cas> {
        Arc::clone(&self.cas)
    }
}

fn collect_files(dir: &Path, base: &Path, files: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with('.') {
                    continue;
                }
            }
            collect_files(&path, base, files)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            files.push(rel.to_path_buf());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn new_manager() -> (TempDir, CheckpointManager) {
        let dir = TempDir::new().unwrap();
        let notifications = Arc::new(NotificationCenter::new());
        let manager = CheckpointManager::open(dir.path().to_path_buf(), 3, notifications)
            .await
            .unwrap();
        (dir, manager)
    }

    fn files(entries: &[(&str, &str)]) -> HashMap<PathBuf, Vec<u8>> {
        entries
            .iter()
            .map(|(p, c)| (PathBuf::from(p), c.as_bytes().to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn create_diff_restore_round_trips() {
        let (dir, manager) = new_manager().await;
        let target = dir.path().join("workspace");
        tokio::fs::create_dir_all(&target).await.unwrap();

        let c1 = manager
            .create_checkpoint(files(&[("a.txt", "one")]), "first", "alice", None, vec![])
            .await
            .unwrap();

        let c2 = manager
            .create_checkpoint(
                files(&[("a.txt", "one"), ("b.txt", "two")]),
                "second",
                "alice",
                Some(c1.id.clone()),
                vec![],
            )
            .await
            .unwrap();

        let diff = manager.diff(Some(&c1.id), &c2.id).await.unwrap();
        assert_eq!(diff.added, vec![PathBuf::from("b.txt")]);
        assert!(diff.removed.is_empty());
        assert!(diff.modified.is_empty());
        assert_eq!(diff.total_changes, 1);

        let restored = manager.restore_checkpoint(&c1.id, &target).await.unwrap();
        assert_eq!(restored.len(), 1);
        assert!(!target.join("b.txt").exists());
        assert_eq!(manager.get_head().await, Some(c1.id));
    }

    #[tokio::test]
    async fn deleting_head_with_no_parent_clears_head() {
        let (_dir, manager) = new_manager().await;
        let c1 = manager
            .create_checkpoint(files(&[("a.txt", "x")]), "only", "alice", None, vec![])
            .await
            .unwrap();

        assert_eq!(manager.get_head().await, Some(c1.id.clone()));
        manager.delete_checkpoint(&c1.id).await.unwrap();
        assert_eq!(manager.get_head().await, None);
    }

    #[tokio::test]
    async fn deleting_head_with_parent_moves_head_to_parent() {
        let (_dir, manager) = new_manager().await;
        let c1 = manager
            .create_checkpoint(files(&[("a.txt", "x")]), "first", "alice", None, vec![])
            .await
            .unwrap();
        let c2 = manager
            .create_checkpoint(
                files(&[("a.txt", "y")]),
                "second",
                "alice",
                Some(c1.id.clone()),
                vec![],
            )
            .await
            .unwrap();

        manager.delete_checkpoint(&c2.id).await.unwrap();
        assert_eq!(manager.get_head().await, Some(c1.id));
    }

    #[tokio::test]
    async fn create_ref_rejects_nonexistent_checkpoint() {
        let (_dir, manager) = new_manager().await;
        let result = manager.create_ref("stable", "does-not-exist").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn gc_only_removes_unreferenced_blobs() {
        let (_dir, manager) = new_manager().await;
        let c1 = manager
            .create_checkpoint(files(&[("a.txt", "kept")]), "first", "alice", None, vec![])
            .await
            .unwrap();

        let (removed, _freed) = manager.gc().await.unwrap();
        assert_eq!(removed, 0);
        assert!(manager.get_checkpoint(&c1.id).await.is_some());
    }
}
