use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    Checkpoint,
    Restore,
    Branch,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub checkpoint_id: String,
    pub event_type: TimelineEventType,
    pub message: String,
    pub author: String,
    pub parent_id: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TimelineFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub event_types: Option<HashSet<TimelineEventType>>,
    pub branch: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TimelineFile {
    #[serde(default)]
    entries: Vec<TimelineEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BranchesFile {
    #[serde(default)]
    branches: HashMap<String, String>,
}

struct Inner {
    entries: Vec<TimelineEntry>,
    branches: HashMap<String, String>,
}

/// Append-only event log plus named-branch map over checkpoint ids.
pub struct Timeline {
    timeline_path: PathBuf,
    branches_path: PathBuf,
    inner: RwLock<Inner>,
}

impl Timeline {
    pub async fn open(timeline_path: PathBuf, branches_path: PathBuf) -> Result<Self> {
        let entries = if timeline_path.exists() {
            let data = tokio::fs::read_to_string(&timeline_path)
                .await
                .context("failed to read timeline")?;
            serde_json::from_str::<TimelineFile>(&data)
                .context("failed to parse timeline")?
                .entries
        } else {
            Vec::new()
        };

        let branches = if branches_path.exists() {
            let data = tokio::fs::read_to_string(&branches_path)
                .await
                .context("failed to read branches")?;
            serde_json::from_str::<BranchesFile>(&data)
                .context("failed to parse branches")?
                .branches
        } else {
            HashMap::new()
        };

        log::info!(
            "timeline initialized with {} entries, {} branches",
            entries.len(),
            branches.len()
        );

        Ok(Self {
            timeline_path,
            branches_path,
            inner: RwLock::new(Inner { entries, branches }),
        })
    }

    async fn save_timeline_locked(&self, inner: &Inner) -> Result<()> {
        let data = TimelineFile {
            entries: inner.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&data)?;
        tokio::fs::write(&self.timeline_path, json).await?;
        Ok(())
    }

    async fn save_branches_locked(&self, inner: &Inner) -> Result<()> {
        let data = BranchesFile {
            branches: inner.branches.clone(),
        };
        let json = serde_json::to_string_pretty(&data)?;
        tokio::fs::write(&self.branches_path, json).await?;
        Ok(())
    }

    pub async fn add_checkpoint(
        &self,
        checkpoint_id: &str,
        message: &str,
        author: &str,
        parent_id: Option<String>,
        branch: Option<String>,
    ) -> Result<TimelineEntry> {
        let entry = TimelineEntry {
            timestamp: Utc::now(),
            checkpoint_id: checkpoint_id.to_string(),
            event_type: TimelineEventType::Checkpoint,
            message: message.to_string(),
            author: author.to_string(),
            parent_id,
            branch: branch.clone(),
        };

        let mut inner = self.inner.write().await;
        inner.entries.push(entry.clone());
        if let Some(branch_name) = branch {
            inner.branches.insert(branch_name, checkpoint_id.to_string());
            self.save_branches_locked(&inner).await?;
        }
        self.save_timeline_locked(&inner).await?;

        Ok(entry)
    }

    pub async fn add_restore(&self, checkpoint_id: &str, author: &str) -> Result<TimelineEntry> {
        let entry = TimelineEntry {
            timestamp: Utc::now(),
            checkpoint_id: checkpoint_id.to_string(),
            event_type: TimelineEventType::Restore,
            message: format!("Restored to checkpoint {checkpoint_id}"),
            author: author.to_string(),
            parent_id: None,
            branch: None,
        };

        let mut inner = self.inner.write().await;
        inner.entries.push(entry.clone());
        self.save_timeline_locked(&inner).await?;
        Ok(entry)
    }

    /// Fails validation if `checkpoint_id` has never appeared in the timeline, or if
    /// `branch_name` already exists.
    pub async fn create_branch(
        &self,
        branch_name: &str,
        checkpoint_id: &str,
        author: &str,
        checkpoint_exists: bool,
    ) -> Result<TimelineEntry> {
        if !checkpoint_exists {
            anyhow::bail!("cannot create branch pointing to nonexistent checkpoint {checkpoint_id}");
        }

        let mut inner = self.inner.write().await;
        if inner.branches.contains_key(branch_name) {
            anyhow::bail!("branch already exists: {branch_name}");
        }

        let entry = TimelineEntry {
            timestamp: Utc::now(),
            checkpoint_id: checkpoint_id.to_string(),
            event_type: TimelineEventType::Branch,
            message: format!("Created branch '{branch_name}'"),
            author: author.to_string(),
            parent_id: None,
            branch: Some(branch_name.to_string()),
        };

        inner.entries.push(entry.clone());
        inner.branches.insert(branch_name.to_string(), checkpoint_id.to_string());
        self.save_timeline_locked(&inner).await?;
        self.save_branches_locked(&inner).await?;

        Ok(entry)
    }

    pub async fn delete_branch(&self, branch_name: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner.branches.remove(branch_name).is_some();
        if removed {
            self.save_branches_locked(&inner).await?;
        }
        Ok(removed)
    }

    pub async fn get_branch(&self, branch_name: &str) -> Option<String> {
        self.inner.read().await.branches.get(branch_name).cloned()
    }

    pub async fn list_branches(&self) -> HashMap<String, String> {
        self.inner.read().await.branches.clone()
    }

    pub async fn get_timeline(&self, filter: TimelineFilter) -> Result<Vec<TimelineEntry>> {
        let inner = self.inner.read().await;
        let mut entries: Vec<TimelineEntry> = inner.entries.clone();
        drop(inner);

        if let Some(since) = filter.since {
            entries.retain(|e| e.timestamp >= since);
        }
        if let Some(until) = filter.until {
            entries.retain(|e| e.timestamp <= until);
        }
        if let Some(types) = &filter.event_types {
            entries.retain(|e| types.contains(&e.event_type));
        }
        if let Some(branch) = &filter.branch {
            let branch_checkpoints = self.branch_checkpoints(branch).await;
            entries.retain(|e| branch_checkpoints.contains(&e.checkpoint_id));
        }

        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }

        Ok(entries)
    }

    /// Real parent-chain walk: a checkpoint history only ever includes entries whose
    /// checkpoint is actually an ancestor of the target, not every entry before it.
    pub async fn get_checkpoint_history(
        &self,
        checkpoint_id: &str,
        include_future: bool,
    ) -> Vec<TimelineEntry> {
        let inner = self.inner.read().await;

        let checkpoint_entry = inner.entries.iter().find(|e| {
            e.checkpoint_id == checkpoint_id && e.event_type == TimelineEventType::Checkpoint
        });

        let Some(checkpoint_entry) = checkpoint_entry.cloned() else {
            return Vec::new();
        };

        if include_future {
            return inner
                .entries
                .iter()
                .filter(|e| e.checkpoint_id == checkpoint_id)
                .cloned()
                .collect();
        }

        let ancestors = Self::ancestors_of(&inner.entries, checkpoint_id);
        inner
            .entries
            .iter()
            .filter(|e| {
                e.timestamp <= checkpoint_entry.timestamp
                    && (e.checkpoint_id == checkpoint_id || ancestors.contains(&e.checkpoint_id))
            })
            .cloned()
            .collect()
    }

    pub async fn find_common_ancestor(&self, id1: &str, id2: &str) -> Option<String> {
        let inner = self.inner.read().await;
        let ancestors1 = Self::ancestor_chain(&inner.entries, id1);
        let ancestors2: HashSet<String> = Self::ancestor_chain(&inner.entries, id2).into_iter().collect();
        ancestors1.into_iter().find(|a| ancestors2.contains(a))
    }

    /// Ordered ancestor chain (nearest first), walking the `parent_id` field recorded
    /// against each checkpoint's `checkpoint` timeline entry.
    fn ancestor_chain(entries: &[TimelineEntry], checkpoint_id: &str) -> Vec<String> {
        let mut ancestors = Vec::new();
        let mut current = checkpoint_id.to_string();
        let mut visited = HashSet::new();

        loop {
            let parent = entries
                .iter()
                .find(|e| e.checkpoint_id == current && e.event_type == TimelineEventType::Checkpoint)
                .and_then(|e| e.parent_id.clone());

            match parent {
                Some(parent_id) if visited.insert(parent_id.clone()) => {
                    ancestors.push(parent_id.clone());
                    current = parent_id;
                }
                _ => break,
            }
        }

        ancestors
    }

    fn ancestors_of(entries: &[TimelineEntry], checkpoint_id: &str) -> HashSet<String> {
        Self::ancestor_chain(entries, checkpoint_id).into_iter().collect()
    }

    async fn branch_checkpoints(&self, branch_name: &str) -> HashSet<String> {
        let inner = self.inner.read().await;
        let Some(head) = inner.branches.get(branch_name).cloned() else {
            return HashSet::new();
        };
        let mut set = Self::ancestors_of(&inner.entries, &head);
        set.insert(head);
        set
    }

    /// True iff `ancestor_id` actually appears in `descendant_id`'s parent chain.
    pub async fn is_ancestor(&self, ancestor_id: &str, descendant_id: &str) -> bool {
        let inner = self.inner.read().await;
        Self::ancestor_chain(&inner.entries, descendant_id).contains(&ancestor_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn new_timeline() -> (TempDir, Timeline) {
        let dir = TempDir::new().unwrap();
        let timeline = Timeline::open(dir.path().join("timeline.json"), dir.path().join("branches.json"))
            .await
            .unwrap();
        (dir, timeline)
    }

    #[tokio::test]
    async fn branch_round_trips() {
        let (_dir, timeline) = new_timeline().await;
        timeline
            .add_checkpoint("c1", "first", "alice", None, None)
            .await
            .unwrap();
        timeline.create_branch("main", "c1", "alice", true).await.unwrap();
        assert_eq!(timeline.get_branch("main").await, Some("c1".to_string()));

        timeline.delete_branch("main").await.unwrap();
        assert_eq!(timeline.get_branch("main").await, None);
    }

    #[tokio::test]
    async fn create_branch_to_nonexistent_checkpoint_fails() {
        let (_dir, timeline) = new_timeline().await;
        let result = timeline.create_branch("main", "ghost", "alice", false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ancestor_walk_follows_real_parent_chain() {
        let (_dir, timeline) = new_timeline().await;
        timeline.add_checkpoint("c1", "root", "alice", None, None).await.unwrap();
        timeline
            .add_checkpoint("c2", "child", "alice", Some("c1".to_string()), None)
            .await
            .unwrap();
        timeline
            .add_checkpoint("c3", "unrelated", "alice", None, None)
            .await
            .unwrap();

        assert!(timeline.is_ancestor("c1", "c2").await);
        assert!(!timeline.is_ancestor("c3", "c2").await);
        assert!(!timeline.is_ancestor("c2", "c1").await);
    }

    #[tokio::test]
    async fn common_ancestor_is_found() {
        let (_dir, timeline) = new_timeline().await;
        timeline.add_checkpoint("root", "root", "a", None, None).await.unwrap();
        timeline
            .add_checkpoint("left", "left", "a", Some("root".to_string()), None)
            .await
            .unwrap();
        timeline
            .add_checkpoint("right", "right", "a", Some("root".to_string()), None)
            .await
            .unwrap();

        let ancestor = timeline.find_common_ancestor("left", "right").await;
        assert_eq!(ancestor, Some("root".to_string()));
    }
}
