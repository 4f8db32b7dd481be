use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub mod cas;
pub mod manager;
pub mod timeline;

pub use cas::Cas;
pub use manager::CheckpointManager;
pub use timeline::Timeline;

/// An immutable, content-addressed snapshot of a file set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub message: String,
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub stats: CheckpointStats,
    /// Relative path -> CAS blob hash.
    pub files: HashMap<PathBuf, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub file_count: usize,
    pub total_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointDiff {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub unchanged_count: usize,
    pub total_changes: usize,
}

/// On-disk layout rooted at a single project directory.
pub struct CheckpointPaths {
    pub root: PathBuf,
}

impl CheckpointPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn cas_dir(&self) -> PathBuf {
        self.root.join("cas")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn checkpoint_file(&self, id: &str) -> PathBuf {
        self.checkpoints_dir().join(format!("{id}.json"))
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root.join("refs")
    }

    pub fn ref_file(&self, name: &str) -> PathBuf {
        self.refs_dir().join(name)
    }

    pub fn head_file(&self) -> PathBuf {
        self.root.join("HEAD")
    }

    pub fn timeline_file(&self) -> PathBuf {
        self.root.join("timeline.json")
    }

    pub fn branches_file(&self) -> PathBuf {
        self.root.join("branches.json")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.root.join("hooks")
    }

    pub fn registry_db(&self) -> PathBuf {
        self.root.join("registry.db")
    }
}
