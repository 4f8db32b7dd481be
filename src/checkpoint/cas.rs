use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use zstd::stream::{decode_all, encode_all};

/// Metadata recorded for a single stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasObject {
    pub hash: String,
    pub size: u64,
    pub compressed_size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CasStats {
    pub object_count: usize,
    pub total_size: u64,
    pub compressed_size: u64,
    pub dedup_hits: u64,
}

/// Content-addressable store: SHA-256 keyed, zstd-compressed, sharded on disk.
pub struct Cas {
    objects_path: PathBuf,
    index_path: PathBuf,
    compression_level: i32,
    index: RwLock<HashMap<String, CasObject>>,
    stats: RwLock<CasStats>,
}

impl Cas {
    pub async fn open(storage_path: PathBuf, compression_level: i32) -> Result<Arc<Self>> {
        let objects_path = storage_path.join("objects");
        let index_path = storage_path.join("index.json");
        tokio::fs::create_dir_all(&objects_path)
            .await
            .context("failed to create CAS objects directory")?;

        let index = Self::load_index(&index_path).await?;
        let mut stats = CasStats {
            object_count: index.len(),
            ..Default::default()
        };
        for obj in index.values() {
            stats.total_size += obj.size;
            stats.compressed_size += obj.compressed_size;
        }

        log::info!(
            "cas initialized at {:?} with {} objects",
            storage_path,
            index.len()
        );

        Ok(Arc::new(Self {
            objects_path,
            index_path,
            compression_level,
            index: RwLock::new(index),
            stats: RwLock::new(stats),
        }))
    }

    async fn load_index(index_path: &PathBuf) -> Result<HashMap<String, CasObject>> {
        if !index_path.exists() {
            return Ok(HashMap::new());
        }
        let data = tokio::fs::read_to_string(index_path)
            .await
            .context("failed to read CAS index")?;
        serde_json::from_str(&data).context("failed to parse CAS index")
    }

    async fn save_index_locked(&self, index: &HashMap<String, CasObject>) -> Result<()> {
        let json = serde_json::to_string_pretty(index).context("failed to serialize CAS index")?;
        let tmp_path = self.index_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .context("failed to write CAS index temp file")?;
        tokio::fs::rename(&tmp_path, &self.index_path)
            .await
            .context("failed to rename CAS index into place")?;
        Ok(())
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.objects_path.join(&hash[0..2]).join(&hash[2..])
    }

    /// Store `data`, returning its content hash. Storing identical bytes twice is a no-op
    /// after the first call beyond bumping the dedup counter.
    pub async fn store(&self, data: &[u8], metadata: Option<serde_json::Value>) -> Result<String> {
        let hash = format!("{:x}", Sha256::digest(data));

        {
            let index = self.index.read().await;
            if index.contains_key(&hash) {
                drop(index);
                self.stats.write().await.dedup_hits += 1;
                log::debug!("cas dedup hit: {hash}");
                return Ok(hash);
            }
        }

        let compressed = encode_all(data, self.compression_level).context("zstd compression failed")?;
        let object_path = self.object_path(&hash);
        if let Some(parent) = object_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create CAS shard directory")?;
        }
        tokio::fs::write(&object_path, &compressed)
            .await
            .context("failed to write CAS object")?;

        let object = CasObject {
            hash: hash.clone(),
            size: data.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at: Utc::now(),
            metadata: metadata.unwrap_or(serde_json::Value::Null),
        };

        {
            let mut index = self.index.write().await;
            index.insert(hash.clone(), object.clone());
            self.save_index_locked(&index).await?;
        }

        let mut stats = self.stats.write().await;
        stats.object_count += 1;
        stats.total_size += object.size;
        stats.compressed_size += object.compressed_size;

        log::debug!("cas object stored: {hash} ({} bytes)", data.len());
        Ok(hash)
    }

    /// Retrieve the original bytes for `hash`, verifying the content hash on read.
    /// A missing backing file self-heals by dropping the stale index entry.
    pub async fn retrieve(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        {
            let index = self.index.read().await;
            if !index.contains_key(hash) {
                return Ok(None);
            }
        }

        let object_path = self.object_path(hash);
        if !object_path.exists() {
            log::warn!("cas object file missing, dropping index entry: {hash}");
            let mut index = self.index.write().await;
            index.remove(hash);
            self.save_index_locked(&index).await?;
            return Ok(None);
        }

        let compressed = tokio::fs::read(&object_path)
            .await
            .context("failed to read CAS object")?;
        let data = decode_all(&compressed[..]).context("zstd decompression failed")?;

        let actual_hash = format!("{:x}", Sha256::digest(&data));
        if actual_hash != hash {
            anyhow::bail!("CAS hash mismatch: expected {hash}, got {actual_hash}");
        }

        Ok(Some(data))
    }

    pub async fn exists(&self, hash: &str) -> bool {
        self.index.read().await.contains_key(hash)
    }

    pub async fn get_object(&self, hash: &str) -> Option<CasObject> {
        self.index.read().await.get(hash).cloned()
    }

    pub async fn delete(&self, hash: &str) -> Result<bool> {
        let removed = {
            let mut index = self.index.write().await;
            let obj = index.remove(hash);
            self.save_index_locked(&index).await?;
            obj
        };

        let Some(obj) = removed else {
            return Ok(false);
        };

        let object_path = self.object_path(hash);
        if let Err(e) = tokio::fs::remove_file(&object_path).await {
            log::error!("failed to delete CAS object file {hash}: {e}");
        } else if let Some(parent) = object_path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }

        let mut stats = self.stats.write().await;
        stats.object_count = stats.object_count.saturating_sub(1);
        stats.total_size = stats.total_size.saturating_sub(obj.size);
        stats.compressed_size = stats.compressed_size.saturating_sub(obj.compressed_size);

        log::debug!("cas object deleted: {hash}");
        Ok(true)
    }

    pub async fn list_objects(&self, prefix: Option<&str>) -> Vec<CasObject> {
        let index = self.index.read().await;
        match prefix {
            Some(p) => index.values().filter(|o| o.hash.starts_with(p)).cloned().collect(),
            None => index.values().cloned().collect(),
        }
    }

    /// Delete every object not present in `keep`. Returns `(objects_removed, bytes_freed)`.
    pub async fn gc(&self, keep: &std::collections::HashSet<String>) -> Result<(usize, u64)> {
        let to_remove: Vec<String> = {
            let index = self.index.read().await;
            index.keys().filter(|h| !keep.contains(*h)).cloned().collect()
        };

        let mut removed = 0;
        let mut freed = 0;
        for hash in to_remove {
            if let Some(obj) = self.get_object(&hash).await {
                if self.delete(&hash).await? {
                    removed += 1;
                    freed += obj.compressed_size;
                }
            }
        }

        log::info!("cas gc completed: removed {removed} objects, freed {freed} bytes");
        Ok((removed, freed))
    }

    /// Read-only audit. Returns hashes that fail to retrieve or re-verify; never mutates
    /// the index, so a second run cannot under-report problems the first run already
    /// "fixed" by deletion.
    pub async fn verify_integrity(&self) -> Vec<String> {
        let hashes: Vec<String> = self.index.read().await.keys().cloned().collect();
        let mut corrupted = Vec::new();

        for hash in &hashes {
            let object_path = self.object_path(hash);
            let verified = async {
                let compressed = tokio::fs::read(&object_path).await.ok()?;
                let data = decode_all(&compressed[..]).ok()?;
                let actual = format!("{:x}", Sha256::digest(&data));
                Some(actual == *hash)
            }
            .await;

            if verified != Some(true) {
                corrupted.push(hash.clone());
            }
        }

        if corrupted.is_empty() {
            log::info!("cas integrity check passed: {} objects", hashes.len());
        } else {
            log::warn!(
                "cas integrity check failed: {}/{} objects corrupted",
                corrupted.len(),
                hashes.len()
            );
        }

        corrupted
    }

    pub async fn stats(&self) -> CasStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn new_cas() -> (TempDir, Arc<Cas>) {
        let dir = TempDir::new().unwrap();
        let cas = Cas::open(dir.path().to_path_buf(), 3).await.unwrap();
        (dir, cas)
    }

    #[tokio::test]
    async fn store_then_retrieve_round_trips() {
        let (_dir, cas) = new_cas().await;
        let hash = cas.store(b"hello world", None).await.unwrap();
        let data = cas.retrieve(&hash).await.unwrap().unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn storing_identical_content_dedups() {
        let (_dir, cas) = new_cas().await;
        let h1 = cas.store(b"same bytes", None).await.unwrap();
        let h2 = cas.store(b"same bytes", None).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(cas.stats().await.object_count, 1);
        assert_eq!(cas.stats().await.dedup_hits, 1);
    }

    #[tokio::test]
    async fn retrieve_missing_hash_returns_none() {
        let (_dir, cas) = new_cas().await;
        assert!(cas.retrieve("deadbeef").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retrieve_self_heals_missing_file() {
        let (_dir, cas) = new_cas().await;
        let hash = cas.store(b"data", None).await.unwrap();
        let path = cas.object_path(&hash);
        tokio::fs::remove_file(&path).await.unwrap();

        assert!(cas.retrieve(&hash).await.unwrap().is_none());
        assert!(!cas.exists(&hash).await);
    }

    #[tokio::test]
    async fn gc_removes_unreferenced_objects() {
        let (_dir, cas) = new_cas().await;
        let keep = cas.store(b"keep me", None).await.unwrap();
        let drop_hash = cas.store(b"drop me", None).await.unwrap();

        let keep_set: std::collections::HashSet<String> = [keep.clone()].into_iter().collect();
        let (removed, _freed) = cas.gc(&keep_set).await.unwrap();

        assert_eq!(removed, 1);
        assert!(cas.exists(&keep).await);
        assert!(!cas.exists(&drop_hash).await);
    }

    #[tokio::test]
    async fn verify_integrity_detects_corruption_without_mutating_index() {
        let (_dir, cas) = new_cas().await;
        let hash = cas.store(b"important", None).await.unwrap();
        let path = cas.object_path(&hash);
        tokio::fs::write(&path, b"not valid zstd").await.unwrap();

        let corrupted = cas.verify_integrity().await;
        assert_eq!(corrupted, vec![hash.clone()]);
        // still present in the index; a diagnostic pass never deletes
        assert!(cas.exists(&hash).await);
    }
}
