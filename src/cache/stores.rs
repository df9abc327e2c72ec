//! [`PersistentStore`] implementations
//!
//! - [`MemoryStore`]: process-local map, optionally with a byte quota to model
//!   exhausted storage
//! - [`FileStore`]: one file per key under a directory

use crate::cache::persistent::PersistentStore;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// In-memory key-value store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects writes once its payload would exceed `quota_bytes`
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub async fn used_bytes(&self) -> usize {
        let data = self.data.read().await;
        data.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut data = self.data.write().await;

        if let Some(quota) = self.quota_bytes {
            let used: usize = data
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + bytes.len() > quota {
                return Err(FetchError::CacheWrite(format!(
                    "store quota of {} bytes exceeded",
                    quota
                )));
            }
        }

        data.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let data = self.data.read().await;
        Ok(data.keys().cloned().collect())
    }
}

const FILE_EXTENSION: &str = "entry";

/// File-backed store: `<dir>/<sha256(key)>.entry`
///
/// Each file holds a little-endian `u32` key length, the key bytes, then the
/// payload, so `keys()` can recover original keys from the directory alone.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await.map_err(|e| {
            FetchError::ConfigError(format!("cannot create cache dir {:?}: {}", base_dir, e))
        })?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.base_dir
            .join(format!("{:x}.{}", digest, FILE_EXTENSION))
    }

    fn encode(key: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + key.len() + payload.len());
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Split a file into (key, payload)
    fn decode(raw: &[u8]) -> Option<(String, &[u8])> {
        let len_bytes: [u8; 4] = raw.get(..4)?.try_into().ok()?;
        let key_len = u32::from_le_bytes(len_bytes) as usize;
        let key = raw.get(4..4 + key_len)?;
        let key = String::from_utf8(key.to_vec()).ok()?;
        Some((key, &raw[4 + key_len..]))
    }
}

fn io_error(context: &str, path: &Path, e: std::io::Error) -> FetchError {
    FetchError::CacheWrite(format!("{} {:?}: {}", context, path, e))
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("failed to read", &path, e)),
        };

        match Self::decode(&raw) {
            Some((stored_key, payload)) if stored_key == key => Ok(Some(payload.to_vec())),
            Some(_) => {
                warn!("Hash collision or foreign file at {:?}", path);
                Ok(None)
            }
            None => {
                debug!("Malformed cache file {:?}", path);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");

        tokio::fs::write(&tmp, Self::encode(key, &bytes))
            .await
            .map_err(|e| io_error("failed to write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("failed to rename", &path, e))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("failed to remove", &path, e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| io_error("failed to list", &self.base_dir, e))?;

        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| io_error("failed to list", &self.base_dir, e))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(raw) => {
                    if let Some((key, _)) = Self::decode(&raw) {
                        keys.push(key);
                    }
                }
                Err(e) => warn!("Skipping unreadable cache file {:?}: {}", path, e),
            }
        }

        Ok(keys)
    }
}
