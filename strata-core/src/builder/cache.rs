//! Build cache for Strata.
//!
//! Maps step cache keys to the layer each step produced, so an unchanged
//! step reuses its layer instead of running again. Each entry is a tarball
//! plus a JSON metadata file; steps that change no files are recorded with
//! metadata only.
//!
//! Inserts are atomic and the first writer wins. A per-key async lock lets
//! concurrent builds in one process agree on who computes a layer; the
//! others wait and then hit the cache.

use crate::builder::layer::{digest_file, LayerBlob};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Metadata for a cached step result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedLayer {
    /// Cache key (hex SHA256)
    pub cache_key: String,
    /// Layer digest; `None` when the step changed no files
    pub digest: Option<String>,
    /// Size of the layer tarball in bytes
    pub size_bytes: u64,
    /// Creation time (Unix milliseconds)
    pub created_at: u64,
    /// Last lookup hit (Unix milliseconds, for LRU)
    pub last_accessed: u64,
    /// Instruction that produced the layer
    pub created_by: String,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheLookupResult {
    /// Step result found in cache
    Hit {
        /// Path to the layer tarball, if the step produced one
        layer_path: Option<PathBuf>,
        metadata: CachedLayer,
    },
    /// Step result not found in cache
    Miss,
}

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize/deserialize metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Cache directory not accessible: {0}")]
    CacheDirectoryError(String),

    #[error("Cached layer {0} could not be read: {1}")]
    Layer(String, String),
}

/// On-disk layer cache shared by concurrent builds.
#[derive(Debug)]
pub struct LayerCache {
    /// Root directory for layer storage
    cache_dir: PathBuf,
    /// Maximum cache size in bytes
    size_limit: u64,
    /// Per-key locks for in-process single computation
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LayerCache {
    /// Opens (creating if needed) a cache directory.
    pub fn with_config(cache_dir: PathBuf, size_limit: u64) -> Result<Self, CacheError> {
        fs::create_dir_all(cache_dir.join("tmp")).map_err(|e| {
            CacheError::CacheDirectoryError(format!("Failed to create {}: {}", cache_dir.display(), e))
        })?;

        Ok(Self { cache_dir, size_limit, key_locks: Mutex::new(HashMap::new()) })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory for in-progress layer files. It lives on the same
    /// filesystem as the cache so inserts can rename.
    pub fn tmp_dir(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }

    /// Takes the computation lock for `cache_key`.
    ///
    /// Hold the guard across lookup, compute and insert; a second builder
    /// asking for the same key waits, then finds the entry.
    pub async fn lock_key(&self, cache_key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // An entry only the map references has no holder and no waiter
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(cache_key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// True while some builder holds or waits on the lock for `cache_key`.
    fn is_busy(&self, cache_key: &str) -> bool {
        let locks = self.key_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.get(cache_key).is_some_and(|lock| Arc::strong_count(lock) > 1)
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.key_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// Looks up a step result by cache key.
    pub fn lookup(&self, cache_key: &str) -> Result<CacheLookupResult, CacheError> {
        let metadata_path = self.metadata_path(cache_key);
        if !metadata_path.exists() {
            debug!("Cache miss for key: {}", cache_key);
            return Ok(CacheLookupResult::Miss);
        }

        let mut metadata = match self.load_metadata(cache_key) {
            Ok(m) => m,
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", cache_key, e);
                return Ok(CacheLookupResult::Miss);
            }
        };

        let layer_path = match metadata.digest {
            Some(_) => {
                let path = self.layer_path(cache_key);
                if !path.exists() {
                    debug!("Cache entry {} lost its layer, treating as miss", cache_key);
                    return Ok(CacheLookupResult::Miss);
                }
                Some(path)
            }
            None => None,
        };

        metadata.last_accessed = Self::current_timestamp();
        self.save_metadata(&metadata)?;

        info!("Cache hit for key: {} ({})", short_key(cache_key), metadata.created_by);
        Ok(CacheLookupResult::Hit { layer_path, metadata })
    }

    /// Inserts a step result.
    ///
    /// If another writer already stored this key, its entry is kept and
    /// returned and `layer` is discarded.
    pub fn insert(
        &self,
        cache_key: &str,
        layer: Option<LayerBlob>,
        created_by: &str,
    ) -> Result<CachedLayer, CacheError> {
        // Validate cache key (should be hex string)
        if cache_key.is_empty() || !cache_key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CacheError::InvalidKey(cache_key.to_string()));
        }

        if let Ok(existing) = self.load_metadata(cache_key) {
            debug!("Cache entry {} already present, discarding new layer", short_key(cache_key));
            return Ok(existing);
        }

        let now = Self::current_timestamp();
        let mut metadata = CachedLayer {
            cache_key: cache_key.to_string(),
            digest: None,
            size_bytes: 0,
            created_at: now,
            last_accessed: now,
            created_by: created_by.to_string(),
        };

        if let Some(blob) = layer {
            let layer_path = self.layer_path(cache_key);
            match blob.file.persist_noclobber(&layer_path) {
                Ok(_) => {
                    metadata.digest = Some(blob.digest);
                    metadata.size_bytes = blob.size;
                }
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    // Lost the race; describe the winner's tarball
                    if let Ok(existing) = self.load_metadata(cache_key) {
                        return Ok(existing);
                    }
                    let digest = digest_file(&layer_path).map_err(|e| CacheError::Layer(cache_key.to_string(), e.to_string()))?;
                    metadata.size_bytes = fs::metadata(&layer_path)?.len();
                    metadata.digest = Some(digest);
                }
                Err(e) => return Err(CacheError::Io(e.error)),
            }
        }

        self.save_metadata(&metadata)?;

        info!(
            "Cached layer {} ({} bytes): {}",
            short_key(cache_key),
            metadata.size_bytes,
            metadata.created_by
        );
        crate::observability::metrics::record_layer_size(metadata.size_bytes);

        self.evict_if_needed(Some(cache_key))?;

        Ok(metadata)
    }

    /// Removes an entry from the cache.
    pub fn remove(&self, cache_key: &str) -> Result<(), CacheError> {
        for path in [self.metadata_path(cache_key), self.layer_path(cache_key)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        debug!("Removed layer from cache: {}", cache_key);
        Ok(())
    }

    /// Clears all cached layers.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for layer in self.list()? {
            self.remove(&layer.cache_key)?;
            removed += 1;
        }

        info!("Cleared {} cached layers", removed);
        Ok(removed)
    }

    /// Returns the total size of cached layers in bytes.
    pub fn total_size(&self) -> Result<u64, CacheError> {
        let mut total = 0u64;

        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map(|e| e == "tar").unwrap_or(false) {
                if let Ok(metadata) = fs::metadata(&path) {
                    total += metadata.len();
                }
            }
        }

        Ok(total)
    }

    /// Returns the number of cached entries.
    pub fn layer_count(&self) -> Result<usize, CacheError> {
        Ok(self.list()?.len())
    }

    /// Lists all entries, most recently used first.
    pub fn list(&self) -> Result<Vec<CachedLayer>, CacheError> {
        let mut layers = self.list_layers_by_lru()?;
        layers.reverse();
        Ok(layers)
    }

    /// Lists all cached layers sorted by last accessed time (oldest first).
    fn list_layers_by_lru(&self) -> Result<Vec<CachedLayer>, CacheError> {
        let mut layers = Vec::new();

        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();

            // Only process .json metadata files
            if path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(cache_key) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix("layer-"))
                {
                    if let Ok(metadata) = self.load_metadata(cache_key) {
                        layers.push(metadata);
                    }
                }
            }
        }

        layers.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed).then_with(|| a.cache_key.cmp(&b.cache_key)));

        Ok(layers)
    }

    /// Evicts least recently used entries until the cache fits `limit`.
    ///
    /// Returns the number of entries removed.
    pub fn prune_to(&self, limit: u64) -> Result<usize, CacheError> {
        self.evict(limit, None)
    }

    fn evict_if_needed(&self, keep: Option<&str>) -> Result<usize, CacheError> {
        self.evict(self.size_limit, keep)
    }

    fn evict(&self, limit: u64, keep: Option<&str>) -> Result<usize, CacheError> {
        let total_size = self.total_size()?;
        if total_size <= limit {
            return Ok(0);
        }

        warn!("Cache size ({} bytes) exceeds limit ({} bytes), evicting old layers", total_size, limit);

        let mut current_size = total_size;
        let mut evicted = 0;

        for layer in self.list_layers_by_lru()? {
            if current_size <= limit {
                break;
            }
            if keep == Some(layer.cache_key.as_str()) || layer.digest.is_none() {
                continue;
            }
            // A builder between lookup and import still needs the tarball
            if self.is_busy(&layer.cache_key) {
                debug!("Skipping eviction of in-use layer {}", short_key(&layer.cache_key));
                continue;
            }

            debug!(
                "Evicting layer {} ({} bytes, last accessed: {})",
                short_key(&layer.cache_key),
                layer.size_bytes,
                layer.last_accessed
            );

            self.remove(&layer.cache_key)?;
            current_size = current_size.saturating_sub(layer.size_bytes);
            evicted += 1;
        }

        crate::observability::metrics::record_cache_eviction(evicted as u64);
        info!("Cache eviction complete. New size: {} bytes", current_size);

        Ok(evicted)
    }

    /// Returns the path to a layer tarball.
    pub fn layer_path(&self, cache_key: &str) -> PathBuf {
        self.cache_dir.join(format!("layer-{}.tar", cache_key))
    }

    /// Returns the path to a layer's metadata file.
    fn metadata_path(&self, cache_key: &str) -> PathBuf {
        self.cache_dir.join(format!("layer-{}.json", cache_key))
    }

    /// Loads metadata for a cached layer.
    fn load_metadata(&self, cache_key: &str) -> Result<CachedLayer, CacheError> {
        let contents = fs::read_to_string(self.metadata_path(cache_key))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Saves metadata for a cached layer, replacing any previous file atomically.
    fn save_metadata(&self, metadata: &CachedLayer) -> Result<(), CacheError> {
        let json = serde_json::to_vec_pretty(metadata)?;
        let mut tmp = NamedTempFile::new_in(self.tmp_dir())?;
        tmp.write_all(&json)?;
        tmp.persist(self.metadata_path(&metadata.cache_key)).map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    /// Returns the current Unix timestamp in milliseconds.
    fn current_timestamp() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

fn short_key(key: &str) -> &str {
    &key[..12.min(key.len())]
}
