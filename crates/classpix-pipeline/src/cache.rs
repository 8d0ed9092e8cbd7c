//! Per-date recognition result cache.
//!
//! One JSON file per date bucket under `output/.state/`. Entries are
//! keyed by `(relative path, size, mtime)` and stamped with a parameter
//! fingerprint; any parameter change empties the cache for that run. A
//! cache that fails to parse is treated as empty, never as an error.

use classpix_core::{BackendDescriptor, RecognitionResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::fsutil;

pub const CACHE_VERSION: u32 = 1;
pub const CACHE_DIR_NAME: &str = "recognition_cache_by_date";

/// Version of the matching policy itself. Bump when the labeling rules
/// change in a way that invalidates cached results.
pub const MATCH_POLICY_VERSION: u32 = 1;

/// Digest over everything that determines a recognition result besides
/// the photo bytes. Any change invalidates every per-date cache.
pub fn compute_params_fingerprint(
    tolerance: f32,
    min_face_size: u32,
    backend: &BackendDescriptor,
    reference_fingerprint: &str,
) -> String {
    #[derive(Serialize)]
    struct Params<'a> {
        tolerance: f32,
        min_face_size: u32,
        backend: &'a BackendDescriptor,
        reference_fingerprint: &'a str,
        match_policy_version: u32,
    }

    let payload = serde_json::to_vec(&Params {
        tolerance,
        min_face_size,
        backend,
        reference_fingerprint,
        match_policy_version: MATCH_POLICY_VERSION,
    })
    .expect("fingerprint params serialize");

    format!("sha256:{}", hex::encode(Sha256::digest(&payload)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub size: u64,
    pub mtime: i64,
    pub result: RecognitionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateCache {
    pub version: u32,
    pub date: String,
    pub params_fingerprint: String,
    /// Relative path → entry.
    pub entries: BTreeMap<String, CacheEntry>,
}

impl DateCache {
    pub fn empty(date: &str, params_fingerprint: &str) -> Self {
        Self {
            version: CACHE_VERSION,
            date: date.to_string(),
            params_fingerprint: params_fingerprint.to_string(),
            entries: BTreeMap::new(),
        }
    }

    /// Hit iff the path is present with the same size and mtime.
    pub fn lookup(&self, rel_path: &str, size: u64, mtime: i64) -> Option<&RecognitionResult> {
        let entry = self.entries.get(rel_path)?;
        if entry.size == size && entry.mtime == mtime {
            Some(&entry.result)
        } else {
            None
        }
    }

    pub fn store(&mut self, rel_path: &str, size: u64, mtime: i64, result: RecognitionResult) {
        self.entries.insert(
            rel_path.to_string(),
            CacheEntry {
                size,
                mtime,
                result,
            },
        );
    }

    /// Drop entries whose path left the bucket, so caches track the
    /// input instead of growing forever.
    pub fn prune(&mut self, keep: &BTreeSet<String>) {
        self.entries.retain(|path, _| keep.contains(path));
    }
}

pub fn cache_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(CACHE_DIR_NAME)
}

pub fn cache_file_path(state_dir: &Path, date: &str) -> PathBuf {
    cache_dir(state_dir).join(format!("{date}.json"))
}

/// Load the cache for one date, then reset it if its fingerprint does
/// not match the current parameters. Missing or corrupt files are an
/// empty cache.
pub fn load(state_dir: &Path, date: &str, params_fingerprint: &str) -> DateCache {
    let path = cache_file_path(state_dir, date);
    let raw = match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<DateCache>(&content) {
            Ok(cache) if cache.version == CACHE_VERSION => cache,
            Ok(cache) => {
                tracing::warn!(date, version = cache.version, "cache version mismatch, rebuilding");
                return DateCache::empty(date, params_fingerprint);
            }
            Err(e) => {
                tracing::warn!(date, error = %e, "corrupt recognition cache, rebuilding");
                return DateCache::empty(date, params_fingerprint);
            }
        },
        Err(_) => return DateCache::empty(date, params_fingerprint),
    };

    if raw.params_fingerprint != params_fingerprint {
        tracing::info!(date, "recognition parameters changed, cache reset");
        return DateCache::empty(date, params_fingerprint);
    }
    raw
}

/// Peek at the fingerprint persisted for a date without resetting
/// anything. `None` means no usable cache file.
pub fn persisted_fingerprint(state_dir: &Path, date: &str) -> Option<String> {
    let content = std::fs::read_to_string(cache_file_path(state_dir, date)).ok()?;
    let cache: DateCache = serde_json::from_str(&content).ok()?;
    if cache.version == CACHE_VERSION {
        Some(cache.params_fingerprint)
    } else {
        None
    }
}

/// Persist one date cache atomically.
pub fn save_atomic(state_dir: &Path, cache: &DateCache) -> Result<(), fsutil::FsError> {
    let path = cache_file_path(state_dir, &cache.date);
    let payload = serde_json::to_vec_pretty(cache).expect("cache serializes");
    fsutil::write_atomic(&path, &payload)
}

/// Remove the cache file for a deleted date. Best-effort.
pub fn invalidate(state_dir: &Path, date: &str) {
    let path = cache_file_path(state_dir, date);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(date, error = %e, "could not remove stale cache file");
        }
    }
}
