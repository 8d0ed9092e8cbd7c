//! Incremental snapshot of the classroom-photo tree.
//!
//! The snapshot records, per date bucket, every supported photo as a
//! `(relative path, size, mtime)` entry. Diffing the previous run's
//! snapshot against the current tree yields the incremental plan: which
//! buckets need recognition and which were deleted and need cleanup.

use chrono::{Local, SecondsFormat};
use classpix_core::BackendDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::dates;
use crate::fsutil;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot file name under the output state directory.
pub fn snapshot_file_name() -> String {
    format!("classroom_snapshot.v{SNAPSHOT_VERSION}.json")
}

/// One photo inside a date bucket. `path` is relative to the classroom
/// root, `/`-separated, so snapshots are stable across platforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    /// Whole seconds; sub-second precision differs across filesystems.
    pub mtime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub version: u32,
    pub backend: BackendDescriptor,
    pub generated_at: String,
    /// Date bucket → sorted photo entries.
    pub dates: BTreeMap<String, Vec<FileEntry>>,
}

/// Buckets needing work, derived once per run from two snapshots.
#[derive(Debug, Clone, Default)]
pub struct IncrementalPlan {
    /// New buckets, or buckets whose entry set differs.
    pub changed_dates: BTreeSet<String>,
    /// Buckets present previously but absent now.
    pub deleted_dates: BTreeSet<String>,
}

/// Counters from the loose-photo archiving pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveStats {
    pub moved: usize,
    pub renamed: usize,
    pub failed: usize,
}

/// Move photos sitting directly under the classroom root into their
/// resolved date folder.
///
/// This is the only mutation the pipeline performs on its input. Name
/// collisions in the target folder rename the incoming file with an
/// ordinal suffix.
pub fn archive_loose_photos(classroom_root: &Path, today: &str) -> ArchiveStats {
    let mut stats = ArchiveStats::default();
    let Ok(entries) = std::fs::read_dir(classroom_root) else {
        return stats;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !fsutil::is_supported_nonempty_image(&path) {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let bucket = dates::resolve_bucket(&path, today);
        let date_dir = classroom_root.join(&bucket);
        if let Err(e) = std::fs::create_dir_all(&date_dir) {
            tracing::warn!(photo = %path.display(), error = %e, "cannot create date folder");
            stats.failed += 1;
            continue;
        }

        let target = fsutil::unique_destination(&date_dir, file_name);
        let renamed = target.file_name().and_then(|n| n.to_str()) != Some(file_name);
        match std::fs::rename(&path, &target) {
            Ok(()) => {
                stats.moved += 1;
                if renamed {
                    stats.renamed += 1;
                    tracing::warn!(
                        from = file_name,
                        to = %target.display(),
                        "name collision while archiving, renamed"
                    );
                } else {
                    tracing::info!(photo = file_name, date = %bucket, "archived loose photo");
                }
            }
            Err(e) => {
                tracing::warn!(photo = %path.display(), error = %e, "archiving move failed");
                stats.failed += 1;
            }
        }
    }

    stats
}

/// Build the current snapshot: archive loose photos, then enumerate
/// every canonical date folder recursively.
pub fn build(
    classroom_root: &Path,
    backend: &BackendDescriptor,
    today: &str,
) -> (SnapshotDescriptor, ArchiveStats) {
    let archive_stats = archive_loose_photos(classroom_root, today);

    let mut buckets: BTreeMap<String, Vec<FileEntry>> = BTreeMap::new();
    if let Ok(entries) = std::fs::read_dir(classroom_root) {
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if fsutil::is_ignored_entry(&name) || !dates::is_canonical_bucket(&name) {
                continue;
            }
            if !entry.path().is_dir() {
                continue;
            }
            buckets.insert(name.clone(), collect_bucket(classroom_root, &entry.path()));
        }
    }

    let snapshot = SnapshotDescriptor {
        version: SNAPSHOT_VERSION,
        backend: backend.clone(),
        generated_at: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        dates: buckets,
    };
    (snapshot, archive_stats)
}

fn collect_bucket(classroom_root: &Path, date_dir: &Path) -> Vec<FileEntry> {
    let mut entries: Vec<FileEntry> = WalkDir::new(date_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|n| !fsutil::is_ignored_entry(n))
                .unwrap_or(false)
        })
        .filter_map(|e| e.ok())
        .filter(|e| fsutil::is_supported_nonempty_image(e.path()))
        .filter_map(|e| file_entry(classroom_root, e.path()))
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

fn file_entry(classroom_root: &Path, path: &Path) -> Option<FileEntry> {
    let rel = path.strip_prefix(classroom_root).ok()?;
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let meta = path.metadata().ok()?;
    let mtime = meta
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Some(FileEntry {
        path: rel,
        size: meta.len(),
        mtime,
    })
}

/// Load the persisted snapshot. Missing, unparseable, or version- or
/// backend-foreign files all mean "no previous snapshot".
pub fn load_persisted(
    state_dir: &Path,
    backend: &BackendDescriptor,
) -> Option<SnapshotDescriptor> {
    let path = state_dir.join(snapshot_file_name());
    let content = std::fs::read_to_string(&path).ok()?;
    let snapshot: SnapshotDescriptor = serde_json::from_str(&content).ok()?;
    if snapshot.version != SNAPSHOT_VERSION {
        tracing::warn!(version = snapshot.version, "snapshot version mismatch, ignoring");
        return None;
    }
    if &snapshot.backend != backend {
        tracing::info!(
            persisted = %snapshot.backend,
            current = %backend,
            "snapshot from a different backend, ignoring"
        );
        return None;
    }
    Some(snapshot)
}

/// Persist the snapshot atomically.
pub fn save_persisted(
    state_dir: &Path,
    snapshot: &SnapshotDescriptor,
) -> Result<(), crate::fsutil::FsError> {
    let path = state_dir.join(snapshot_file_name());
    let payload = serde_json::to_vec_pretty(snapshot).expect("snapshot serializes");
    fsutil::write_atomic(&path, &payload)
}

/// Diff two snapshots into the incremental plan.
///
/// Bucket equality uses the full entry set. With no previous snapshot,
/// every current bucket is changed.
pub fn diff(prev: Option<&SnapshotDescriptor>, curr: &SnapshotDescriptor) -> IncrementalPlan {
    let mut plan = IncrementalPlan::default();

    match prev {
        None => {
            plan.changed_dates = curr.dates.keys().cloned().collect();
        }
        Some(prev) => {
            for (date, entries) in &curr.dates {
                if prev.dates.get(date) != Some(entries) {
                    plan.changed_dates.insert(date.clone());
                }
            }
            for date in prev.dates.keys() {
                if !curr.dates.contains_key(date) {
                    plan.deleted_dates.insert(date.clone());
                }
            }
        }
    }

    plan
}
