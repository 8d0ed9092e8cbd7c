//! Output tree writer.
//!
//! Copies each classroom photo into every destination its labels earned
//! (per-person, per-unknown-cluster, unlabeled-unknown, no-face, error),
//! preserving content and modification time, and synchronizes deletions
//! when date buckets disappear from the input.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::fsutil;

pub const UNKNOWN_PHOTOS_DIR: &str = "unknown_photos";
pub const NO_FACE_PHOTOS_DIR: &str = "no_face_photos";
pub const ERROR_PHOTOS_DIR: &str = "error_photos";
/// Output state directory; never touched by deletion sync.
pub const STATE_DIR_NAME: &str = ".state";

/// One copy task: a source photo and its destination directory relative
/// to the output root (e.g. `Alice/2026-01-02`).
#[derive(Debug, Clone)]
pub struct CopyTask {
    pub source: PathBuf,
    pub dest_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct OrganizeStats {
    pub tasks: usize,
    pub copied: usize,
    /// Destination already existed with identical size.
    pub satisfied: usize,
    pub failed: usize,
    /// Copies per top-level destination (person name or special folder).
    pub per_destination: BTreeMap<String, usize>,
}

pub struct Organizer {
    output_root: PathBuf,
}

impl Organizer {
    pub fn new(output_root: &Path) -> Self {
        Self {
            output_root: output_root.to_path_buf(),
        }
    }

    /// Execute a batch of copy tasks.
    ///
    /// Idempotent: a destination that already holds a same-size file of
    /// the same name counts as satisfied. Content-distinct collisions
    /// get an ordinal suffix. A failed copy leaves no partial file.
    pub fn organize(&self, tasks: &[CopyTask]) -> OrganizeStats {
        let mut stats = OrganizeStats {
            tasks: tasks.len(),
            ..Default::default()
        };

        for task in tasks {
            let label = task
                .dest_dir
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.copy_one(task) {
                CopyOutcome::Copied => {
                    stats.copied += 1;
                    *stats.per_destination.entry(label).or_insert(0) += 1;
                }
                CopyOutcome::Satisfied => {
                    stats.satisfied += 1;
                    *stats.per_destination.entry(label).or_insert(0) += 1;
                }
                CopyOutcome::Failed => stats.failed += 1,
            }
        }

        tracing::info!(
            tasks = stats.tasks,
            copied = stats.copied,
            satisfied = stats.satisfied,
            failed = stats.failed,
            "output tree updated"
        );
        stats
    }

    fn copy_one(&self, task: &CopyTask) -> CopyOutcome {
        let Some(file_name) = task.source.file_name().and_then(|n| n.to_str()) else {
            return CopyOutcome::Failed;
        };
        let dest_dir = self.output_root.join(&task.dest_dir);
        if let Err(e) = std::fs::create_dir_all(&dest_dir) {
            tracing::warn!(dir = %dest_dir.display(), error = %e, "cannot create destination");
            return CopyOutcome::Failed;
        }

        let source_size = match task.source.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::warn!(photo = %task.source.display(), error = %e, "source vanished before copy");
                return CopyOutcome::Failed;
            }
        };

        let plain = dest_dir.join(file_name);
        if let Ok(existing) = plain.metadata() {
            if existing.len() == source_size {
                return CopyOutcome::Satisfied;
            }
        }

        let target = fsutil::unique_destination(&dest_dir, file_name);
        match std::fs::copy(&task.source, &target) {
            Ok(_) => {
                preserve_mtime(&task.source, &target);
                tracing::debug!(from = %task.source.display(), to = %target.display(), "copied");
                CopyOutcome::Copied
            }
            Err(e) => {
                tracing::warn!(
                    from = %task.source.display(),
                    to = %target.display(),
                    error = %e,
                    "copy failed"
                );
                // Never leave a partial destination behind.
                let _ = std::fs::remove_file(&target);
                CopyOutcome::Failed
            }
        }
    }

    /// Remove every per-date output directory for the given dates:
    /// `<person>/<date>`, `unknown_photos/<date>`,
    /// `unknown_photos/<cluster>/<date>`, `no_face_photos/<date>`, and
    /// `error_photos/<date>`. Person and cluster directories themselves
    /// survive (they may hold other dates).
    pub fn remove_date_dirs(&self, dates: &BTreeSet<String>) {
        if dates.is_empty() {
            return;
        }
        let Ok(entries) = std::fs::read_dir(&self.output_root) else {
            return;
        };

        for entry in entries.flatten() {
            let top = entry.path();
            let Some(name) = top.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == STATE_DIR_NAME || fsutil::is_ignored_entry(name) || !top.is_dir() {
                continue;
            }

            for date in dates {
                self.remove_guarded(&top.join(date));
            }

            if name == UNKNOWN_PHOTOS_DIR {
                let Ok(clusters) = std::fs::read_dir(&top) else {
                    continue;
                };
                for cluster in clusters.flatten() {
                    let cluster_path = cluster.path();
                    let Some(cluster_name) =
                        cluster_path.file_name().and_then(|n| n.to_str())
                    else {
                        continue;
                    };
                    if !cluster_path.is_dir() || fsutil::is_ignored_entry(cluster_name) {
                        continue;
                    }
                    for date in dates {
                        self.remove_guarded(&cluster_path.join(date));
                    }
                }
            }
        }
    }

    fn remove_guarded(&self, path: &Path) {
        if !path.is_dir() {
            return;
        }
        if let Err(e) = fsutil::ensure_resolved_under(&self.output_root, path) {
            tracing::warn!(path = %path.display(), error = %e, "refusing unsafe cleanup path");
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(path) {
            tracing::warn!(path = %path.display(), error = %e, "cleanup failed");
        }
    }
}

enum CopyOutcome {
    Copied,
    Satisfied,
    Failed,
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = source.metadata() else { return };
    let mtime = filetime::FileTime::from_last_modification_time(&meta);
    if let Err(e) = filetime::set_file_mtime(dest, mtime) {
        tracing::debug!(path = %dest.display(), error = %e, "could not preserve mtime");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(source: &Path, dest: &str) -> CopyTask {
        CopyTask {
            source: source.to_path_buf(),
            dest_dir: PathBuf::from(dest),
        }
    }

    fn write_source(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_copy_lands_in_destination() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let source = write_source(input.path(), "p1.jpg", b"jpeg");

        let organizer = Organizer::new(output.path());
        let stats = organizer.organize(&[task(&source, "Alice/2026-01-02")]);

        assert_eq!(stats.copied, 1);
        assert_eq!(stats.failed, 0);
        let dest = output.path().join("Alice/2026-01-02/p1.jpg");
        assert_eq!(std::fs::read(dest).unwrap(), b"jpeg");
        assert_eq!(stats.per_destination["Alice"], 1);
    }

    #[test]
    fn test_organize_is_idempotent() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let source = write_source(input.path(), "p1.jpg", b"jpeg");
        let tasks = vec![task(&source, "Alice/2026-01-02")];

        let organizer = Organizer::new(output.path());
        organizer.organize(&tasks);
        let again = organizer.organize(&tasks);

        assert_eq!(again.copied, 0);
        assert_eq!(again.satisfied, 1);
        let entries: Vec<_> = std::fs::read_dir(output.path().join("Alice/2026-01-02"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_content_distinct_collision_gets_suffix() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let a = write_source(input.path(), "a/p.jpg", b"short");
        let b = write_source(input.path(), "b/p.jpg", b"much longer content");

        let organizer = Organizer::new(output.path());
        organizer.organize(&[task(&a, "Alice/2026-01-02"), task(&b, "Alice/2026-01-02")]);

        assert!(output.path().join("Alice/2026-01-02/p.jpg").exists());
        assert!(output.path().join("Alice/2026-01-02/p_001.jpg").exists());
    }

    #[test]
    fn test_one_photo_many_destinations() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let source = write_source(input.path(), "p.jpg", b"jpeg");

        let organizer = Organizer::new(output.path());
        let stats = organizer.organize(&[
            task(&source, "Alice/2026-01-02"),
            task(&source, "Bob/2026-01-02"),
            task(&source, "unknown_photos/Unknown_Person_1/2026-01-02"),
        ]);

        assert_eq!(stats.copied, 3);
        assert!(output.path().join("Alice/2026-01-02/p.jpg").exists());
        assert!(output.path().join("Bob/2026-01-02/p.jpg").exists());
        assert!(output
            .path()
            .join("unknown_photos/Unknown_Person_1/2026-01-02/p.jpg")
            .exists());
    }

    #[test]
    fn test_copy_preserves_mtime() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let source = write_source(input.path(), "p.jpg", b"jpeg");
        filetime::set_file_mtime(&source, filetime::FileTime::from_unix_time(1_600_000_000, 0))
            .unwrap();

        Organizer::new(output.path()).organize(&[task(&source, "Alice/2026-01-02")]);

        let dest_meta = output
            .path()
            .join("Alice/2026-01-02/p.jpg")
            .metadata()
            .unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&dest_meta);
        assert_eq!(mtime.unix_seconds(), 1_600_000_000);
    }

    #[test]
    fn test_missing_source_is_failed_not_fatal() {
        let output = TempDir::new().unwrap();
        let organizer = Organizer::new(output.path());
        let stats = organizer.organize(&[task(Path::new("/nonexistent/p.jpg"), "Alice/2026-01-02")]);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.copied, 0);
    }

    #[test]
    fn test_remove_date_dirs_sweeps_all_categories() {
        let output = TempDir::new().unwrap();
        for dir in [
            "Alice/2026-01-09",
            "Alice/2026-01-02",
            "unknown_photos/2026-01-09",
            "unknown_photos/Unknown_Person_1/2026-01-09",
            "no_face_photos/2026-01-09",
            "error_photos/2026-01-09",
            ".state/recognition_cache_by_date",
        ] {
            std::fs::create_dir_all(output.path().join(dir)).unwrap();
        }

        let organizer = Organizer::new(output.path());
        let dates: BTreeSet<String> = ["2026-01-09".to_string()].into();
        organizer.remove_date_dirs(&dates);

        assert!(!output.path().join("Alice/2026-01-09").exists());
        assert!(!output.path().join("unknown_photos/2026-01-09").exists());
        assert!(!output
            .path()
            .join("unknown_photos/Unknown_Person_1/2026-01-09")
            .exists());
        assert!(!output.path().join("no_face_photos/2026-01-09").exists());
        assert!(!output.path().join("error_photos/2026-01-09").exists());
        // Other dates and the state dir survive; person dir survives.
        assert!(output.path().join("Alice/2026-01-02").exists());
        assert!(output.path().join("Alice").exists());
        assert!(output.path().join(".state").exists());
    }

    #[test]
    fn test_remove_date_dirs_refuses_symlink_escape() {
        let output = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        std::fs::write(elsewhere.path().join("keep.txt"), b"data").unwrap();

        std::fs::create_dir_all(output.path().join("Alice")).unwrap();
        std::os::unix::fs::symlink(elsewhere.path(), output.path().join("Alice/2026-01-09"))
            .unwrap();

        let organizer = Organizer::new(output.path());
        let dates: BTreeSet<String> = ["2026-01-09".to_string()].into();
        organizer.remove_date_dirs(&dates);

        assert!(elsewhere.path().join("keep.txt").exists());
    }
}
