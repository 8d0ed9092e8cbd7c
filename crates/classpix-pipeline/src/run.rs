//! The orchestrator: one batch run from pre-flight to report.
//!
//! Phases run strictly in order:
//! R0 pre-flight, R1 reference store, R2 input reconciliation,
//! R3 deletion sync, R4 recognition, R5 clustering, R6 organize,
//! R7 finalize. Per-item failures never abort a run; the only fatal
//! conditions are an unusable working directory, a dimensionality
//! invariant violation, and state-artifact I/O failure.

use chrono::Local;
use classpix_core::cluster::{self, Assignment, ClusterOutcome, ClusterParams};
use classpix_core::{Embedding, FaceBackend, RecognitionStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::{self, DateCache};
use crate::config::{ForceToggles, Settings};
use crate::driver::{self, BatchParams, WorkItem};
use crate::error::PipelineError;
use crate::fsutil;
use crate::organizer::{
    CopyTask, Organizer, ERROR_PHOTOS_DIR, NO_FACE_PHOTOS_DIR, UNKNOWN_PHOTOS_DIR,
};
use crate::refstore::ReferenceStore;
use crate::report::RunReport;
use crate::snapshot;

pub use crate::driver::CancelFlag;

/// What a finished run looked like, for callers that log or test.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub report_path: Option<PathBuf>,
    pub cancelled: bool,
    pub fell_back_to_serial: bool,
    pub total_photos: usize,
    pub success_photos: usize,
    pub no_face_photos: usize,
    pub error_photos: usize,
    pub cache_hits: usize,
}

pub struct Pipeline {
    settings: Settings,
    backend: Arc<dyn FaceBackend>,
    toggles: ForceToggles,
}

impl Pipeline {
    pub fn new(settings: Settings, backend: Arc<dyn FaceBackend>, toggles: ForceToggles) -> Self {
        Self {
            settings,
            backend,
            toggles,
        }
    }

    pub fn run(&self, cancel: CancelFlag) -> Result<RunSummary, PipelineError> {
        let started_at = Local::now();
        let clock = Instant::now();
        let descriptor = self.backend.descriptor().clone();

        // R0 — pre-flight.
        let classroom_root = self.settings.classroom_root();
        if !has_any_photo(&classroom_root) {
            return Err(PipelineError::MissingClassroomRoot(classroom_root));
        }
        let state_dir = self.settings.state_dir();
        for dir in [
            &self.settings.output_root,
            &state_dir,
            &self.settings.log_root,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| PipelineError::UnwritableWorkspace {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }
        tracing::info!(
            input = %self.settings.input_root.display(),
            output = %self.settings.output_root.display(),
            backend = %descriptor,
            "run starting"
        );

        // R1 — reference store.
        let store = ReferenceStore::new(
            &self.settings.reference_root(),
            &self.settings.log_root,
            descriptor.clone(),
            self.settings.max_refs_per_person,
        );
        let reference = store.load(self.backend.as_ref())?;
        if reference.refs.is_empty() {
            tracing::warn!(
                "no reference embeddings; every face will be routed to unknown clustering"
            );
        }
        let refs = Arc::new(reference.refs);

        // R2 — input reconciliation.
        let today = crate::dates::today_bucket();
        let (current, archive_stats) = snapshot::build(&classroom_root, &descriptor, &today);
        if archive_stats.moved > 0 {
            tracing::info!(
                moved = archive_stats.moved,
                renamed = archive_stats.renamed,
                failed = archive_stats.failed,
                "archived loose photos into date folders"
            );
        }
        let previous = snapshot::load_persisted(&state_dir, &descriptor);
        if previous.is_none() {
            tracing::info!("no previous snapshot, processing every date folder");
        }
        let mut plan = snapshot::diff(previous.as_ref(), &current);

        let params_fp = cache::compute_params_fingerprint(
            self.settings.tolerance,
            self.settings.min_face_size,
            &descriptor,
            &reference.fingerprint,
        );
        // A parameter change leaves the tree diff empty but still
        // invalidates every cache; widen the plan with stale dates.
        for date in current.dates.keys() {
            if plan.changed_dates.contains(date) {
                continue;
            }
            if cache::persisted_fingerprint(&state_dir, date).as_deref() != Some(params_fp.as_str())
            {
                plan.changed_dates.insert(date.clone());
            }
        }
        tracing::info!(
            changed = plan.changed_dates.len(),
            deleted = plan.deleted_dates.len(),
            dates = current.dates.len(),
            "incremental plan ready"
        );

        // R3 — deletion sync.
        let organizer = Organizer::new(&self.settings.output_root);
        if !plan.deleted_dates.is_empty() {
            tracing::info!(dates = ?plan.deleted_dates, "synchronizing deleted dates");
            organizer.remove_date_dirs(&plan.deleted_dates);
            for date in &plan.deleted_dates {
                cache::invalidate(&state_dir, date);
            }
        }

        // R4 — recognition.
        let mut caches: BTreeMap<String, DateCache> = BTreeMap::new();
        let mut cache_hits = 0usize;
        let mut fell_back = false;
        let mut invariant: Option<String> = None;

        for date in &plan.changed_dates {
            if cancel.load(Ordering::SeqCst) || invariant.is_some() {
                break;
            }
            let Some(entries) = current.dates.get(date) else {
                continue;
            };
            let mut date_cache = cache::load(&state_dir, date, &params_fp);

            let work: Vec<WorkItem> = entries
                .iter()
                .filter(|e| date_cache.lookup(&e.path, e.size, e.mtime).is_none())
                .map(|e| WorkItem {
                    date: date.clone(),
                    rel_path: e.path.clone(),
                    abs_path: classroom_root.join(&e.path),
                    size: e.size,
                    mtime: e.mtime,
                })
                .collect();
            cache_hits += entries.len() - work.len();

            if !work.is_empty() {
                tracing::info!(date = %date, photos = work.len(), "recognizing");
                let stream = driver::recognize_batch(
                    work,
                    Arc::clone(&self.backend),
                    Arc::clone(&refs),
                    BatchParams {
                        tolerance: self.settings.tolerance,
                        min_face_size: self.settings.min_face_size,
                    },
                    &self.settings.parallel,
                    self.toggles,
                    Arc::clone(&cancel),
                );
                fell_back |= stream.fell_back_to_serial();

                for (item, result) in stream {
                    match result {
                        Ok(result) => {
                            date_cache.store(&item.rel_path, item.size, item.mtime, result);
                        }
                        Err(e) => {
                            // Dimensionality violations are fatal, but the
                            // results already produced are still persisted.
                            invariant = Some(e.to_string());
                            cancel.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }

            let keep: BTreeSet<String> = entries.iter().map(|e| e.path.clone()).collect();
            date_cache.prune(&keep);
            cache::save_atomic(&state_dir, &date_cache).map_err(|e| PipelineError::StateIo {
                path: cache::cache_file_path(&state_dir, date),
                reason: e.to_string(),
            })?;
            caches.insert(date.clone(), date_cache);
        }

        if let Some(message) = invariant {
            return Err(PipelineError::InvariantViolation(message));
        }

        let cancelled = cancel.load(Ordering::SeqCst);
        if !cancelled {
            // Unchanged dates carry fresh caches by construction; pull
            // them in for clustering and organizing.
            for date in current.dates.keys() {
                if !caches.contains_key(date) {
                    caches.insert(date.clone(), cache::load(&state_dir, date, &params_fp));
                }
            }
        }

        // R5 — clustering.
        let clusters = if !cancelled && self.settings.cluster.enabled {
            let residuals = collect_residuals(&current, &caches);
            if residuals.is_empty() {
                None
            } else {
                tracing::info!(faces = residuals.len(), "clustering unknown faces");
                let outcome = cluster::cluster_residuals(
                    &residuals,
                    &ClusterParams {
                        threshold: self.settings.cluster.threshold,
                        min_cluster_size: self.settings.cluster.min_cluster_size,
                    },
                );
                tracing::info!(
                    clusters = outcome.labeled_cluster_count(),
                    "unknown faces grouped"
                );
                Some(outcome)
            }
        } else {
            None
        };

        // R6 — organize.
        let mut stats = Counters::default();
        if !cancelled {
            // Changed dates are rebuilt from scratch so label changes and
            // removed photos cannot leave stale copies behind.
            organizer.remove_date_dirs(&plan.changed_dates);

            let mut tasks: Vec<CopyTask> = Vec::new();
            for (date, entries) in &current.dates {
                let Some(date_cache) = caches.get(date) else {
                    continue;
                };
                for entry in entries {
                    stats.total += 1;
                    let Some(result) = date_cache.lookup(&entry.path, entry.size, entry.mtime)
                    else {
                        // Bucket changed under a cancelled or failed run;
                        // skip rather than guess.
                        continue;
                    };
                    stats.count(result.status);
                    if result.status == RecognitionStatus::Success {
                        for name in &result.matched {
                            *stats.per_person.entry(name.clone()).or_insert(0) += 1;
                        }
                    }
                    for dest in
                        destinations_for(result, date, &entry.path, clusters.as_ref())
                    {
                        tasks.push(CopyTask {
                            source: classroom_root.join(&entry.path),
                            dest_dir: dest,
                        });
                    }
                }
            }
            organizer.organize(&tasks);
        }

        // R7 — finalize.
        let (labeled, unlabeled) = cluster_stats(clusters.as_ref());
        let report = RunReport {
            started_at,
            duration: clock.elapsed(),
            total_photos: stats.total,
            success_photos: stats.success,
            no_face_photos: stats.no_face,
            error_photos: stats.error,
            cache_hits,
            per_person: stats.per_person.clone(),
            unknown_clusters: labeled,
            unlabeled_unknown_faces: unlabeled,
            tolerance: self.settings.tolerance,
            min_face_size: self.settings.min_face_size,
            backend: descriptor,
            fell_back_to_serial: fell_back,
            cancelled,
        };
        let report_path = match report.write(&self.settings.output_root) {
            Ok(path) => Some(path),
            Err(e) => {
                return Err(PipelineError::StateIo {
                    path: self.settings.output_root.join(report.file_name()),
                    reason: e.to_string(),
                })
            }
        };

        if cancelled {
            tracing::info!("cancelled before finalize; snapshot not persisted");
        } else if previous.as_ref().map(|p| p.dates == current.dates) == Some(true) {
            // Unchanged tree: leave the persisted snapshot untouched.
            tracing::debug!("snapshot unchanged, not rewritten");
        } else {
            snapshot::save_persisted(&state_dir, &current).map_err(|e| {
                PipelineError::StateIo {
                    path: state_dir.join(snapshot::snapshot_file_name()),
                    reason: e.to_string(),
                }
            })?;
        }

        tracing::info!(
            photos = stats.total,
            success = stats.success,
            no_face = stats.no_face,
            errors = stats.error,
            cache_hits,
            duration_secs = clock.elapsed().as_secs_f64(),
            "run finished"
        );

        Ok(RunSummary {
            report_path,
            cancelled,
            fell_back_to_serial: fell_back,
            total_photos: stats.total,
            success_photos: stats.success,
            no_face_photos: stats.no_face,
            error_photos: stats.error,
            cache_hits,
        })
    }
}

#[derive(Default)]
struct Counters {
    total: usize,
    success: usize,
    no_face: usize,
    error: usize,
    per_person: BTreeMap<String, usize>,
}

impl Counters {
    fn count(&mut self, status: RecognitionStatus) {
        match status {
            RecognitionStatus::Success => self.success += 1,
            RecognitionStatus::NoFace => self.no_face += 1,
            RecognitionStatus::Error => self.error += 1,
        }
    }
}

/// True iff the classroom root holds at least one usable photo anywhere.
fn has_any_photo(classroom_root: &Path) -> bool {
    if !classroom_root.is_dir() {
        return false;
    }
    walkdir::WalkDir::new(classroom_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|n| !fsutil::is_ignored_entry(n))
                .unwrap_or(false)
        })
        .filter_map(|e| e.ok())
        .any(|e| fsutil::is_supported_nonempty_image(e.path()))
}

/// Residual embeddings across every kept date, keyed for clustering.
fn collect_residuals(
    current: &snapshot::SnapshotDescriptor,
    caches: &BTreeMap<String, DateCache>,
) -> Vec<(cluster::ResidualKey, Embedding)> {
    let mut residuals = Vec::new();
    for (date, entries) in &current.dates {
        let Some(date_cache) = caches.get(date) else {
            continue;
        };
        for entry in entries {
            let Some(result) = date_cache.lookup(&entry.path, entry.size, entry.mtime) else {
                continue;
            };
            for residual in &result.residuals {
                residuals.push((
                    (entry.path.clone(), residual.face_index),
                    residual.embedding.clone(),
                ));
            }
        }
    }
    residuals
}

/// Destination directories (relative to the output root) for one photo.
///
/// Deduplicated: several residuals in the same photo landing in the same
/// cluster produce one copy, as do several unlabeled residuals.
fn destinations_for(
    result: &classpix_core::RecognitionResult,
    date: &str,
    rel_path: &str,
    clusters: Option<&ClusterOutcome>,
) -> BTreeSet<PathBuf> {
    let mut dests = BTreeSet::new();
    match result.status {
        RecognitionStatus::Error => {
            dests.insert(PathBuf::from(ERROR_PHOTOS_DIR).join(date));
        }
        RecognitionStatus::NoFace => {
            dests.insert(PathBuf::from(NO_FACE_PHOTOS_DIR).join(date));
        }
        RecognitionStatus::Success => {
            for name in &result.matched {
                dests.insert(PathBuf::from(name).join(date));
            }
            for residual in &result.residuals {
                let assignment = clusters.and_then(|c| {
                    c.assignments
                        .get(&(rel_path.to_string(), residual.face_index))
                });
                match assignment {
                    Some(Assignment::Labeled(label)) => {
                        dests.insert(PathBuf::from(UNKNOWN_PHOTOS_DIR).join(label).join(date));
                    }
                    Some(Assignment::Unlabeled) | None => {
                        dests.insert(PathBuf::from(UNKNOWN_PHOTOS_DIR).join(date));
                    }
                }
            }
        }
    }
    dests
}

fn cluster_stats(clusters: Option<&ClusterOutcome>) -> (Vec<(String, usize)>, usize) {
    let Some(outcome) = clusters else {
        return (Vec::new(), 0);
    };
    let labeled = outcome
        .clusters
        .iter()
        .filter_map(|c| c.label.clone().map(|l| (l, c.size)))
        .collect();
    let unlabeled = outcome
        .clusters
        .iter()
        .filter(|c| c.label.is_none())
        .map(|c| c.size)
        .sum();
    (labeled, unlabeled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use classpix_core::{ErrorKind, RecognitionResult, ResidualFace};

    fn success(matched: &[&str], residuals: &[usize]) -> RecognitionResult {
        RecognitionResult {
            status: RecognitionStatus::Success,
            matched: matched.iter().map(|s| s.to_string()).collect(),
            residuals: residuals
                .iter()
                .map(|&face_index| ResidualFace {
                    face_index,
                    embedding: Embedding::new(vec![0.0, 0.0]),
                })
                .collect(),
            total_faces: matched.len() + residuals.len(),
            error_kind: None,
        }
    }

    #[test]
    fn test_destinations_error_and_no_face() {
        let error = RecognitionResult::error(ErrorKind::UnreadableImage);
        let dests = destinations_for(&error, "2026-01-02", "2026-01-02/p.jpg", None);
        assert_eq!(
            dests.into_iter().collect::<Vec<_>>(),
            vec![PathBuf::from("error_photos/2026-01-02")]
        );

        let no_face = RecognitionResult::no_face();
        let dests = destinations_for(&no_face, "2026-01-02", "2026-01-02/p.jpg", None);
        assert_eq!(
            dests.into_iter().collect::<Vec<_>>(),
            vec![PathBuf::from("no_face_photos/2026-01-02")]
        );
    }

    #[test]
    fn test_destinations_matched_persons() {
        let result = success(&["Alice", "Bob"], &[]);
        let dests = destinations_for(&result, "2026-01-02", "2026-01-02/p.jpg", None);
        assert!(dests.contains(&PathBuf::from("Alice/2026-01-02")));
        assert!(dests.contains(&PathBuf::from("Bob/2026-01-02")));
        assert_eq!(dests.len(), 2);
    }

    #[test]
    fn test_destinations_residuals_follow_cluster_assignment() {
        let result = success(&["Alice"], &[0, 1, 2]);
        let residuals: Vec<(cluster::ResidualKey, Embedding)> = vec![
            (
                ("2026-01-02/p.jpg".to_string(), 0),
                Embedding::new(vec![0.0, 0.0]),
            ),
            (
                ("2026-01-02/p.jpg".to_string(), 1),
                Embedding::new(vec![0.01, 0.0]),
            ),
            (
                ("2026-01-02/p.jpg".to_string(), 2),
                Embedding::new(vec![9.0, 9.0]),
            ),
        ];
        let outcome = cluster::cluster_residuals(
            &residuals,
            &ClusterParams {
                threshold: 0.45,
                min_cluster_size: 2,
            },
        );

        let dests =
            destinations_for(&result, "2026-01-02", "2026-01-02/p.jpg", Some(&outcome));
        assert!(dests.contains(&PathBuf::from("Alice/2026-01-02")));
        assert!(dests.contains(&PathBuf::from("unknown_photos/Unknown_Person_1/2026-01-02")));
        // The lone far-away residual is unlabeled.
        assert!(dests.contains(&PathBuf::from("unknown_photos/2026-01-02")));
        assert_eq!(dests.len(), 3);
    }

    #[test]
    fn test_destinations_unlabeled_residuals_deduplicate() {
        // Two unlabeled residuals, one copy into unknown_photos/<date>.
        let result = success(&[], &[0, 1]);
        let dests = destinations_for(&result, "2026-01-02", "2026-01-02/p.jpg", None);
        assert_eq!(
            dests.into_iter().collect::<Vec<_>>(),
            vec![PathBuf::from("unknown_photos/2026-01-02")]
        );
    }
}
