//! Per-run summary report.
//!
//! One plain-text artifact per run, timestamp-prefixed so repeated runs
//! never overwrite each other. The report and the exit code are the
//! pipeline's only authoritative outputs.

use chrono::{DateTime, Local};
use classpix_core::BackendDescriptor;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fsutil;

#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Local>,
    pub duration: Duration,
    pub total_photos: usize,
    pub success_photos: usize,
    pub no_face_photos: usize,
    pub error_photos: usize,
    pub cache_hits: usize,
    /// Photos each person was matched in.
    pub per_person: BTreeMap<String, usize>,
    /// Labeled unknown clusters and their sizes.
    pub unknown_clusters: Vec<(String, usize)>,
    pub unlabeled_unknown_faces: usize,
    pub tolerance: f32,
    pub min_face_size: u32,
    pub backend: BackendDescriptor,
    pub fell_back_to_serial: bool,
    pub cancelled: bool,
}

impl RunReport {
    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "classpix run report");
        let _ = writeln!(out, "===================");
        let _ = writeln!(out, "Run started:  {}", self.started_at.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(out, "Duration:     {:.2}s", self.duration.as_secs_f64());
        if self.cancelled {
            let _ = writeln!(out, "NOTE: run was cancelled; results below are partial.");
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "Photos:");
        let _ = writeln!(out, "  total:      {}", self.total_photos);
        let _ = writeln!(out, "  success:    {}", self.success_photos);
        let _ = writeln!(out, "  no face:    {}", self.no_face_photos);
        let _ = writeln!(out, "  error:      {}", self.error_photos);
        let _ = writeln!(out, "  cache hits: {}", self.cache_hits);
        let _ = writeln!(out);

        let _ = writeln!(out, "Matches per person:");
        if self.per_person.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for (person, count) in &self.per_person {
            let _ = writeln!(out, "  {person}: {count}");
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "Unknown faces:");
        let _ = writeln!(out, "  labeled clusters: {}", self.unknown_clusters.len());
        for (label, size) in &self.unknown_clusters {
            let _ = writeln!(out, "    {label}: {size} faces");
        }
        let _ = writeln!(out, "  unlabeled faces:  {}", self.unlabeled_unknown_faces);
        let _ = writeln!(out);

        let _ = writeln!(out, "Parameters:");
        let _ = writeln!(out, "  tolerance:     {}", self.tolerance);
        let _ = writeln!(out, "  min face size: {}px", self.min_face_size);
        let _ = writeln!(out, "  backend:       {}", self.backend);
        let _ = writeln!(
            out,
            "  serial fallback: {}",
            if self.fell_back_to_serial { "yes" } else { "no" }
        );
        out
    }

    /// File name: `<YYYYMMDD>_<HHMMSS>_report.txt`.
    pub fn file_name(&self) -> String {
        format!("{}_report.txt", self.started_at.format("%Y%m%d_%H%M%S"))
    }

    /// Write the report under the output root.
    pub fn write(&self, output_root: &Path) -> Result<PathBuf, fsutil::FsError> {
        let path = output_root.join(self.file_name());
        fsutil::write_atomic(&path, self.render().as_bytes())?;
        tracing::info!(path = %path.display(), "run report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use classpix_core::Engine;
    use tempfile::TempDir;

    fn sample() -> RunReport {
        RunReport {
            started_at: Local.with_ymd_and_hms(2026, 1, 2, 9, 30, 5).unwrap(),
            duration: Duration::from_secs_f64(12.5),
            total_photos: 10,
            success_photos: 7,
            no_face_photos: 2,
            error_photos: 1,
            cache_hits: 4,
            per_person: [("Alice".to_string(), 5), ("Bob".to_string(), 3)].into(),
            unknown_clusters: vec![("Unknown_Person_1".to_string(), 3)],
            unlabeled_unknown_faces: 2,
            tolerance: 0.6,
            min_face_size: 50,
            backend: BackendDescriptor::for_engine(Engine::Insightface),
            fell_back_to_serial: false,
            cancelled: false,
        }
    }

    #[test]
    fn test_file_name_is_timestamp_prefixed() {
        assert_eq!(sample().file_name(), "20260102_093005_report.txt");
    }

    #[test]
    fn test_render_contains_counters_and_params() {
        let text = sample().render();
        assert!(text.contains("success:    7"));
        assert!(text.contains("no face:    2"));
        assert!(text.contains("error:      1"));
        assert!(text.contains("Alice: 5"));
        assert!(text.contains("Unknown_Person_1: 3 faces"));
        assert!(text.contains("tolerance:     0.6"));
        assert!(text.contains("insightface/buffalo_l"));
        assert!(text.contains("serial fallback: no"));
        assert!(!text.contains("cancelled"));
    }

    #[test]
    fn test_cancelled_note() {
        let mut report = sample();
        report.cancelled = true;
        assert!(report.render().contains("run was cancelled"));
    }

    #[test]
    fn test_write_to_output_root() {
        let output = TempDir::new().unwrap();
        let report = sample();
        let path = report.write(output.path()).unwrap();
        assert!(path.ends_with("20260102_093005_report.txt"));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("classpix run report"));
    }
}
