//! Run configuration.
//!
//! One value-type holds every knob the pipeline consumes, built once at
//! startup and passed by reference. Values come from `config.toml` in
//! the working directory (all keys optional) plus `CLASSPIX_*`
//! environment toggles.

use classpix_core::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Directory under `input_root` holding per-person reference photos.
pub const REFERENCE_PHOTOS_DIR: &str = "student_photos";
/// Directory under `input_root` holding the group photos to organize.
pub const CLASS_PHOTOS_DIR: &str = "class_photos";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Root containing `student_photos/` and `class_photos/`.
    pub input_root: PathBuf,
    /// Root for the output tree and its `.state/` directory.
    pub output_root: PathBuf,
    /// Root for the reference-embedding cache and log files.
    pub log_root: PathBuf,
    /// Matcher distance threshold.
    pub tolerance: f32,
    /// Minimum face bounding-box side, in pixels.
    pub min_face_size: u32,
    pub backend: BackendSettings,
    pub parallel: ParallelSettings,
    pub cluster: ClusterSettings,
    /// Reference images used per person (newest first).
    pub max_refs_per_person: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSettings {
    pub engine: Engine,
    /// Directory holding the engine's model files.
    pub model_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParallelSettings {
    /// Master allow for the parallel recognition phase.
    pub enabled: bool,
    /// Upper bound on worker threads (clamped to the CPU count).
    pub workers: usize,
    /// Work items handed to a worker per dispatch.
    pub chunk_size: usize,
    /// Batch size at which parallel mode engages automatically.
    pub min_photos: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSettings {
    pub enabled: bool,
    /// Cluster distance threshold; must stay stricter than `tolerance`.
    pub threshold: f32,
    /// Smallest cluster that earns an `Unknown_Person_K` folder.
    pub min_cluster_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("input"),
            output_root: PathBuf::from("output"),
            log_root: PathBuf::from("logs"),
            tolerance: 0.6,
            min_face_size: 50,
            backend: BackendSettings::default(),
            parallel: ParallelSettings::default(),
            cluster: ClusterSettings::default(),
            max_refs_per_person: 5,
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            engine: Engine::Insightface,
            model_dir: PathBuf::from("models"),
        }
    }
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 6,
            chunk_size: 12,
            min_photos: 30,
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.45,
            min_cluster_size: 2,
        }
    }
}

/// Advisory force toggles, read from the environment.
///
/// `CLASSPIX_FORCE_SERIAL=1` pins recognition to the calling thread;
/// `CLASSPIX_FORCE_PARALLEL=1` engages the pool below the photo-count
/// threshold (workers permitting); `CLASSPIX_MIN_PHOTOS_OVERRIDE=<n>`
/// substitutes the automatic threshold for one run. Serial wins if
/// both force flags are set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceToggles {
    pub force_serial: bool,
    pub force_parallel: bool,
    pub min_photos_override: Option<usize>,
}

impl ForceToggles {
    pub fn from_env() -> Self {
        Self {
            force_serial: truthy_env("CLASSPIX_FORCE_SERIAL"),
            force_parallel: truthy_env("CLASSPIX_FORCE_PARALLEL"),
            min_photos_override: std::env::var("CLASSPIX_MIN_PHOTOS_OVERRIDE")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
        }
    }
}

fn truthy_env(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl Settings {
    /// Load settings from a TOML file. Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let settings = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                PipelineError::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            let parsed: Settings = toml::from_str(&content).map_err(|e| {
                PipelineError::Config(format!("cannot parse {}: {e}", path.display()))
            })?;
            tracing::info!(path = %path.display(), "loaded configuration");
            parsed
        } else {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Settings::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(self.tolerance > 0.0) {
            return Err(PipelineError::Config(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.cluster.enabled && self.cluster.threshold >= self.tolerance {
            return Err(PipelineError::Config(format!(
                "cluster.threshold ({}) must be stricter than tolerance ({})",
                self.cluster.threshold, self.tolerance
            )));
        }
        if self.max_refs_per_person == 0 {
            return Err(PipelineError::Config(
                "max_refs_per_person must be at least 1".to_string(),
            ));
        }
        if self.parallel.chunk_size == 0 {
            return Err(PipelineError::Config(
                "parallel.chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve roots against a working directory.
    pub fn anchored_at(mut self, working_dir: &Path) -> Self {
        for root in [&mut self.input_root, &mut self.output_root, &mut self.log_root] {
            if root.is_relative() {
                *root = working_dir.join(&*root);
            }
        }
        if self.backend.model_dir.is_relative() {
            self.backend.model_dir = working_dir.join(&self.backend.model_dir);
        }
        self
    }

    pub fn reference_root(&self) -> PathBuf {
        self.input_root.join(REFERENCE_PHOTOS_DIR)
    }

    pub fn classroom_root(&self) -> PathBuf {
        self.input_root.join(CLASS_PHOTOS_DIR)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.output_root.join(".state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.input_root, PathBuf::from("input"));
        assert_eq!(s.tolerance, 0.6);
        assert_eq!(s.min_face_size, 50);
        assert_eq!(s.backend.engine, Engine::Insightface);
        assert!(s.parallel.enabled);
        assert_eq!(s.parallel.workers, 6);
        assert_eq!(s.parallel.chunk_size, 12);
        assert_eq!(s.parallel.min_photos, 30);
        assert!(s.cluster.enabled);
        assert_eq!(s.cluster.threshold, 0.45);
        assert_eq!(s.cluster.min_cluster_size, 2);
        assert_eq!(s.max_refs_per_person, 5);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let s: Settings = toml::from_str(
            r#"
            tolerance = 0.55

            [backend]
            engine = "dlib"

            [parallel]
            workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(s.tolerance, 0.55);
        assert_eq!(s.backend.engine, Engine::Dlib);
        assert_eq!(s.parallel.workers, 2);
        // Untouched sections keep defaults.
        assert_eq!(s.parallel.chunk_size, 12);
        assert_eq!(s.cluster.threshold, 0.45);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = toml::from_str::<Settings>("tollerance = 0.5").unwrap_err();
        assert!(err.to_string().contains("tollerance"));
    }

    #[test]
    fn test_validate_cluster_threshold_not_stricter() {
        let mut s = Settings::default();
        s.cluster.threshold = 0.7;
        assert!(s.validate().is_err());

        // Disabled clustering is exempt from the rule.
        s.cluster.enabled = false;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_anchored_at_leaves_absolute_paths() {
        let mut s = Settings::default();
        s.output_root = PathBuf::from("/abs/output");
        let anchored = s.anchored_at(Path::new("/work"));
        assert_eq!(anchored.input_root, PathBuf::from("/work/input"));
        assert_eq!(anchored.output_root, PathBuf::from("/abs/output"));
        assert_eq!(anchored.state_dir(), PathBuf::from("/abs/output/.state"));
    }

    #[test]
    fn test_layout_helpers() {
        let s = Settings::default();
        assert_eq!(s.reference_root(), PathBuf::from("input/student_photos"));
        assert_eq!(s.classroom_root(), PathBuf::from("input/class_photos"));
    }
}
