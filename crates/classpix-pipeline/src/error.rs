//! Run-level error taxonomy and process exit codes.
//!
//! Per-photo failures are values inside `RecognitionResult` and never
//! reach this type. `PipelineError` covers only the conditions that end
//! a run.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a successful run (including partial-failure success).
pub const EXIT_OK: i32 = 0;
/// Exit code for any other unrecoverable error.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code when the classroom-photo root is missing or empty.
pub const EXIT_NO_CLASSROOM_PHOTOS: i32 = 2;
/// Exit code when the working directory cannot be created or written.
pub const EXIT_UNWRITABLE_WORKSPACE: i32 = 3;
/// Exit code for a state-level invariant violation.
pub const EXIT_INVARIANT_VIOLATION: i32 = 4;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("classroom photo folder is missing or empty: {0}")]
    MissingClassroomRoot(PathBuf),

    #[error("working directory is not writable: {path}: {reason}")]
    UnwritableWorkspace { path: PathBuf, reason: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("face backend unavailable: {0}")]
    Backend(#[from] classpix_core::BackendError),

    #[error("state artifact I/O failed: {path}: {reason}")]
    StateIo { path: PathBuf, reason: String },
}

impl PipelineError {
    /// Map to the process exit code contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::MissingClassroomRoot(_) => EXIT_NO_CLASSROOM_PHOTOS,
            PipelineError::UnwritableWorkspace { .. } => EXIT_UNWRITABLE_WORKSPACE,
            PipelineError::InvariantViolation(_) => EXIT_INVARIANT_VIOLATION,
            PipelineError::Config(_)
            | PipelineError::Backend(_)
            | PipelineError::StateIo { .. } => EXIT_FAILURE,
        }
    }

    /// One-line hint shown to the user next to the diagnostic.
    pub fn hint(&self) -> &'static str {
        match self {
            PipelineError::MissingClassroomRoot(_) => {
                "put your group photos under input/class_photos (date folders like 2026-01-02 work best)"
            }
            PipelineError::UnwritableWorkspace { .. } => {
                "check permissions on the working directory, or point --working-dir somewhere writable"
            }
            PipelineError::InvariantViolation(_) => {
                "delete the output .state directory and the reference cache, then rerun"
            }
            PipelineError::Config(_) => "fix config.toml (see the key listed above)",
            PipelineError::Backend(_) => {
                "check that the configured backend's model files are installed"
            }
            PipelineError::StateIo { .. } => "check free disk space and filesystem health",
        }
    }
}
