//! classpix-pipeline — the batch organizing pipeline.
//!
//! Owns everything between "two input directories" and "an organized
//! output tree": the reference-embedding store, the incremental snapshot
//! of the classroom tree, per-date recognition caches, the parallel
//! recognition driver, unknown-face clustering, the output writer, and
//! the orchestrator that sequences them.

pub mod cache;
pub mod config;
pub mod dates;
pub mod driver;
pub mod error;
pub mod fsutil;
pub mod organizer;
pub mod refstore;
pub mod report;
pub mod run;
pub mod snapshot;

pub use config::Settings;
pub use error::PipelineError;
pub use run::{CancelFlag, Pipeline, RunSummary};
