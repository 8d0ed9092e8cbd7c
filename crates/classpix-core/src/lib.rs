//! classpix-core — face matching and clustering engine.
//!
//! Decodes photos into pixel buffers, hands them to a pluggable face
//! backend (SCRFD detection + ArcFace embedding via ONNX Runtime in the
//! default build), matches the resulting embeddings against a reference
//! set, and clusters the faces nobody recognized.

pub mod alignment;
pub mod backend;
pub mod cluster;
pub mod imageio;
pub mod matcher;
pub mod types;

pub use backend::{BackendError, FaceBackend};
pub use imageio::{ImageIoError, PixelBuffer};
pub use matcher::{MatchError, ReferenceSet};
pub use types::{
    BackendDescriptor, BoundingBox, DetectedFace, Embedding, Engine, ErrorKind,
    RecognitionResult, RecognitionStatus, ResidualFace,
};
