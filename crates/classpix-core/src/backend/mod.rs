//! Face backend adapters.
//!
//! A backend turns a pixel buffer into zero or more (bounding box,
//! embedding) pairs. Each run is pinned to exactly one backend; its
//! descriptor is stamped into every persisted artifact so embeddings
//! from different spaces never mix.

#[cfg(feature = "onnx")]
mod insight;

#[cfg(feature = "onnx")]
pub use insight::InsightBackend;

use crate::imageio::PixelBuffer;
use crate::types::{BackendDescriptor, DetectedFace, Engine};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("model file not found: {0} — download the buffalo_l models and place them in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("backend '{0}' is not available in this build")]
    Unavailable(Engine),
    #[cfg(feature = "onnx")]
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection + embedding for one photo at a time.
///
/// Implementations must be shareable across worker threads; per-photo
/// calls are pure with respect to the loaded model.
pub trait FaceBackend: Send + Sync + std::fmt::Debug {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Detect faces and embed each one.
    ///
    /// Faces whose longer bounding-box side is under `min_face_size`
    /// pixels are dropped. An empty result is valid (no usable face);
    /// errors are per-photo and never fatal to a batch.
    fn detect_and_encode(
        &self,
        image: &PixelBuffer,
        min_face_size: u32,
    ) -> Result<Vec<DetectedFace>, BackendError>;
}

/// Construct the backend for the configured engine.
///
/// `model_dir` holds the ONNX model files for engines that need them.
#[allow(unused_variables)]
pub fn create_backend(
    engine: Engine,
    model_dir: &Path,
) -> Result<Box<dyn FaceBackend>, BackendError> {
    match engine {
        #[cfg(feature = "onnx")]
        Engine::Insightface => Ok(Box::new(InsightBackend::load(model_dir)?)),
        #[cfg(not(feature = "onnx"))]
        Engine::Insightface => Err(BackendError::Unavailable(engine)),
        Engine::Dlib => Err(BackendError::Unavailable(engine)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlib_not_available() {
        let err = create_backend(Engine::Dlib, Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(Engine::Dlib)));
    }

    #[cfg(feature = "onnx")]
    #[test]
    fn test_insightface_missing_models() {
        let err = create_backend(Engine::Insightface, Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(err, BackendError::ModelNotFound(_)));
    }
}
