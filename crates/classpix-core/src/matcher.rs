//! Matching detected faces against the reference set.
//!
//! Nearest-reference Euclidean matching with a tolerance cutoff. A face
//! matches at most one person, but one person may match several faces in
//! the same photo — dense group shots produce duplicate hits on purpose,
//! and no uniqueness constraint is applied.

use crate::types::{
    DetectedFace, Embedding, RecognitionResult, RecognitionStatus, ResidualFace,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("embedding dimensionality mismatch: reference set is {expected}-d, got {got}-d")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Read-only reference embeddings as parallel arrays.
///
/// Names repeat: one entry per reference embedding, not per person. The
/// set enforces a single dimensionality at insert time, which is what
/// makes cross-dimension comparisons impossible later.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    names: Vec<String>,
    embeddings: Vec<Embedding>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference embedding for `name`.
    ///
    /// The first insert fixes the set's dimensionality; later inserts of a
    /// different width are rejected.
    pub fn push(&mut self, name: &str, embedding: Embedding) -> Result<(), MatchError> {
        if let Some(expected) = self.dim() {
            if embedding.dim() != expected {
                return Err(MatchError::DimensionMismatch {
                    expected,
                    got: embedding.dim(),
                });
            }
        }
        self.names.push(name.to_string());
        self.embeddings.push(embedding);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Dimensionality of the set, or `None` while empty.
    pub fn dim(&self) -> Option<usize> {
        self.embeddings.first().map(|e| e.dim())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Label every detected face in one photo.
///
/// Scans the full reference set per face (argmin over all entries) and
/// accepts the nearest reference iff its distance is within `tolerance`.
/// Everything else becomes a residual carrying its embedding and
/// detection index.
pub fn match_faces(
    faces: &[DetectedFace],
    refs: &ReferenceSet,
    tolerance: f32,
) -> Result<RecognitionResult, MatchError> {
    if faces.is_empty() {
        return Ok(RecognitionResult::no_face());
    }

    let mut matched: Vec<String> = Vec::new();
    let mut residuals: Vec<ResidualFace> = Vec::new();

    for (face_index, face) in faces.iter().enumerate() {
        if refs.is_empty() {
            residuals.push(ResidualFace {
                face_index,
                embedding: face.embedding.clone(),
            });
            continue;
        }

        let expected = refs.dim().unwrap_or(0);
        if face.embedding.dim() != expected {
            return Err(MatchError::DimensionMismatch {
                expected,
                got: face.embedding.dim(),
            });
        }

        let mut best_idx = 0usize;
        let mut best_dist = f32::INFINITY;
        for (i, reference) in refs.embeddings.iter().enumerate() {
            let d = face.embedding.euclidean_distance(reference);
            if d < best_dist {
                best_dist = d;
                best_idx = i;
            }
        }

        if best_dist <= tolerance {
            let name = &refs.names[best_idx];
            if !matched.iter().any(|n| n == name) {
                matched.push(name.clone());
            }
        } else {
            residuals.push(ResidualFace {
                face_index,
                embedding: face.embedding.clone(),
            });
        }
    }

    Ok(RecognitionResult {
        status: RecognitionStatus::Success,
        matched,
        residuals,
        total_faces: faces.len(),
        error_kind: None,
    })
}
