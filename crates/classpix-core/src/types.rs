use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Face embedding backends known to classpix.
///
/// Every run is pinned to one engine; persisted artifacts carry the full
/// [`BackendDescriptor`] so caches produced by one engine are never read
/// by another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// SCRFD detection + ArcFace embedding (buffalo_l), via ONNX Runtime.
    Insightface,
    /// dlib ResNet embeddings, for installs migrated from the legacy stack.
    Dlib,
}

impl Engine {
    /// The model identifier this engine embeds with. Paired with the engine
    /// name it forms the backend descriptor stamped into every artifact.
    pub fn model_name(self) -> &'static str {
        match self {
            Engine::Insightface => "buffalo_l",
            Engine::Dlib => "face_recognition",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Insightface => "insightface",
            Engine::Dlib => "dlib",
        }
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insightface" => Ok(Engine::Insightface),
            "dlib" => Ok(Engine::Dlib),
            other => Err(format!("unknown face backend engine: {other}")),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(engine, model)` pair pinning the embedding space of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub engine: Engine,
    pub model: String,
}

impl BackendDescriptor {
    pub fn for_engine(engine: Engine) -> Self {
        Self {
            engine,
            model: engine.model_name().to_string(),
        }
    }
}

impl fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.engine, self.model)
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Longer side of the box, in pixels. Faces below the configured
    /// minimum are dropped before embedding.
    pub fn longer_side(&self) -> f32 {
        self.width.max(self.height)
    }
}

/// Face embedding vector. Dimensionality is fixed by the backend for a
/// run (128 for dlib, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must guarantee matching dimensionality; comparing across
    /// embedding spaces is an invariant violation upstream.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face found in a photo: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Outcome category for one photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionStatus {
    /// At least one usable face was detected (matched or not).
    Success,
    /// The backend found no face of usable size.
    NoFace,
    /// Decode or inference failed for this photo.
    Error,
}

/// Short machine-readable cause attached to `RecognitionStatus::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnreadableImage,
    Backend,
    Timeout,
    Worker,
}

/// A residual embedding: a detected face that matched nobody.
///
/// `face_index` is the position within the photo's detection order and is
/// stable for the run; clustering keys on `(photo, face_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualFace {
    pub face_index: usize,
    pub embedding: Embedding,
}

/// Recognition outcome for one classroom photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub status: RecognitionStatus,
    /// Names matched in this photo, deduplicated, in detection order.
    pub matched: Vec<String>,
    /// Faces that matched no known person.
    pub residuals: Vec<ResidualFace>,
    pub total_faces: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl RecognitionResult {
    pub fn no_face() -> Self {
        Self {
            status: RecognitionStatus::NoFace,
            matched: Vec::new(),
            residuals: Vec::new(),
            total_faces: 0,
            error_kind: None,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: RecognitionStatus::Error,
            matched: Vec::new(),
            residuals: Vec::new(),
            total_faces: 0,
            error_kind: Some(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        let b = Embedding::new(vec![1.0, 2.0, 3.0]);
        assert!(a.euclidean_distance(&b).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_unit_axes() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!((a.euclidean_distance(&b) - std::f32::consts::SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_engine_round_trip() {
        for engine in [Engine::Insightface, Engine::Dlib] {
            let parsed: Engine = engine.as_str().parse().unwrap();
            assert_eq!(parsed, engine);
        }
        assert!("openface".parse::<Engine>().is_err());
    }

    #[test]
    fn test_descriptor_display() {
        let d = BackendDescriptor::for_engine(Engine::Insightface);
        assert_eq!(d.to_string(), "insightface/buffalo_l");
    }

    #[test]
    fn test_longer_side() {
        let bbox = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 30.0,
            height: 80.0,
            confidence: 0.9,
            landmarks: None,
        };
        assert_eq!(bbox.longer_side(), 80.0);
    }

    #[test]
    fn test_status_serde_tags() {
        let json = serde_json::to_string(&RecognitionStatus::NoFace).unwrap();
        assert_eq!(json, "\"no_face\"");
        let kind = serde_json::to_string(&ErrorKind::UnreadableImage).unwrap();
        assert_eq!(kind, "\"unreadable_image\"");
    }
}
