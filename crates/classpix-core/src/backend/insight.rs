//! InsightFace backend: SCRFD detection + ArcFace embedding via ONNX Runtime.
//!
//! Uses the buffalo_l model pack (det_10g for detection, w600k_r50 for
//! 512-dimensional embeddings), both running on CPU.

use super::{BackendError, FaceBackend};
use crate::alignment;
use crate::imageio::PixelBuffer;
use crate::types::{BackendDescriptor, BoundingBox, DetectedFace, Embedding, Engine};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

// --- SCRFD (det_10g) constants ---
const DET_INPUT_SIZE: usize = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_SCORE_THRESHOLD: f32 = 0.5;
const DET_NMS_IOU: f32 = 0.4;
const DET_STRIDES: [usize; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;

// --- ArcFace (w600k_r50) constants ---
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0 — ArcFace uses symmetric normalization
const ARCFACE_EMBEDDING_DIM: usize = 512;

const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
const EMBEDDER_MODEL_FILE: &str = "w600k_r50.onnx";

/// SCRFD + ArcFace face backend.
pub struct InsightBackend {
    descriptor: BackendDescriptor,
    // Session::run needs exclusive access; workers share the backend and
    // serialize on these.
    detector: Mutex<Session>,
    embedder: Mutex<Session>,
}

impl std::fmt::Debug for InsightBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsightBackend")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl InsightBackend {
    /// Load both ONNX models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, BackendError> {
        let detector_path = model_dir.join(DETECTOR_MODEL_FILE);
        let embedder_path = model_dir.join(EMBEDDER_MODEL_FILE);
        for path in [&detector_path, &embedder_path] {
            if !path.exists() {
                return Err(BackendError::ModelNotFound(path.display().to_string()));
            }
        }

        let detector = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::<()>::from)?
            .commit_from_file(&detector_path)?;
        let embedder = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::<()>::from)?
            .commit_from_file(&embedder_path)?;

        tracing::info!(
            dir = %model_dir.display(),
            detector = DETECTOR_MODEL_FILE,
            embedder = EMBEDDER_MODEL_FILE,
            "loaded insightface models"
        );

        Ok(Self {
            descriptor: BackendDescriptor::for_engine(Engine::Insightface),
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
        })
    }

    /// Resize into the 640×640 detector input with letterboxing.
    ///
    /// Returns the NCHW tensor and the scale factor for mapping detector
    /// coordinates back to the source image.
    fn preprocess_detect(image: &PixelBuffer) -> (Array4<f32>, f32) {
        let size = DET_INPUT_SIZE;
        let scale = (size as f32 / image.width as f32).min(size as f32 / image.height as f32);
        let new_w = ((image.width as f32 * scale) as usize).max(1);
        let new_h = ((image.height as f32 * scale) as usize).max(1);

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..new_h {
            for x in 0..new_w {
                let sx = ((x as f32 / scale) as u32).min(image.width - 1);
                let sy = ((y as f32 / scale) as u32).min(image.height - 1);
                let px = image.pixel(sx, sy);
                for c in 0..3 {
                    tensor[[0, c, y, x]] = (px[c] as f32 - DET_MEAN) / DET_STD;
                }
            }
        }
        (tensor, scale)
    }

    /// Run SCRFD and decode its per-stride outputs into bounding boxes
    /// with landmarks, in source-image coordinates.
    fn detect(&self, image: &PixelBuffer) -> Result<Vec<BoundingBox>, BackendError> {
        let (input, scale) = Self::preprocess_detect(image);

        let mut session = self
            .detector
            .lock()
            .map_err(|_| BackendError::InferenceFailed("detector lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // det_10g output order: scores per stride, then boxes, then keypoints.
        let mut candidates: Vec<BoundingBox> = Vec::new();
        for (idx, stride) in DET_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[3 + idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[6 + idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            decode_stride(scores, boxes, kps, *stride, scale, &mut candidates);
        }

        Ok(non_max_suppression(candidates, DET_NMS_IOU))
    }

    /// Extract an embedding from one detected face.
    fn embed(&self, image: &PixelBuffer, face: &BoundingBox) -> Result<Embedding, BackendError> {
        let landmarks = face.landmarks.as_ref().ok_or_else(|| {
            BackendError::InferenceFailed("detector returned a face without landmarks".into())
        })?;

        let aligned = alignment::align_face(image, landmarks);
        let input = Self::preprocess_embed(&aligned);

        let mut session = self
            .embedder
            .lock()
            .map_err(|_| BackendError::InferenceFailed("embedder lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| BackendError::InferenceFailed(format!("embedding extraction: {e}")))?;
        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(BackendError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding::new(values))
    }

    /// Preprocess a 112×112 aligned RGB crop into an NCHW float tensor.
    fn preprocess_embed(aligned: &[u8]) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let base = (y * size + x) * 3;
                for c in 0..3 {
                    let pixel = aligned.get(base + c).copied().unwrap_or(0) as f32;
                    tensor[[0, c, y, x]] = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                }
            }
        }

        tensor
    }
}

impl FaceBackend for InsightBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn detect_and_encode(
        &self,
        image: &PixelBuffer,
        min_face_size: u32,
    ) -> Result<Vec<DetectedFace>, BackendError> {
        let mut faces = Vec::new();
        for bbox in self.detect(image)? {
            if bbox.longer_side() < min_face_size as f32 {
                tracing::debug!(
                    width = bbox.width,
                    height = bbox.height,
                    min = min_face_size,
                    "skipping undersized face"
                );
                continue;
            }
            let embedding = self.embed(image, &bbox)?;
            faces.push(DetectedFace { bbox, embedding });
        }
        Ok(faces)
    }
}

/// Decode one SCRFD stride: distances from anchor centers to box edges,
/// plus five landmark offsets, all in input (letterboxed) coordinates.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    scale: f32,
    out: &mut Vec<BoundingBox>,
) {
    let cells = DET_INPUT_SIZE / stride;
    let anchors = cells * cells * DET_ANCHORS_PER_CELL;
    let count = scores.len().min(anchors);

    for i in 0..count {
        let score = scores[i];
        if score < DET_SCORE_THRESHOLD {
            continue;
        }
        if boxes.len() < (i + 1) * 4 || kps.len() < (i + 1) * 10 {
            break;
        }

        let cell = i / DET_ANCHORS_PER_CELL;
        let cx = ((cell % cells) * stride) as f32;
        let cy = ((cell / cells) * stride) as f32;

        let s = stride as f32;
        let left = boxes[i * 4] * s;
        let top = boxes[i * 4 + 1] * s;
        let right = boxes[i * 4 + 2] * s;
        let bottom = boxes[i * 4 + 3] * s;

        let x0 = (cx - left) / scale;
        let y0 = (cy - top) / scale;
        let x1 = (cx + right) / scale;
        let y1 = (cy + bottom) / scale;

        let mut landmarks = [(0.0f32, 0.0f32); 5];
        for (p, lm) in landmarks.iter_mut().enumerate() {
            let lx = cx + kps[i * 10 + p * 2] * s;
            let ly = cy + kps[i * 10 + p * 2 + 1] * s;
            *lm = (lx / scale, ly / scale);
        }

        out.push(BoundingBox {
            x: x0,
            y: y0,
            width: (x1 - x0).max(0.0),
            height: (y1 - y0).max(0.0),
            confidence: score,
            landmarks: Some(landmarks),
        });
    }
}

/// Greedy IoU suppression, highest confidence first.
fn non_max_suppression(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) < iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x0 = a.x.max(b.x);
    let y0 = a.y.max(b.y);
    let x1 = (a.x + a.width).min(b.x + b.width);
    let y1 = (a.y + a.height).min(b.y + b.height);

    let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}
