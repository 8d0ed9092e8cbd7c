#![allow(dead_code)] // each test binary uses a different subset

//! Shared fixtures for the pipeline integration tests.
//!
//! The stub backend reads "faces" out of synthetic photos: every
//! maximal run of uniformly colored, non-white columns is one face, and
//! its embedding is the normalized RGB of that color. Solid white means
//! no face. That makes recognition fully deterministic without any
//! model files.

use classpix_core::{
    BackendDescriptor, BackendError, BoundingBox, DetectedFace, Embedding, Engine, FaceBackend,
    PixelBuffer,
};
use classpix_pipeline::config::{ForceToggles, Settings};
use classpix_pipeline::{Pipeline, RunSummary};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const RED: [u8; 3] = [220, 20, 20];
pub const GREEN: [u8; 3] = [20, 220, 20];
pub const BLUE: [u8; 3] = [20, 20, 220];
pub const WHITE: [u8; 3] = [255, 255, 255];

#[derive(Debug)]
pub struct StripeBackend {
    descriptor: BackendDescriptor,
    calls: Arc<AtomicUsize>,
}

impl StripeBackend {
    pub fn new() -> Self {
        Self::with_engine(Engine::Insightface)
    }

    pub fn with_engine(engine: Engine) -> Self {
        Self {
            descriptor: BackendDescriptor::for_engine(engine),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl FaceBackend for StripeBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn detect_and_encode(
        &self,
        image: &PixelBuffer,
        min_face_size: u32,
    ) -> Result<Vec<DetectedFace>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        // Column is "uniform" if every pixel matches its top pixel.
        let column_color = |x: u32| -> Option<[u8; 3]> {
            let top = image.pixel(x, 0);
            for y in 1..image.height {
                if image.pixel(x, y) != top {
                    return None;
                }
            }
            Some(top)
        };

        let mut faces = Vec::new();
        let mut x = 0u32;
        while x < image.width {
            let Some(color) = column_color(x) else {
                x += 1;
                continue;
            };
            let start = x;
            while x < image.width && column_color(x) == Some(color) {
                x += 1;
            }
            if color == WHITE {
                continue;
            }
            // Faces present as big enough for the default size floor.
            let side = 100.0f32;
            if side < min_face_size as f32 {
                continue;
            }
            faces.push(DetectedFace {
                bbox: BoundingBox {
                    x: start as f32,
                    y: 0.0,
                    width: side,
                    height: side,
                    confidence: 0.95,
                    landmarks: None,
                },
                embedding: Embedding::new(vec![
                    color[0] as f32 / 255.0,
                    color[1] as f32 / 255.0,
                    color[2] as f32 / 255.0,
                ]),
            });
        }
        Ok(faces)
    }
}

/// A test working directory with the standard input layout.
pub struct Workspace {
    pub dir: TempDir,
    pub settings: Settings,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let settings = Settings::default().anchored_at(dir.path());
        std::fs::create_dir_all(settings.classroom_root()).unwrap();
        std::fs::create_dir_all(settings.reference_root()).unwrap();
        Self { dir, settings }
    }

    pub fn output(&self, rel: &str) -> PathBuf {
        self.settings.output_root.join(rel)
    }

    pub fn classroom(&self, rel: &str) -> PathBuf {
        self.settings.classroom_root().join(rel)
    }

    /// One solid-color reference photo for `person`.
    pub fn add_reference(&self, person: &str, name: &str, rgb: [u8; 3]) {
        let dir = self.settings.reference_root().join(person);
        std::fs::create_dir_all(&dir).unwrap();
        save_solid(&dir.join(name), rgb);
    }

    /// A classroom photo under `date` with the given vertical stripes
    /// (white = background between faces).
    pub fn add_class_photo(&self, date: &str, name: &str, stripes: &[[u8; 3]]) {
        let dir = self.settings.classroom_root().join(date);
        std::fs::create_dir_all(&dir).unwrap();
        save_stripes(&dir.join(name), stripes);
    }

    pub fn run(&self, backend: &Arc<StripeBackend>) -> RunSummary {
        self.run_with(backend, ForceToggles::default())
            .expect("pipeline run failed")
    }

    pub fn run_with(
        &self,
        backend: &Arc<StripeBackend>,
        toggles: ForceToggles,
    ) -> Result<RunSummary, classpix_pipeline::PipelineError> {
        let pipeline = Pipeline::new(
            self.settings.clone(),
            Arc::clone(backend) as Arc<dyn FaceBackend>,
            toggles,
        );
        pipeline.run(Arc::new(AtomicBool::new(false)))
    }

    /// Every file in the output tree (relative paths), reports excluded.
    pub fn output_files(&self) -> Vec<String> {
        let mut files: Vec<String> = walk_files(&self.settings.output_root)
            .into_iter()
            .filter(|p| !p.ends_with("_report.txt"))
            .collect();
        files.sort();
        files
    }
}

pub fn save_solid(path: &Path, rgb: [u8; 3]) {
    save_stripes(path, &[rgb]);
}

/// Write a PNG of equal-width vertical stripes with white separators.
pub fn save_stripes(path: &Path, stripes: &[[u8; 3]]) {
    let stripe_w = 6u32;
    let gap = 2u32;
    let width = stripes.len() as u32 * (stripe_w + gap) + gap;
    let height = 8u32;
    let img = image::RgbImage::from_fn(width, height, |x, _| {
        let cell = x % (stripe_w + gap);
        let idx = (x / (stripe_w + gap)) as usize;
        if x < gap || cell < gap || idx >= stripes.len() {
            image::Rgb(WHITE)
        } else {
            image::Rgb(stripes[idx])
        }
    });
    img.save(path).unwrap();
}

pub fn walk_files(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    if !root.is_dir() {
        return out;
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).into_iter().flatten().flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    out.sort();
    out
}
