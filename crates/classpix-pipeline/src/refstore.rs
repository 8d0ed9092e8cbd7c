//! Reference-embedding store.
//!
//! One folder per known person under the reference root. The store
//! selects up to N reference photos per person (newest first), encodes
//! each through the backend, and keeps the embeddings in a per-backend
//! binary cache so unchanged reference photos are never re-encoded.
//!
//! Layout under the log root:
//! `reference_encodings/<engine>/<model>/<person>/<file-id>.bin` and
//! `reference_index/<engine>/<model>.json`. A backend switch reads and
//! writes an entirely separate subtree.

use chrono::{Local, SecondsFormat};
use classpix_core::{BackendDescriptor, Embedding, FaceBackend, ReferenceSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::PipelineError;
use crate::fsutil;

pub const INDEX_VERSION: u32 = 1;

/// One selected reference image and where it came from.
#[derive(Debug, Clone)]
struct RefImage {
    person: String,
    abs_path: PathBuf,
    /// `<person>/<file name>`, `/`-separated.
    rel_path: String,
    size: u64,
    mtime: i64,
}

/// Outcome of encoding one reference image, persisted for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefStatus {
    Encoded,
    NoFace,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub person: String,
    pub rel_path: String,
    pub size: u64,
    pub mtime: i64,
    pub status: RefStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceIndex {
    pub version: u32,
    pub backend: BackendDescriptor,
    pub generated_at: String,
    pub records: Vec<ReferenceRecord>,
}

/// What the orchestrator gets back: the matcher's reference arrays plus
/// the content-addressed fingerprint of the reference photo set.
pub struct ReferenceLoad {
    pub refs: ReferenceSet,
    pub fingerprint: String,
    pub persons: usize,
    pub encoded: usize,
    pub skipped: usize,
}

pub struct ReferenceStore {
    reference_root: PathBuf,
    log_root: PathBuf,
    descriptor: BackendDescriptor,
    max_refs_per_person: usize,
}

impl ReferenceStore {
    pub fn new(
        reference_root: &Path,
        log_root: &Path,
        descriptor: BackendDescriptor,
        max_refs_per_person: usize,
    ) -> Self {
        Self {
            reference_root: reference_root.to_path_buf(),
            log_root: log_root.to_path_buf(),
            descriptor,
            max_refs_per_person: max_refs_per_person.max(1),
        }
    }

    /// Embedding cache directory for this backend.
    pub fn encodings_dir(&self) -> PathBuf {
        self.log_root
            .join("reference_encodings")
            .join(self.descriptor.engine.as_str())
            .join(&self.descriptor.model)
    }

    /// Reference index path for this backend.
    pub fn index_path(&self) -> PathBuf {
        self.log_root
            .join("reference_index")
            .join(self.descriptor.engine.as_str())
            .join(format!("{}.json", self.descriptor.model))
    }

    /// Materialize the reference set.
    ///
    /// Per image: reuse the cached embedding when `(rel_path, size,
    /// mtime)` is unchanged, otherwise decode + encode and persist. An
    /// unreadable or faceless reference photo is logged and skipped; the
    /// person keeps their other embeddings. An empty reference root
    /// yields an empty set (every classroom face will go to clustering).
    pub fn load(&self, backend: &dyn FaceBackend) -> Result<ReferenceLoad, PipelineError> {
        let selections = self.scan();
        let fingerprint = self.fingerprint_of(&selections);

        let mut outcomes: Vec<(RefImage, RefStatus, Option<Embedding>)> =
            Vec::with_capacity(selections.len());
        let mut fresh = 0usize;
        for image in &selections {
            match self.load_cached(image) {
                Some(embedding) => outcomes.push((image.clone(), RefStatus::Encoded, Some(embedding))),
                None => {
                    let (status, embedding) = self.encode(backend, image);
                    if matches!(status, RefStatus::Encoded) {
                        fresh += 1;
                    }
                    outcomes.push((image.clone(), status, embedding));
                }
            }
        }

        // Mixed dimensionality means the cache predates a model change
        // within the same descriptor. Drop the whole backend subtree and
        // encode everything from scratch.
        if has_mixed_dims(&outcomes) {
            tracing::warn!(
                backend = %self.descriptor,
                "embedding dimensionality mismatch in reference cache, rebuilding"
            );
            let _ = std::fs::remove_dir_all(self.encodings_dir());
            fresh = 0;
            outcomes.clear();
            for image in &selections {
                let (status, embedding) = self.encode(backend, image);
                if matches!(status, RefStatus::Encoded) {
                    fresh += 1;
                }
                outcomes.push((image.clone(), status, embedding));
            }
            if has_mixed_dims(&outcomes) {
                return Err(PipelineError::InvariantViolation(
                    "backend produced embeddings of differing dimensionality".to_string(),
                ));
            }
        }

        let mut refs = ReferenceSet::new();
        let mut records = Vec::with_capacity(outcomes.len());
        let mut encoded = 0usize;
        let mut skipped = 0usize;
        let persons = {
            let mut names: Vec<&str> = outcomes.iter().map(|(i, _, _)| i.person.as_str()).collect();
            names.dedup();
            names.len()
        };

        for (image, status, embedding) in outcomes {
            if let Some(embedding) = embedding {
                refs.push(&image.person, embedding)
                    .map_err(|e| PipelineError::InvariantViolation(e.to_string()))?;
                encoded += 1;
            } else {
                skipped += 1;
            }
            records.push(ReferenceRecord {
                person: image.person,
                rel_path: image.rel_path,
                size: image.size,
                mtime: image.mtime,
                status,
            });
        }

        self.persist_index(records);

        tracing::info!(
            persons,
            embeddings = encoded,
            newly_encoded = fresh,
            skipped,
            "reference set ready"
        );

        Ok(ReferenceLoad {
            refs,
            fingerprint,
            persons,
            encoded,
            skipped,
        })
    }

    /// Scan the reference root into per-person image selections.
    fn scan(&self) -> Vec<RefImage> {
        let Ok(entries) = std::fs::read_dir(&self.reference_root) else {
            tracing::warn!(
                path = %self.reference_root.display(),
                "reference photo folder missing, continuing without known persons"
            );
            return Vec::new();
        };

        let mut person_dirs: Vec<PathBuf> = Vec::new();
        let mut stray_images = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if fsutil::is_ignored_entry(name) {
                continue;
            }
            if path.is_dir() {
                person_dirs.push(path);
            } else if fsutil::is_supported_nonempty_image(&path) {
                stray_images += 1;
            }
        }
        if stray_images > 0 {
            tracing::warn!(
                count = stray_images,
                "images directly under the reference root are ignored; put each person's photos in their own folder"
            );
        }
        person_dirs.sort();

        let mut selected = Vec::new();
        for dir in person_dirs {
            let person = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            let mut images: Vec<RefImage> = Vec::new();
            let Ok(children) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut nested = 0usize;
            for child in children.flatten() {
                let path = child.path();
                if path.is_dir() {
                    nested += 1;
                    continue;
                }
                if !fsutil::is_supported_nonempty_image(&path) {
                    continue;
                }
                let Ok(meta) = path.metadata() else { continue };
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                images.push(RefImage {
                    person: person.clone(),
                    rel_path: format!("{person}/{file_name}"),
                    abs_path: path,
                    size: meta.len(),
                    mtime,
                });
            }
            if nested > 0 {
                tracing::warn!(person = %person, "nested folders under a person are ignored");
            }
            if images.is_empty() {
                tracing::warn!(person = %person, "no usable reference photos for this person");
                continue;
            }

            // Newest first, file-name tie-break, capped at N.
            images.sort_by(|a, b| b.mtime.cmp(&a.mtime).then(a.rel_path.cmp(&b.rel_path)));
            if images.len() > self.max_refs_per_person {
                tracing::warn!(
                    person = %person,
                    available = images.len(),
                    cap = self.max_refs_per_person,
                    "too many reference photos, keeping the newest"
                );
                images.truncate(self.max_refs_per_person);
            }
            selected.extend(images);
        }

        selected
    }

    fn cache_file_for(&self, image: &RefImage) -> PathBuf {
        self.encodings_dir()
            .join(&image.person)
            .join(format!("{}.bin", file_id(image)))
    }

    fn load_cached(&self, image: &RefImage) -> Option<Embedding> {
        read_embedding_file(&self.cache_file_for(image))
    }

    fn encode(&self, backend: &dyn FaceBackend, image: &RefImage) -> (RefStatus, Option<Embedding>) {
        let pixels = match classpix_core::imageio::load(&image.abs_path) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(photo = %image.rel_path, error = %e, "unreadable reference photo, skipping");
                return (RefStatus::Failed, None);
            }
        };
        // Reference photos are expected to be close-ups; no size floor.
        let faces = match backend.detect_and_encode(&pixels, 0) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(photo = %image.rel_path, error = %e, "backend failed on reference photo, skipping");
                return (RefStatus::Failed, None);
            }
        };
        let best = faces.into_iter().max_by(|a, b| {
            a.bbox
                .confidence
                .partial_cmp(&b.bbox.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let Some(face) = best else {
            tracing::warn!(photo = %image.rel_path, "no face detected in reference photo, skipping");
            return (RefStatus::NoFace, None);
        };

        let path = self.cache_file_for(image);
        if let Err(e) = write_embedding_file(&path, &face.embedding) {
            tracing::warn!(photo = %image.rel_path, error = %e, "could not persist reference embedding");
        }
        (RefStatus::Encoded, Some(face.embedding))
    }

    fn persist_index(&self, records: Vec<ReferenceRecord>) {
        let index = ReferenceIndex {
            version: INDEX_VERSION,
            backend: self.descriptor.clone(),
            generated_at: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            records,
        };
        let payload = serde_json::to_vec_pretty(&index).expect("index serializes");
        if let Err(e) = fsutil::write_atomic(&self.index_path(), &payload) {
            tracing::warn!(error = %e, "could not persist reference index");
        }
    }

    /// Content-addressed digest of the reference photo set.
    ///
    /// Covers the sorted `(person, rel_path, size, mtime)` tuples plus
    /// the backend descriptor; any reference change yields a new value.
    fn fingerprint_of(&self, selections: &[RefImage]) -> String {
        let mut lines: Vec<String> = selections
            .iter()
            .map(|i| format!("{}|{}|{}|{}", i.person, i.rel_path, i.size, i.mtime))
            .collect();
        lines.sort();

        let mut hasher = Sha256::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(self.descriptor.to_string().as_bytes());
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

/// Stable cache-file id for one reference image.
fn file_id(image: &RefImage) -> String {
    let digest = Sha256::digest(
        format!("{}|{}|{}", image.rel_path, image.size, image.mtime).as_bytes(),
    );
    hex::encode(digest)[..16].to_string()
}

/// Binary embedding layout: 4-byte LE dimensionality header, then
/// `dim × 4` bytes of IEEE-754 LE floats.
fn write_embedding_file(path: &Path, embedding: &Embedding) -> Result<(), fsutil::FsError> {
    let mut bytes = Vec::with_capacity(4 + embedding.dim() * 4);
    bytes.extend_from_slice(&(embedding.dim() as u32).to_le_bytes());
    for v in &embedding.values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    fsutil::write_atomic(path, &bytes)
}

fn read_embedding_file(path: &Path) -> Option<Embedding> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() < 4 {
        return None;
    }
    let dim = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
    if bytes.len() != 4 + dim * 4 {
        tracing::warn!(path = %path.display(), "truncated embedding file, ignoring");
        return None;
    }
    let values = bytes[4..]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Some(Embedding::new(values))
}

fn has_mixed_dims(outcomes: &[(RefImage, RefStatus, Option<Embedding>)]) -> bool {
    let mut seen: Option<usize> = None;
    for (_, _, embedding) in outcomes {
        if let Some(e) = embedding {
            match seen {
                None => seen = Some(e.dim()),
                Some(d) if d != e.dim() => return true,
                Some(_) => {}
            }
        }
    }
    false
}
