//! Filesystem helpers shared across the pipeline.
//!
//! Atomic writes (temp + fsync + rename), OS-junk filtering, supported
//! photo checks, collision-suffix naming, and the resolved-under guard
//! used before any destructive cleanup.

use classpix_core::imageio;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("atomic write to {path} failed: {reason}")]
    AtomicWrite { path: PathBuf, reason: String },
    #[error("path escapes its base directory: {path}")]
    OutsideBase { path: PathBuf },
}

/// True for OS-generated metadata/hidden entries that must never be
/// treated as photos or date folders.
///
/// Covers macOS zip metadata (`__MACOSX/`, `.DS_Store`, AppleDouble
/// `._*` sidecars, Finder `Icon\r`) and Windows Explorer metadata
/// (`Thumbs.db`, `desktop.ini`).
pub fn is_ignored_entry(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    if name.starts_with('.') {
        return true;
    }
    let lower = name.to_ascii_lowercase();
    if matches!(lower.as_str(), "__macosx" | "thumbs.db" | "desktop.ini") {
        return true;
    }
    // Finder custom icon marker in some archives
    if name == "Icon\r" {
        return true;
    }
    false
}

/// True iff `path` is a supported, non-empty photo file and not OS junk.
///
/// Zero-byte files with a photo extension are invalid input and ignored
/// everywhere (processing, snapshots, reference scans).
pub fn is_supported_nonempty_image(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if is_ignored_entry(name) {
        return false;
    }
    if !imageio::is_supported_extension(path) {
        return false;
    }
    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename into place, then best-effort directory sync.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FsError> {
    let err = |reason: String| FsError::AtomicWrite {
        path: path.to_path_buf(),
        reason,
    };

    let parent = path
        .parent()
        .ok_or_else(|| err("missing parent directory".to_string()))?;
    std::fs::create_dir_all(parent).map_err(|e| err(e.to_string()))?;

    let tmp = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|s| s.to_str()).unwrap_or("file"),
        std::process::id()
    ));
    {
        let mut f = std::fs::File::create(&tmp).map_err(|e| err(e.to_string()))?;
        f.write_all(bytes).map_err(|e| err(e.to_string()))?;
        f.sync_all().map_err(|e| err(e.to_string()))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| err(e.to_string()))?;
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Pick a destination name in `dir` that does not collide.
///
/// The first collision-free candidate is `file_name` itself; after that,
/// an ordinal goes in before the extension: `name_001.ext`, `_002`, …
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = split_name(file_name);
    for i in 1..10_000u32 {
        let alt = if ext.is_empty() {
            dir.join(format!("{stem}_{i:03}"))
        } else {
            dir.join(format!("{stem}_{i:03}.{ext}"))
        };
        if !alt.exists() {
            return alt;
        }
    }
    // Pathological directory; pid-qualified name cannot recur within a run.
    dir.join(format!("{stem}_{}.{ext}", std::process::id()))
}

fn split_name(file_name: &str) -> (&str, &str) {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (file_name, ""),
    }
}

/// Refuse to touch paths that resolve outside `base` (symlink escapes).
///
/// Used before deleting output subtrees during deletion sync.
pub fn ensure_resolved_under(base: &Path, target: &Path) -> Result<(), FsError> {
    let base = base.canonicalize().map_err(|_| FsError::OutsideBase {
        path: base.to_path_buf(),
    })?;
    // The target may not exist yet; resolve the nearest existing ancestor.
    let mut probe = target.to_path_buf();
    let resolved = loop {
        match probe.canonicalize() {
            Ok(p) => break p,
            Err(_) => match probe.parent() {
                Some(parent) => probe = parent.to_path_buf(),
                None => {
                    return Err(FsError::OutsideBase {
                        path: target.to_path_buf(),
                    })
                }
            },
        }
    };
    if resolved.starts_with(&base) {
        Ok(())
    } else {
        Err(FsError::OutsideBase {
            path: target.to_path_buf(),
        })
    }
}
