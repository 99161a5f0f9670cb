//! Per-cycle artifact capture.
//!
//! Every cycle gets its own directory under `runs/` holding a fingerprint
//! manifest of the tracked workspace files, a verbatim snapshot of those
//! files, and the trained model if one was produced. A separate
//! `best_model_index.json` at the project root always points at the model
//! from the best cycle so far.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "fingerprints.json";
pub const SNAPSHOT_DIR: &str = "source_snapshot";

/// Locations checked for a trained model after each cycle, in order.
pub const MODEL_CANDIDATES: &[&str] = &[
    "best_model.pt",
    "artifacts/best_model.pt",
    "outputs/best_model.pt",
    "model.pth",
    "checkpoint.pt",
];

/// Content identity of one tracked file at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub exists: bool,
    pub sha256: Option<String>,
    pub bytes: u64,
    pub lines: u64,
    /// Differs from the previous cycle's fingerprint (a file appearing
    /// for the first time counts as changed).
    pub changed: bool,
}

impl FileFingerprint {
    fn absent() -> Self {
        Self {
            exists: false,
            sha256: None,
            bytes: 0,
            lines: 0,
            changed: false,
        }
    }
}

/// Fingerprints of every tracked file for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintManifest {
    pub cycle: u32,
    pub files: BTreeMap<String, FileFingerprint>,
    pub captured_at: DateTime<Utc>,
}

impl FingerprintManifest {
    /// Load a previous cycle's manifest. Missing or unreadable manifests
    /// come back as `None`; change detection then treats every file as
    /// new.
    pub fn load(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable manifest");
                None
            }
        }
    }
}

fn fingerprint(path: &Path, previous: Option<&FileFingerprint>) -> FileFingerprint {
    let contents = match std::fs::read(path) {
        Ok(c) => c,
        Err(_) => return FileFingerprint::absent(),
    };

    let digest = hex::encode(Sha256::digest(&contents));
    let newlines = contents.iter().filter(|b| **b == b'\n').count() as u64;
    let lines = if contents.is_empty() {
        0
    } else if contents.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    };

    let changed = match previous.and_then(|p| p.sha256.as_deref()) {
        Some(prev) => prev != digest,
        None => true,
    };

    FileFingerprint {
        exists: true,
        sha256: Some(digest),
        bytes: contents.len() as u64,
        lines,
        changed,
    }
}

/// Fingerprint and snapshot the tracked files into `cycle_dir`.
///
/// Returns the manifest path and snapshot directory. Tracked files that
/// do not exist are recorded as absent, not errors.
pub fn snapshot_sources(
    workspace: &Path,
    tracked: &[String],
    cycle: u32,
    cycle_dir: &Path,
    previous: Option<&FingerprintManifest>,
) -> Result<(PathBuf, PathBuf)> {
    let snapshot_dir = cycle_dir.join(SNAPSHOT_DIR);
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("failed to create {}", snapshot_dir.display()))?;

    let mut files = BTreeMap::new();
    for name in tracked {
        let source = workspace.join(name);
        let prev = previous.and_then(|m| m.files.get(name));
        let print = fingerprint(&source, prev);

        if print.exists {
            let dest = snapshot_dir.join(name);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::copy(&source, &dest).with_context(|| {
                format!("failed to snapshot {} to {}", source.display(), dest.display())
            })?;
            if print.changed {
                debug!(file = %name, "tracked file changed this cycle");
            }
        }
        files.insert(name.clone(), print);
    }

    let manifest = FingerprintManifest {
        cycle,
        files,
        captured_at: Utc::now(),
    };
    let manifest_path = cycle_dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(&manifest).context("failed to serialize manifest")?;
    std::fs::write(&manifest_path, json)
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;

    Ok((manifest_path, snapshot_dir))
}

/// Copy the trained model, if any, from its first candidate location
/// into `cycle_dir`. `None` when no candidate exists.
pub fn capture_model(workspace: &Path, cycle_dir: &Path) -> Result<Option<PathBuf>> {
    for candidate in MODEL_CANDIDATES {
        let source = workspace.join(candidate);
        if !source.is_file() {
            continue;
        }
        let file_name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "model.bin".into());
        let dest = cycle_dir.join(file_name);
        std::fs::create_dir_all(cycle_dir)
            .with_context(|| format!("failed to create {}", cycle_dir.display()))?;
        std::fs::copy(&source, &dest).with_context(|| {
            format!("failed to copy model {} to {}", source.display(), dest.display())
        })?;
        info!(model = %candidate, "captured model artifact");
        return Ok(Some(dest));
    }
    debug!("no model artifact found in any candidate location");
    Ok(None)
}

/// Pointer to the model from the best cycle so far. Overwritten only on
/// strict improvement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestModelIndex {
    pub run_id: Uuid,
    pub cycle: u32,
    pub path: PathBuf,
    pub metric_value: f64,
    pub updated_at: DateTime<Utc>,
}

impl BestModelIndex {
    /// Write atomically, same temp-then-rename discipline as the state
    /// file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize best index")?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {} over {}", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }
}
