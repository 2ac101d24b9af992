//! Reconstructing a generation's files from their artifacts.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::{MANIFEST_NAME, Options};
use crate::digest::Digest;
use crate::error::{Error, IoContext, Result};
use crate::fsops::FsOps;
use crate::generation::{artifact_path, is_safe_relative, relative_path};
use crate::manifest::{Entry, Manifest};

/// Statistics about a restore run.
#[derive(Debug, Clone, Default)]
pub struct RestoreStats {
    pub generation: String,
    /// Manifest the entries were taken from.
    pub manifest: Option<PathBuf>,
    pub restored: u64,
    /// Entries whose artifact does not exist in the generation.
    pub missing: u64,
    pub failed: u64,
    pub bytes_written: u64,
}

impl RestoreStats {
    pub fn entries(&self) -> u64 {
        self.restored + self.missing + self.failed
    }

    /// Fail if any file could not be restored.
    ///
    /// Missing artifacts are reported in the stats but do not fail the run.
    pub fn check(&self) -> Result<()> {
        if self.failed > 0 {
            return Err(Error::RestoreIncomplete {
                generation: self.generation.clone(),
                failed: self.failed,
            });
        }
        Ok(())
    }
}

enum Outcome {
    Restored(u64),
    Missing,
    Failed,
}

#[derive(Debug, thiserror::Error)]
enum FileError {
    #[error("unsafe path")]
    UnsafePath,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
    #[error("content digest mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: Digest, actual: Digest },
}

/// Pick the manifest describing `generation`.
///
/// The root manifest describes the latest generation only; for anything older
/// the generation's frozen copy is used.
fn select_manifest(generation_dir: &Path, generation: &str) -> Result<Option<(PathBuf, Manifest)>> {
    let frozen = generation_dir.join(MANIFEST_NAME);
    let root = generation_dir
        .parent()
        .map(|parent| parent.join(MANIFEST_NAME));

    if let Some(root) = root {
        if let Some(manifest) = Manifest::read_optional(&root)? {
            if manifest.for_generation(generation).next().is_some() {
                return Ok(Some((root, manifest)));
            }
        }
    }

    Ok(Manifest::read_optional(&frozen)?.map(|manifest| (frozen, manifest)))
}

/// Restore every file recorded for the generation at `generation_dir` into
/// `destination`.
///
/// A generation without a manifest restores nothing. Files whose artifact is
/// missing, fails to decode, or does not match the recorded digest are logged
/// and counted; the rest of the run continues.
pub fn restore_backup(
    generation_dir: &Path,
    destination: &Path,
    options: &Options,
) -> Result<RestoreStats> {
    let ops = FsOps::new(options);

    if !generation_dir.is_dir() {
        return Err(Error::NotADirectory(generation_dir.to_path_buf()));
    }
    let generation = generation_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Usage(format!("{generation_dir:?} does not name a generation")))?;

    let mut stats = RestoreStats {
        generation: generation.clone(),
        ..Default::default()
    };

    let Some((manifest_path, manifest)) = select_manifest(generation_dir, &generation)? else {
        warn!(?generation_dir, "No manifest found, nothing to restore");
        return Ok(stats);
    };
    info!(
        %generation,
        manifest = ?manifest_path,
        entries = manifest.len(),
        ?destination,
        dry_run = ops.is_dry_run(),
        "Restoring"
    );
    stats.manifest = Some(manifest_path);

    ops.create_dir_all(destination).at(destination)?;

    let outcomes: Vec<Outcome> = manifest
        .iter()
        .collect::<Vec<_>>()
        .par_iter()
        .map(|entry| match restore_file(&ops, entry, generation_dir, destination) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(path = %entry.path, %err, "Could not restore file");
                Outcome::Failed
            }
        })
        .collect();

    for outcome in outcomes {
        match outcome {
            Outcome::Restored(bytes) => {
                stats.restored += 1;
                stats.bytes_written += bytes;
            }
            Outcome::Missing => stats.missing += 1,
            Outcome::Failed => stats.failed += 1,
        }
    }

    info!(
        %generation,
        restored = stats.restored,
        missing = stats.missing,
        failed = stats.failed,
        "Restore complete"
    );
    Ok(stats)
}

fn restore_file(
    ops: &FsOps,
    entry: &Entry,
    generation_dir: &Path,
    destination: &Path,
) -> Result<Outcome, FileError> {
    if !is_safe_relative(&entry.path) {
        return Err(FileError::UnsafePath);
    }

    let artifact = artifact_path(generation_dir, &entry.path);
    let data = match fs::read(&artifact) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %entry.path, "Artifact missing, skipping");
            return Ok(Outcome::Missing);
        }
        Err(err) => return Err(err.into()),
    };

    let mut content = Vec::new();
    let bytes = codec::decode_into(&data, &mut content)?;
    let actual = Digest::hash(&content);
    if actual != entry.digest {
        return Err(FileError::Mismatch {
            expected: entry.digest,
            actual,
        });
    }

    let target = relative_path(destination, &entry.path);
    if let Some(parent) = target.parent() {
        ops.create_dir_all(parent)?;
    }
    ops.write(&target, &content)?;

    debug!(path = %entry.path, bytes, "Restored");
    Ok(Outcome::Restored(bytes))
}
