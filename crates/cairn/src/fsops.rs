//! Filesystem mutations, gated by dry-run.
//!
//! Everything that changes the disk during a run goes through [`FsOps`]. In
//! dry-run mode each method logs what it would have done and returns as if
//! it had succeeded; reads are never affected.

use std::{
    fs,
    io::{self, BufWriter, Write},
    path::Path,
};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Options;
use crate::manifest::{Manifest, ManifestError};

/// Atomic write: write to a tempfile beside `path`, then rename over it.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    atomic_write_with(path, |w| w.write_all(data))
}

/// Atomic write of whatever `fill` produces.
///
/// `path` is never observed half-written, and if it was a hard link the other
/// names keep the old content.
pub fn atomic_write_with<T>(
    path: &Path,
    fill: impl FnOnce(&mut dyn Write) -> io::Result<T>,
) -> io::Result<T> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let temp = NamedTempFile::new_in(parent)?;
    let mut writer = BufWriter::new(temp);
    let result = fill(&mut writer)?;
    let temp = writer.into_inner().map_err(|e| e.into_error())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(result)
}

/// Counters from mirroring one tree into another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub dirs: u64,
    pub linked: u64,
    pub copied: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FsOps {
    dry_run: bool,
}

impl FsOps {
    pub fn new(options: &Options) -> Self {
        Self {
            dry_run: options.dry_run,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        if self.dry_run {
            if !path.is_dir() {
                info!(dry_run = true, ?path, "Would create directory");
            }
            return Ok(());
        }
        fs::create_dir_all(path)
    }

    /// Create exactly `path`; fails if it already exists.
    pub fn create_dir(&self, path: &Path) -> io::Result<()> {
        if self.dry_run {
            if path.exists() {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            info!(dry_run = true, ?path, "Would create directory");
            return Ok(());
        }
        fs::create_dir(path)
    }

    /// Atomically write `path`. In dry-run `fill` still runs, into a sink.
    pub fn write_with<T>(
        &self,
        path: &Path,
        fill: impl FnOnce(&mut dyn Write) -> io::Result<T>,
    ) -> io::Result<T> {
        if self.dry_run {
            let result = fill(&mut io::sink())?;
            info!(dry_run = true, ?path, "Would write file");
            return Ok(result);
        }
        atomic_write_with(path, fill)
    }

    pub fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.write_with(path, |w| w.write_all(data))
    }

    /// Atomically replace the manifest at `path`.
    pub fn write_manifest(&self, manifest: &Manifest, path: &Path) -> Result<(), ManifestError> {
        if self.dry_run {
            info!(dry_run = true, ?path, entries = manifest.len(), "Would write manifest");
            return Ok(());
        }
        manifest.write(path)
    }

    pub fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.dry_run {
            info!(dry_run = true, ?from, ?to, "Would copy file");
            return Ok(());
        }
        fs::copy(from, to).map(|_| ())
    }

    /// Hard-link `from` at `to`, copying instead when linking fails.
    ///
    /// Returns `true` if a link was made.
    pub fn link_or_copy(&self, from: &Path, to: &Path) -> io::Result<bool> {
        if self.dry_run {
            info!(dry_run = true, ?from, ?to, "Would link file");
            return Ok(true);
        }
        match fs::hard_link(from, to) {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!(?from, ?to, %err, "Hard link failed, copying");
                fs::copy(from, to)?;
                Ok(false)
            }
        }
    }

    pub fn remove_file(&self, path: &Path) -> io::Result<()> {
        if self.dry_run {
            info!(dry_run = true, ?path, "Would remove file");
            return Ok(());
        }
        fs::remove_file(path)
    }

    pub fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        if self.dry_run {
            info!(dry_run = true, ?path, "Would remove directory");
            return Ok(());
        }
        fs::remove_dir_all(path)
    }

    /// Recreate the directory tree under `from` at `to`, hard-linking every
    /// regular file. Top-level names in `skip` are left out.
    ///
    /// A file that cannot be linked or copied is logged and skipped; failing to
    /// create a directory aborts the mirror.
    pub fn mirror_tree(&self, from: &Path, to: &Path, skip: &[&str]) -> io::Result<MirrorStats> {
        let mut stats = MirrorStats::default();

        let walker = WalkDir::new(from)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() != 1 || !skip.iter().any(|s| e.file_name() == std::ffi::OsStr::new(s))
            });

        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry.path().strip_prefix(from).map_err(io::Error::other)?;
            let target = to.join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                self.create_dir_all(&target)?;
                stats.dirs += 1;
            } else if file_type.is_file() {
                match self.link_or_copy(entry.path(), &target) {
                    Ok(true) => stats.linked += 1,
                    Ok(false) => stats.copied += 1,
                    Err(err) => warn!(path = ?entry.path(), %err, "Could not seed file"),
                }
            }
        }

        debug!(?from, ?to, ?stats, "Mirrored tree");
        Ok(stats)
    }
}
