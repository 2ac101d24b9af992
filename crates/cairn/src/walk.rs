//! Source tree traversal.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::{Error, IoContext, Result};

/// A regular file found in the source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the source root, `/`-separated.
    pub relative: String,
}

/// Everything a backup needs to know about the source tree.
#[derive(Debug, Clone, Default)]
pub struct SourceTree {
    pub files: Vec<SourceFile>,
    /// Relative paths of directories, parents before children.
    pub dirs: Vec<String>,
    /// Entries that were not regular files or directories, or could not be read.
    pub skipped: u64,
}

/// Walk `root` depth-first with an explicit stack of pending directories.
///
/// Entries are sorted by name, so the result is deterministic. Symlinks are
/// not followed. `exclude` (typically the backup root) is left out with
/// everything below it. Failing to read `root` itself is an error; failing to
/// read a subdirectory is logged and counted.
pub fn walk_source(root: &Path, exclude: Option<&Path>) -> Result<SourceTree> {
    if !root.is_dir() {
        return Err(Error::NotADirectory(root.to_path_buf()));
    }

    let mut tree = SourceTree::default();
    let mut pending: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        if !prefix.is_empty() {
            tree.dirs.push(prefix.clone());
        }
        let read = match fs::read_dir(&dir) {
            Ok(read) => read,
            Err(err) if prefix.is_empty() => return Err(err).at(dir),
            Err(err) => {
                warn!(path = ?dir, %err, "Skipping unreadable directory");
                tree.skipped += 1;
                continue;
            }
        };

        let mut entries = Vec::new();
        for entry in read {
            match entry {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(path = ?dir, %err, "Skipping unreadable entry");
                    tree.skipped += 1;
                }
            }
        }
        entries.sort_by_key(|e| e.file_name());

        let mut subdirs = Vec::new();
        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains('\n') {
                warn!(?path, "Skipping file name containing a newline");
                tree.skipped += 1;
                continue;
            }
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    warn!(?path, %err, "Skipping entry of unknown type");
                    tree.skipped += 1;
                    continue;
                }
            };

            if file_type.is_dir() {
                if exclude.is_some_and(|ex| ex == path) {
                    debug!(?path, "Skipping backup destination inside source");
                    continue;
                }
                subdirs.push((path, relative));
            } else if file_type.is_file() {
                tree.files.push(SourceFile { path, relative });
            } else {
                debug!(?path, "Skipping special file");
                tree.skipped += 1;
            }
        }

        // Reversed so the first subdirectory is popped first
        pending.extend(subdirs.into_iter().rev());
    }

    debug!(
        files = tree.files.len(),
        dirs = tree.dirs.len(),
        skipped = tree.skipped,
        "Walked source tree"
    );
    Ok(tree)
}
