//! Incremental backups.
//!
//! A run produces one generation under the backup root:
//!
//! 1. If a manifest exists, the run is incremental; otherwise it is the first.
//! 2. A generation directory named after the current time is created.
//! 3. Incremental runs hard-link the previous generation's tree into it.
//! 4. The source is walked. Each file whose digest matches the previous
//!    manifest and whose artifact was seeded is left alone; every other file
//!    is chunked and its artifact (re)written. Every readable file gets an
//!    entry in the new manifest.
//! 5. Incremental runs prune artifacts and directories that no longer have a
//!    source counterpart.
//! 6. The manifest is frozen into the generation, then atomically replaces
//!    the root manifest. That rename is the last step, so an interrupted run
//!    leaves the previous manifest in place.

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunk::chunk_stream;
use crate::codec::{self, EncodeStats};
use crate::config::{MANIFEST_NAME, Options};
use crate::digest::{Digest, HashingReader};
use crate::error::{Error, IoContext, Result};
use crate::fsops::{FsOps, MirrorStats};
use crate::generation::{
    artifact_path, create_generation, format_system_time, is_generation_name, latest_generation,
    relative_path, to_relative,
};
use crate::manifest::{Entry, Manifest};
use crate::walk::{SourceFile, walk_source};

/// Statistics about a backup run.
#[derive(Debug, Clone, Default)]
pub struct BackupStats {
    pub generation: String,
    pub generation_path: PathBuf,
    /// Name of the generation this one was seeded from.
    pub previous: Option<String>,
    pub seeded: MirrorStats,
    pub files: u64,
    pub unchanged: u64,
    pub rechunked: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pruned_files: u64,
    pub pruned_dirs: u64,
    /// Bytes of source content in rechunked files.
    pub bytes_read: u64,
    pub encoded: EncodeStats,
}

impl BackupStats {
    pub fn is_first(&self) -> bool {
        self.previous.is_none()
    }

    /// Ratio of rechunked content to literal bytes actually stored.
    pub fn dedup_ratio(&self) -> f64 {
        if self.encoded.literal_bytes > 0 {
            self.bytes_read as f64 / self.encoded.literal_bytes as f64
        } else {
            1.0
        }
    }

    pub fn space_saved(&self) -> u64 {
        self.bytes_read.saturating_sub(self.encoded.literal_bytes)
    }

    pub fn space_saved_pct(&self) -> f64 {
        if self.bytes_read > 0 {
            (self.space_saved() as f64 / self.bytes_read as f64) * 100.0
        } else {
            0.0
        }
    }
}

enum Outcome {
    Unchanged(Entry),
    Rechunked {
        entry: Entry,
        bytes: u64,
        encoded: EncodeStats,
    },
    Failed,
}

/// Per-run context shared by the per-file workers.
struct FileJob<'a> {
    ops: FsOps,
    generation: &'a str,
    generation_dir: &'a Path,
    /// Where seeded artifacts are looked for: the new generation, or in
    /// dry-run (where nothing is seeded) the previous one.
    seeded_dir: Option<&'a Path>,
    previous: Option<&'a Manifest>,
}

impl FileJob<'_> {
    fn run(&self, file: &SourceFile) -> Outcome {
        match self.process(file) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(path = ?file.path, %err, "Skipping file");
                Outcome::Failed
            }
        }
    }

    fn process(&self, file: &SourceFile) -> io::Result<Outcome> {
        let metadata = fs::metadata(&file.path)?;
        let modified = format_system_time(metadata.modified()?);
        let digest = Digest::hash_reader(BufReader::new(File::open(&file.path)?))?;

        let entry = |digest| Entry {
            generation: self.generation.to_string(),
            path: file.relative.clone(),
            modified: modified.clone(),
            digest,
        };

        let unchanged = self
            .previous
            .and_then(|m| m.get(&file.relative))
            .is_some_and(|prev| prev.digest == digest)
            && self
                .seeded_dir
                .is_some_and(|dir| artifact_path(dir, &file.relative).is_file());
        if unchanged {
            debug!(path = %file.relative, "Unchanged");
            return Ok(Outcome::Unchanged(entry(digest)));
        }

        let mut reader = HashingReader::new(BufReader::new(File::open(&file.path)?));
        let chunks = chunk_stream(&mut reader)?;
        let read_digest = reader.digest();
        let bytes = reader.bytes();
        if read_digest != digest {
            warn!(path = ?file.path, "File changed while being backed up");
        }

        let artifact = artifact_path(self.generation_dir, &file.relative);
        let encoded = self
            .ops
            .write_with(&artifact, |w| codec::encode(&chunks, w))?;

        debug!(
            path = %file.relative,
            chunks = encoded.chunks,
            references = encoded.references,
            "Rechunked"
        );
        Ok(Outcome::Rechunked {
            entry: entry(read_digest),
            bytes,
            encoded,
        })
    }
}

/// The generation a backup seeds from: the one the previous manifest
/// describes, if its directory is still there.
///
/// Generation directories newer than the manifest are left over from runs
/// that never committed, so they are not trusted.
fn seed_generation(backup_root: &Path, manifest: &Manifest) -> Option<String> {
    let Some(name) = manifest.generation() else {
        debug!(?backup_root, "Previous manifest is empty, nothing to seed");
        return None;
    };
    if !is_generation_name(name) || !backup_root.join(name).is_dir() {
        warn!(
            generation = name,
            "Generation named by the manifest is missing, rechunking everything"
        );
        return None;
    }
    if let Ok(Some(latest)) = latest_generation(backup_root) {
        if latest.as_str() > name {
            warn!(%latest, committed = name, "Ignoring generation that was never committed");
        }
    }
    Some(name.to_string())
}

/// Back up `source` into a new generation under `backup_root`.
pub fn create_backup(source: &Path, backup_root: &Path, options: &Options) -> Result<BackupStats> {
    let ops = FsOps::new(options);

    let source = source.canonicalize().at(source)?;
    if !source.is_dir() {
        return Err(Error::NotADirectory(source));
    }
    ops.create_dir_all(backup_root).at(backup_root)?;
    let backup_root = backup_root
        .canonicalize()
        .unwrap_or_else(|_| backup_root.to_path_buf());

    let manifest_path = backup_root.join(MANIFEST_NAME);
    let previous_manifest = Manifest::read_optional(&manifest_path)?;
    let previous = previous_manifest
        .as_ref()
        .and_then(|manifest| seed_generation(&backup_root, manifest));

    let (generation, generation_dir) = create_generation(&backup_root, &ops)?;
    info!(
        ?source,
        %generation,
        previous = previous.as_deref().unwrap_or("none"),
        dry_run = ops.is_dry_run(),
        "Creating backup"
    );

    let mut stats = BackupStats {
        generation: generation.clone(),
        generation_path: generation_dir.clone(),
        previous: previous.clone(),
        ..Default::default()
    };

    let previous_dir = previous.as_ref().map(|name| backup_root.join(name));
    if let Some(previous_dir) = &previous_dir {
        stats.seeded = ops
            .mirror_tree(previous_dir, &generation_dir, &[MANIFEST_NAME])
            .at(previous_dir)?;
    }

    let tree = walk_source(&source, Some(&backup_root))?;
    stats.skipped = tree.skipped;
    for dir in &tree.dirs {
        let path = relative_path(&generation_dir, dir);
        ops.create_dir_all(&path).at(path)?;
    }

    let seeded_dir = if ops.is_dry_run() {
        previous_dir.as_deref()
    } else if previous_dir.is_some() {
        Some(generation_dir.as_path())
    } else {
        None
    };
    let job = FileJob {
        ops,
        generation: &generation,
        generation_dir: &generation_dir,
        seeded_dir,
        previous: previous_manifest.as_ref(),
    };

    let outcomes: Vec<Outcome> = tree.files.par_iter().map(|file| job.run(file)).collect();

    let mut manifest = Manifest::new();
    for outcome in outcomes {
        stats.files += 1;
        match outcome {
            Outcome::Unchanged(entry) => {
                stats.unchanged += 1;
                manifest.push(entry);
            }
            Outcome::Rechunked {
                entry,
                bytes,
                encoded,
            } => {
                stats.rechunked += 1;
                stats.bytes_read += bytes;
                stats.encoded.add(&encoded);
                manifest.push(entry);
            }
            Outcome::Failed => stats.failed += 1,
        }
    }

    if let (Some(previous_manifest), Some(previous_dir)) = (&previous_manifest, &previous_dir) {
        let source_dirs: HashSet<&str> = tree.dirs.iter().map(String::as_str).collect();
        let (files, dirs) = prune(
            &ops,
            previous_manifest,
            &manifest,
            &source_dirs,
            &generation_dir,
            previous_dir,
        );
        stats.pruned_files = files;
        stats.pruned_dirs = dirs;
    }

    let frozen = generation_dir.join(MANIFEST_NAME);
    ops.write(&frozen, manifest.to_text().as_bytes()).at(&frozen)?;
    ops.write_manifest(&manifest, &manifest_path)?;

    info!(
        %generation,
        files = stats.files,
        unchanged = stats.unchanged,
        rechunked = stats.rechunked,
        failed = stats.failed,
        pruned = stats.pruned_files + stats.pruned_dirs,
        "Backup complete"
    );
    Ok(stats)
}

/// Remove what the previous generation had but the source no longer does.
///
/// Returns the number of files and directories removed.
fn prune(
    ops: &FsOps,
    previous: &Manifest,
    current: &Manifest,
    source_dirs: &HashSet<&str>,
    generation_dir: &Path,
    previous_dir: &Path,
) -> (u64, u64) {
    // In dry-run the new generation is never populated; inspect what seeding would have produced
    let inspect_dir = if ops.is_dry_run() {
        previous_dir
    } else {
        generation_dir
    };

    let mut files = 0;
    for entry in previous.iter().filter(|e| !current.contains(&e.path)) {
        if !artifact_path(inspect_dir, &entry.path).is_file() {
            continue;
        }
        let artifact = artifact_path(generation_dir, &entry.path);
        match ops.remove_file(&artifact) {
            Ok(()) => {
                debug!(path = %entry.path, "Pruned artifact");
                files += 1;
            }
            Err(err) => warn!(?artifact, %err, "Could not prune artifact"),
        }
    }

    let mut dirs = 0;
    let mut walker = WalkDir::new(inspect_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "Could not inspect generation while pruning");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(inspect_dir) else {
            continue;
        };
        let relative = to_relative(relative);
        if source_dirs.contains(relative.as_str()) {
            continue;
        }

        walker.skip_current_dir();
        let target = relative_path(generation_dir, &relative);
        match ops.remove_dir_all(&target) {
            Ok(()) => {
                debug!(path = %relative, "Pruned directory");
                dirs += 1;
            }
            Err(err) => warn!(?target, %err, "Could not prune directory"),
        }
    }

    (files, dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::restore_backup;
    use tempfile::TempDir;

    #[test]
    fn test_first_backup_layout() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::create_dir(source.path().join("sub")).unwrap();
        fs::write(source.path().join("a.txt"), b"AAAA").unwrap();
        fs::write(source.path().join("sub/b.txt"), b"BBBB").unwrap();

        let stats = create_backup(source.path(), backups.path(), &Options::default()).unwrap();

        assert!(stats.is_first());
        assert_eq!(stats.files, 2);
        assert_eq!(stats.rechunked, 2);
        assert_eq!(stats.unchanged, 0);

        let gen_dir = backups.path().join(&stats.generation);
        assert!(gen_dir.join("a.txt.dedup").is_file());
        assert!(gen_dir.join("sub/b.txt.dedup").is_file());
        assert_eq!(
            fs::read(gen_dir.join(MANIFEST_NAME)).unwrap(),
            fs::read(backups.path().join(MANIFEST_NAME)).unwrap()
        );

        let manifest = Manifest::read(&backups.path().join(MANIFEST_NAME)).unwrap();
        assert_eq!(manifest.len(), 2);
        let entry = manifest.get("sub/b.txt").unwrap();
        assert_eq!(entry.generation, stats.generation);
        assert_eq!(entry.digest, Digest::hash(b"BBBB"));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), vec![1u8; 10_000]).unwrap();

        let stats = create_backup(source.path(), backups.path(), &Options::dry_run()).unwrap();

        assert_eq!(stats.rechunked, 1);
        assert_eq!(stats.encoded.chunks, 3);
        assert_eq!(stats.encoded.references, 1);
        assert_eq!(fs::read_dir(backups.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_dry_run_predicts_incremental_run() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(source.path().join("same"), b"same").unwrap();
        fs::write(source.path().join("edit"), b"before").unwrap();
        fs::write(source.path().join("gone"), b"gone").unwrap();
        create_backup(source.path(), backups.path(), &Options::default()).unwrap();

        fs::write(source.path().join("edit"), b"after").unwrap();
        fs::remove_file(source.path().join("gone")).unwrap();

        let dry = create_backup(source.path(), backups.path(), &Options::dry_run()).unwrap();
        assert_eq!(dry.unchanged, 1);
        assert_eq!(dry.rechunked, 1);
        assert_eq!(dry.pruned_files, 1);
        assert_eq!(list_generation_count(backups.path()), 1);

        let real = create_backup(source.path(), backups.path(), &Options::default()).unwrap();
        assert_eq!(real.unchanged, dry.unchanged);
        assert_eq!(real.rechunked, dry.rechunked);
        assert_eq!(real.pruned_files, dry.pruned_files);
    }

    #[test]
    fn test_unreadable_file_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(source.path().join("ok"), b"ok").unwrap();
        let locked = source.path().join("locked");
        fs::write(&locked, b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root can read anything; nothing to test then
        if File::open(&locked).is_ok() {
            return;
        }

        let stats = create_backup(source.path(), backups.path(), &Options::default()).unwrap();
        assert_eq!(stats.failed, 1);
        let manifest = Manifest::read(&backups.path().join(MANIFEST_NAME)).unwrap();
        assert!(manifest.contains("ok"));
        assert!(!manifest.contains("locked"));
    }

    #[test]
    fn test_uncommitted_generation_is_not_seeded() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(source.path().join("f"), b"AAAA").unwrap();
        let first = create_backup(source.path(), backups.path(), &Options::default()).unwrap();

        // Newer than the manifest: a run that died before committing
        let stray = backups.path().join("2999-01-01-00:00:00.000");
        fs::create_dir(&stray).unwrap();
        let chunks = chunk_stream(&b"BBBB"[..]).unwrap();
        fs::write(stray.join("f.dedup"), codec::encode_to_vec(&chunks).unwrap()).unwrap();

        let second = create_backup(source.path(), backups.path(), &Options::default()).unwrap();
        assert_eq!(second.previous.as_deref(), Some(first.generation.as_str()));
        assert_eq!(second.unchanged, 1);

        let dest = TempDir::new().unwrap();
        let restored = restore_backup(
            &backups.path().join(&second.generation),
            dest.path(),
            &Options::default(),
        )
        .unwrap();
        assert_eq!(restored.restored, 1);
        assert_eq!(fs::read(dest.path().join("f")).unwrap(), b"AAAA");
    }

    #[test]
    fn test_missing_committed_generation_rechunks() {
        let source = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(source.path().join("f"), b"AAAA").unwrap();
        let first = create_backup(source.path(), backups.path(), &Options::default()).unwrap();
        fs::remove_dir_all(backups.path().join(&first.generation)).unwrap();

        let second = create_backup(source.path(), backups.path(), &Options::default()).unwrap();
        assert!(second.previous.is_none());
        assert_eq!(second.unchanged, 0);
        assert_eq!(second.rechunked, 1);

        let dest = TempDir::new().unwrap();
        let restored = restore_backup(
            &backups.path().join(&second.generation),
            dest.path(),
            &Options::default(),
        )
        .unwrap();
        assert_eq!(restored.restored, 1);
    }

    fn list_generation_count(root: &Path) -> usize {
        crate::generation::list_generations(root).unwrap().len()
    }
}
