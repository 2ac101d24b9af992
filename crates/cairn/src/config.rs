//! Run options and on-disk layout constants.

/// Name of the manifest file, both at the backup root and frozen inside each generation.
pub const MANIFEST_NAME: &str = ".backup_log";

/// Extension appended to every source file name inside a generation.
pub const ARTIFACT_EXTENSION: &str = "dedup";

/// Options shared by every operation of a run.
///
/// This is passed explicitly rather than held in globals so concurrent callers
/// (and tests) can use different settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Compute and log everything, but perform no filesystem mutation.
    pub dry_run: bool,
}

impl Options {
    pub fn dry_run() -> Self {
        Self { dry_run: true }
    }
}
