//! Crate-level error type.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{bundle::BundleError, codec::CodecError, manifest::ManifestError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Network error: {0}")]
    Network(#[source] io::Error),

    #[error("Not a directory: {0:?}")]
    NotADirectory(PathBuf),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Artifact error: {0}")]
    Codec(#[from] CodecError),

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("{failed} files of generation {generation} could not be restored")]
    RestoreIncomplete { generation: String, failed: u64 },

    #[error("{0}")]
    Usage(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attach a path to an I/O error.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
