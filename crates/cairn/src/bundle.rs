//! Serializing a whole generation to a byte stream and back.
//!
//! ```text
//! magic    "CAIRNGEN"
//! version  u8
//! name     u16 LE length, then the generation name
//! records  repeated until an end record:
//!   tag    u8: 0 end, 1 directory, 2 file
//!   path   u32 LE length, then the `/`-separated relative path
//!   data   (files only) u64 LE length, then the file contents
//! ```
//!
//! Directories always precede their contents. The generation's frozen
//! manifest travels as an ordinary file.

use std::{
    fs,
    io::{self, Read, Write},
    path::Path,
};

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{MANIFEST_NAME, Options};
use crate::error::{Error, IoContext, Result};
use crate::fsops::FsOps;
use crate::generation::{
    is_generation_name, is_safe_relative, latest_generation, relative_path, to_relative,
};
use crate::manifest::Manifest;

const MAGIC: &[u8; 8] = b"CAIRNGEN";
const VERSION: u8 = 1;

/// Prefix of the directory a generation is unpacked into before it is
/// renamed into place. Dot-prefixed names are never listed as generations.
const STAGING_PREFIX: &str = ".receiving-";

const TAG_END: u8 = 0;
const TAG_DIR: u8 = 1;
const TAG_FILE: u8 = 2;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Not a generation bundle")]
    BadMagic,
    #[error("Unsupported bundle version {0}")]
    UnsupportedVersion(u8),
    #[error("Invalid generation name {0:?}")]
    InvalidName(String),
    #[error("Path escapes the generation: {0:?}")]
    UnsafePath(String),
    #[error("Bundle is truncated")]
    Truncated,
    #[error("Unknown record tag {0}")]
    UnknownTag(u8),
    #[error("Generation {0} already exists")]
    Exists(String),
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for BundleError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err)
        }
    }
}

/// What went through a bundle.
#[derive(Debug, Clone, Default)]
pub struct BundleStats {
    pub generation: String,
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
    /// Whether the receiver made this generation's manifest the root manifest.
    pub installed_manifest: bool,
}

fn put_path(buf: &mut BytesMut, tag: u8, path: &str) {
    buf.put_u8(tag);
    buf.put_u32_le(path.len() as u32);
    buf.put_slice(path.as_bytes());
}

/// Write the generation `name` under `root` to `sink`.
pub fn write_generation(root: &Path, name: &str, mut sink: impl Write) -> Result<BundleStats> {
    if !is_generation_name(name) {
        return Err(BundleError::InvalidName(name.to_string()).into());
    }
    let generation_dir = root.join(name);
    if !generation_dir.is_dir() {
        return Err(Error::NotADirectory(generation_dir));
    }

    let mut stats = BundleStats {
        generation: name.to_string(),
        ..Default::default()
    };

    let mut header = BytesMut::with_capacity(MAGIC.len() + 3 + name.len());
    header.put_slice(MAGIC);
    header.put_u8(VERSION);
    header.put_u16_le(name.len() as u16);
    header.put_slice(name.as_bytes());
    sink.write_all(&header).map_err(BundleError::from)?;

    for entry in WalkDir::new(&generation_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from).at(&generation_dir)?;
        let relative = entry
            .path()
            .strip_prefix(&generation_dir)
            .map(to_relative)
            .map_err(io::Error::other)
            .at(entry.path())?;

        let mut record = BytesMut::new();
        if entry.file_type().is_dir() {
            put_path(&mut record, TAG_DIR, &relative);
            sink.write_all(&record).map_err(BundleError::from)?;
            stats.dirs += 1;
        } else if entry.file_type().is_file() {
            let mut file = std::fs::File::open(entry.path()).at(entry.path())?;
            let len = file.metadata().at(entry.path())?.len();
            put_path(&mut record, TAG_FILE, &relative);
            record.put_u64_le(len);
            sink.write_all(&record).map_err(BundleError::from)?;
            let copied = io::copy(&mut (&mut file).take(len), &mut sink).at(entry.path())?;
            if copied != len {
                return Err(Error::Io {
                    path: entry.path().to_path_buf(),
                    source: io::Error::from(io::ErrorKind::UnexpectedEof),
                });
            }
            stats.files += 1;
            stats.bytes += len;
        } else {
            warn!(path = ?entry.path(), "Not bundling special file");
        }
    }

    sink.write_all(&[TAG_END]).map_err(BundleError::from)?;
    sink.flush().map_err(BundleError::from)?;

    debug!(?stats, "Wrote bundle");
    Ok(stats)
}

fn read_array<const N: usize>(source: &mut impl Read) -> Result<[u8; N], BundleError> {
    let mut buf = [0u8; N];
    source.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_string(source: &mut impl Read, len: usize) -> Result<String, BundleError> {
    // Untrusted length, no preallocation
    let mut buf = Vec::new();
    (&mut *source).take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(BundleError::Truncated);
    }
    String::from_utf8(buf).map_err(|err| {
        BundleError::UnsafePath(String::from_utf8_lossy(err.as_bytes()).into_owned())
    })
}

/// Read one bundle from `source` into a new generation under `root`.
///
/// The generation must not already exist. When it is the newest generation
/// under `root` its manifest becomes the root manifest, so the next backup
/// continues from it.
pub fn read_generation(
    mut source: impl Read,
    root: &Path,
    options: &Options,
) -> Result<BundleStats> {
    let ops = FsOps::new(options);

    if &read_array::<8>(&mut source)? != MAGIC {
        return Err(BundleError::BadMagic.into());
    }
    let [version] = read_array::<1>(&mut source)?;
    if version != VERSION {
        return Err(BundleError::UnsupportedVersion(version).into());
    }
    let name_len = u16::from_le_bytes(read_array(&mut source)?);
    let name = read_string(&mut source, name_len as usize)?;
    if !is_generation_name(&name) {
        return Err(BundleError::InvalidName(name).into());
    }

    ops.create_dir_all(root).at(root)?;
    // In dry-run the root may not exist yet
    let latest = if root.is_dir() {
        latest_generation(root)?
    } else {
        None
    };
    let newest = latest.is_none_or(|latest| latest < name);
    let generation_dir = root.join(&name);
    if generation_dir.exists() {
        return Err(BundleError::Exists(name).into());
    }

    // Unpacked into a staging directory, renamed into place once complete
    let staging = if ops.is_dry_run() {
        None
    } else {
        Some(
            tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempdir_in(root)
                .at(root)?,
        )
    };
    let unpack_dir = staging
        .as_ref()
        .map_or(generation_dir.as_path(), |staging| staging.path());
    info!(generation = %name, dry_run = ops.is_dry_run(), "Receiving generation");

    let mut stats = BundleStats {
        generation: name.clone(),
        ..Default::default()
    };
    let mut manifest_data = None;

    loop {
        let [tag] = read_array::<1>(&mut source)?;
        if tag == TAG_END {
            break;
        }
        if tag != TAG_DIR && tag != TAG_FILE {
            return Err(BundleError::UnknownTag(tag).into());
        }

        let path_len = u32::from_le_bytes(read_array(&mut source)?);
        let relative = read_string(&mut source, path_len as usize)?;
        if !is_safe_relative(&relative) {
            return Err(BundleError::UnsafePath(relative).into());
        }
        let target = relative_path(unpack_dir, &relative);

        if tag == TAG_DIR {
            ops.create_dir_all(&target).at(&target)?;
            stats.dirs += 1;
            continue;
        }

        let len = u64::from_le_bytes(read_array(&mut source)?);
        let mut data = Vec::new();
        (&mut source)
            .take(len)
            .read_to_end(&mut data)
            .map_err(BundleError::from)?;
        if data.len() as u64 != len {
            return Err(BundleError::Truncated.into());
        }

        ops.write(&target, &data).at(&target)?;
        stats.files += 1;
        stats.bytes += len;

        if relative == MANIFEST_NAME {
            manifest_data = Some(data);
        }
    }

    if let Some(staging) = &staging {
        if generation_dir.exists() {
            return Err(BundleError::Exists(name).into());
        }
        fs::rename(staging.path(), &generation_dir).at(&generation_dir)?;
        debug!(generation = %name, "Moved received generation into place");
    }

    match manifest_data {
        Some(data) if newest => {
            let (manifest, skipped) = Manifest::parse_bytes(&data);
            for err in &skipped {
                warn!(generation = %name, %err, "Skipping manifest line");
            }
            ops.write_manifest(&manifest, &root.join(MANIFEST_NAME))?;
            stats.installed_manifest = true;
        }
        Some(_) => debug!(generation = %name, "Older than the latest generation, keeping root manifest"),
        None => warn!(generation = %name, "Bundle carried no manifest"),
    }

    info!(
        generation = %name,
        files = stats.files,
        bytes = stats.bytes,
        "Received generation"
    );
    Ok(stats)
}
