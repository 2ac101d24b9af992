//! Cairn - incremental deduplicating backups
//!
//! Each backup run produces a timestamped generation: a mirror of the source
//! tree where every file is replaced by a `.dedup` artifact holding its
//! fixed-size chunks, with repeated chunks stored as references to their
//! first occurrence. Unchanged files are hard-linked from the previous
//! generation, and a manifest records the digest of every tracked file.

pub mod backup;
pub mod bundle;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod digest;
pub mod error;
pub mod fsops;
pub mod generation;
pub mod manifest;
pub mod restore;
pub mod transport;
pub mod walk;

pub use backup::{BackupStats, create_backup};
pub use bundle::{BundleError, BundleStats, read_generation, write_generation};
pub use chunk::{CHUNK_SIZE, Chunk, Chunker, DigestIndex, Payload, chunk_stream, concat};
pub use codec::{CodecError, EncodeStats, decode, decode_into, encode};
pub use config::{MANIFEST_NAME, Options};
pub use digest::{DIGEST_LEN, Digest};
pub use error::{Error, Result};
pub use fsops::FsOps;
pub use generation::{latest_generation, list_generations};
pub use manifest::{Entry, Manifest, ManifestError};
pub use restore::{RestoreStats, restore_backup};
