//! The backup log: one line per tracked file of the latest generation.
//!
//! Each line is `generation/relative_path;modified_time;digest_hex`. The
//! generation prefix records which generation wrote the entry; identity across
//! generations is the relative path alone.

use std::{
    collections::HashMap,
    fs, io,
    path::Path,
};

use tracing::{debug, warn};

use crate::digest::Digest;
use crate::fsops::atomic_write;

const DELIMITER: char = ';';

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Name of the generation that recorded this entry.
    pub generation: String,
    /// Path relative to the source root, `/`-separated.
    pub path: String,
    /// Modification time, `YYYY-MM-DD-hh:mm:ss.mmm`.
    pub modified: String,
    /// Digest of the whole file.
    pub digest: Digest,
}

impl Entry {
    /// The path as stored on disk, prefixed with the generation.
    pub fn stored_path(&self) -> String {
        format!("{}/{}", self.generation, self.path)
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}{DELIMITER}{}{DELIMITER}{}",
            self.stored_path(),
            self.modified,
            self.digest.as_hex()
        )
    }

    /// Parse one line (without its newline).
    ///
    /// Fields are split from the right, so a path may itself contain the delimiter.
    pub fn parse_line(line: &str) -> Result<Self, &'static str> {
        let mut fields = line.rsplitn(3, DELIMITER);
        let digest = fields.next().ok_or("missing digest")?;
        let modified = fields.next().ok_or("expected three fields")?;
        let stored_path = fields.next().ok_or("expected three fields")?;

        let digest: Digest = digest.trim().parse().map_err(|_| "invalid digest")?;
        if modified.is_empty() {
            return Err("empty modification time");
        }
        let (generation, path) = stored_path
            .split_once('/')
            .ok_or("path has no generation prefix")?;
        if generation.is_empty() || path.is_empty() {
            return Err("empty path");
        }

        Ok(Self {
            generation: generation.to_string(),
            path: path.to_string(),
            modified: modified.to_string(),
            digest,
        })
    }
}

/// Ordered entries with an index by relative path.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<Entry>,
    by_path: HashMap<String, usize>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.by_path.get(path).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    /// Append an entry, replacing in place any entry with the same path.
    pub fn push(&mut self, entry: Entry) {
        match self.by_path.get(&entry.path) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.by_path.insert(entry.path.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Remove the entry for `path`, keeping the order of the rest.
    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        let i = self.by_path.remove(path)?;
        let entry = self.entries.remove(i);
        for pos in self.by_path.values_mut() {
            if *pos > i {
                *pos -= 1;
            }
        }
        Some(entry)
    }

    /// The generation this manifest describes: the newest generation any
    /// entry was recorded by.
    pub fn generation(&self) -> Option<&str> {
        self.entries.iter().map(|e| e.generation.as_str()).max()
    }

    /// Entries recorded by the given generation.
    pub fn for_generation<'a>(&'a self, generation: &'a str) -> impl Iterator<Item = &'a Entry> {
        self.entries.iter().filter(move |e| e.generation == generation)
    }

    /// Parse manifest text.
    ///
    /// Malformed lines are skipped and returned alongside the entries parsed
    /// from the other lines. Blank lines are ignored.
    pub fn parse(text: &str) -> (Self, Vec<ManifestError>) {
        Self::parse_bytes(text.as_bytes())
    }

    /// Parse raw manifest bytes line by line.
    ///
    /// A line that is not valid UTF-8 is reported as malformed like any other
    /// bad line.
    pub fn parse_bytes(data: &[u8]) -> (Self, Vec<ManifestError>) {
        let mut manifest = Self::new();
        let mut errors = Vec::new();

        for (i, raw) in data.split(|&b| b == b'\n').enumerate() {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line,
                Err(_) => {
                    errors.push(ManifestError::Malformed {
                        line: i + 1,
                        reason: "invalid UTF-8",
                    });
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Entry::parse_line(line) {
                Ok(entry) => manifest.push(entry),
                Err(reason) => errors.push(ManifestError::Malformed { line: i + 1, reason }),
            }
        }

        (manifest, errors)
    }

    /// Read a manifest file, logging and skipping malformed lines.
    pub fn read(path: &Path) -> Result<Self, ManifestError> {
        let data = fs::read(path)?;
        let (manifest, errors) = Self::parse_bytes(&data);
        for err in &errors {
            warn!(?path, %err, "Skipping malformed manifest line");
        }
        debug!(?path, entries = manifest.len(), "Read manifest");
        Ok(manifest)
    }

    /// Read a manifest file if it exists.
    pub fn read_optional(path: &Path) -> Result<Option<Self>, ManifestError> {
        match Self::read(path) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(ManifestError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str(&entry.to_line());
            text.push('\n');
        }
        text
    }

    /// Write the manifest, replacing `path` only once the new content is
    /// complete on disk.
    pub fn write(&self, path: &Path) -> Result<(), ManifestError> {
        atomic_write(path, self.to_text().as_bytes())?;
        debug!(?path, entries = self.len(), "Wrote manifest");
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
