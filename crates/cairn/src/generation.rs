//! Generation directories: naming, listing and artifact paths.
//!
//! A generation is named after its creation time, `YYYY-MM-DD-hh:mm:ss.mmm`
//! in local time. The format is fixed-width, so sorting names as strings
//! sorts generations chronologically.

use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, SystemTime},
};

use jiff::{Timestamp, Zoned, tz::TimeZone};
use tracing::debug;

use crate::config::ARTIFACT_EXTENSION;
use crate::error::{IoContext, Result};
use crate::fsops::FsOps;

/// Length of a generation name.
pub const NAME_LEN: usize = 23;

/// Format a time the way generation names and manifest times are written.
pub fn format_time(time: &Zoned) -> String {
    format!(
        "{}.{:03}",
        time.strftime("%Y-%m-%d-%H:%M:%S"),
        time.subsec_nanosecond() / 1_000_000
    )
}

/// Format a file modification time.
pub fn format_system_time(time: SystemTime) -> String {
    match Timestamp::try_from(time) {
        Ok(ts) => format_time(&ts.to_zoned(TimeZone::system())),
        // Outside jiff's range; clamp rather than fail the file
        Err(_) => format_time(&Timestamp::UNIX_EPOCH.to_zoned(TimeZone::UTC)),
    }
}

/// Whether `name` has the shape of a generation name.
pub fn is_generation_name(name: &str) -> bool {
    name.len() == NAME_LEN
        && name.bytes().enumerate().all(|(i, b)| match i {
            4 | 7 | 10 => b == b'-',
            13 | 16 => b == b':',
            19 => b == b'.',
            _ => b.is_ascii_digit(),
        })
}

/// Generation names under `root`, oldest first.
///
/// Only directories with a generation-shaped name are reported; the manifest
/// and anything else living in the root are ignored.
pub fn list_generations(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(root).at(root)? {
        let entry = entry.at(root)?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if is_generation_name(&name) && entry.path().is_dir() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// The most recent generation under `root`, if any.
pub fn latest_generation(root: &Path) -> Result<Option<String>> {
    Ok(list_generations(root)?.pop())
}

/// Create a new, uniquely named generation directory under `root`.
///
/// If the name for the current millisecond is taken, wait for the next one.
pub fn create_generation(root: &Path, ops: &FsOps) -> Result<(String, PathBuf)> {
    loop {
        let name = format_time(&Zoned::now());
        let path = root.join(&name);
        match ops.create_dir(&path) {
            Ok(()) => {
                debug!(?path, "Created generation directory");
                return Ok((name, path));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e).at(path),
        }
    }
}

/// Where the artifact for `relative` (a `/`-separated source path) lives.
pub fn artifact_path(generation_dir: &Path, relative: &str) -> PathBuf {
    let mut path = relative_path(generation_dir, relative);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ARTIFACT_EXTENSION);
    path.set_file_name(name);
    path
}

/// Where a `/`-separated relative path lives under `base`.
pub fn relative_path(base: &Path, relative: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in relative.split('/') {
        path.push(part);
    }
    path
}

/// Render a relative filesystem path in `/`-separated form.
pub fn to_relative(path: &Path) -> String {
    let parts: Vec<_> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    parts.join("/")
}

/// Whether a `/`-separated relative path stays below the directory it is
/// joined to.
pub fn is_safe_relative(relative: &str) -> bool {
    !relative.is_empty()
        && !relative.contains('\0')
        && relative
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}
