//! Locating the real payload inside an unpacked archive.
//!
//! Uploaded bundles frequently unpack into a single wrapper folder (or a chain
//! of them). The control script has to sit next to the actual content.

use crate::error::JobError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Descends from `root` while the current directory holds exactly one entry
/// and that entry is a real directory. Symlinks stop the descent.
pub fn locate_payload_root(root: &Path) -> Result<PathBuf, JobError> {
    let mut current = root.to_path_buf();
    loop {
        let mut entries = fs::read_dir(&current).map_err(|err| JobError::filesystem(&current, err))?;
        let first = match entries.next() {
            Some(entry) => entry.map_err(|err| JobError::filesystem(&current, err))?,
            None => break,
        };
        if entries.next().is_some() {
            break;
        }

        let path = first.path();
        // Entry type without following symlinks: a link is never descended.
        let is_dir = first
            .file_type()
            .map_err(|err| JobError::filesystem(&path, err))?
            .is_dir();
        if !is_dir {
            break;
        }
        current = path;
    }

    debug!(
        root = %root.display(),
        payload_root = %current.display(),
        "Located payload root"
    );
    Ok(current)
}

/// Copies the control script into `payload_root`, keeping its permission
/// bits. Returns the destination path.
pub fn place_control_script(script: &Path, payload_root: &Path) -> Result<PathBuf, JobError> {
    let name = script.file_name().ok_or_else(|| {
        JobError::filesystem(
            script,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "script path has no file name"),
        )
    })?;
    let destination = payload_root.join(name);
    fs::copy(script, &destination).map_err(|err| JobError::filesystem(&destination, err))?;
    Ok(destination)
}
