//! Per-job sandbox directory layout.

use crate::error::JobError;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::debug;

const SRC_DIR: &str = "src";
const RUN_DIR: &str = "run";
const OUT_DIR: &str = "out";

/// Directory tree owned by one pipeline:
///
/// ```text
/// <root>/
///   src/   retrieved inputs
///   run/   execution sandbox
///   out/   packaging staging area
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join(SRC_DIR)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(RUN_DIR)
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join(OUT_DIR)
    }

    /// Wipes whatever the previous job left and recreates an empty layout with
    /// owner-only permissions.
    pub fn prepare(&self) -> Result<(), JobError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(JobError::filesystem(&self.root, err)),
        }

        create_private_dir(&self.root, true)?;
        for dir in [self.src_dir(), self.run_dir(), self.out_dir()] {
            create_private_dir(&dir, false)?;
        }

        debug!(root = %self.root.display(), "Workspace prepared");
        Ok(())
    }
}

fn create_private_dir(path: &Path, recursive: bool) -> Result<(), JobError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(recursive);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(path)
        .map_err(|err| JobError::filesystem(path, err))
}
