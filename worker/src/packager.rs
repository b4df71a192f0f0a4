//! Materializes a diff tree into a staging directory and archives it.

use crate::archive::select_pack;
use crate::error::JobError;
use fstree::{FileTree, NodeId};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Copies every entry of `diff` from `source_root` into
/// `staging/<diff root name>` and packs that directory into
/// `staging/<archive_name>`.
///
/// `diff` must be rooted at `source_root`. The staging directory is wiped
/// first.
pub fn package(
    source_root: &Path,
    diff: &FileTree,
    staging: &Path,
    archive_name: &str,
) -> Result<PathBuf, JobError> {
    let root_name = diff.root().name.clone();
    let pack = select_pack(archive_name, &root_name, staging).ok_or_else(|| {
        JobError::UnsupportedFormat {
            filename: archive_name.to_string(),
        }
    })?;

    reset_staging(staging)?;
    copy_node(diff, diff.root_id(), source_root, &staging.join(&root_name))?;
    pack.run()?;

    let archive = staging.join(archive_name);
    info!(
        archive = %archive.display(),
        files = diff.file_count(),
        entries = diff.len(),
        "Packaged changed files"
    );
    Ok(archive)
}

fn reset_staging(staging: &Path) -> Result<(), JobError> {
    match fs::remove_dir_all(staging) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(JobError::filesystem(staging, err)),
    }
    fs::create_dir_all(staging).map_err(|err| JobError::filesystem(staging, err))
}

fn copy_node(tree: &FileTree, id: NodeId, from: &Path, to: &Path) -> Result<(), JobError> {
    if !tree.node(id).is_dir {
        // Same view as the snapshot: symlinks are followed. Opening a FIFO or
        // device for reading can block forever, so only regular files are copied.
        let file_type = fs::metadata(from)
            .map_err(|err| JobError::filesystem(from, err))?
            .file_type();
        if !file_type.is_file() {
            warn!(path = %from.display(), "Skipping special file");
            return Ok(());
        }
        // fs::copy carries the permission bits over.
        fs::copy(from, to).map_err(|err| JobError::filesystem(from, err))?;
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    builder.mode(0o755);
    builder
        .create(to)
        .map_err(|err| JobError::filesystem(to, err))?;

    for (name, child) in tree.children(id) {
        copy_node(tree, child, &from.join(name), &to.join(name))?;
    }
    Ok(())
}
