//! Filesystem snapshots.

use crate::tree::{FileNode, FileTree, NodeId, TreeBuilder, TreeError};
use std::fs;
use std::path::Path;
use tracing::{debug, instrument};

/// Captures the current state of `path` and, for a directory, everything
/// below it.
///
/// Symlinks are followed. Any entry that cannot be stat'ed or listed fails the
/// whole snapshot.
#[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
pub fn snapshot(path: impl AsRef<Path>) -> Result<FileTree, TreeError> {
    let path = path.as_ref();
    let root = stat(path)?;
    let is_dir = root.is_dir;
    let mut builder = TreeBuilder::new(root);
    if is_dir {
        let root = builder.root();
        fill(&mut builder, root, path)?;
    }
    let tree = builder.build();
    debug!(entries = tree.len(), "snapshot taken");
    Ok(tree)
}

fn fill(builder: &mut TreeBuilder, parent: NodeId, dir: &Path) -> Result<(), TreeError> {
    let entries = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let child_path = entry.path();
        let node = stat(&child_path)?;
        let is_dir = node.is_dir;
        let id = builder.insert(parent, node)?;
        if is_dir {
            fill(builder, id, &child_path)?;
        }
    }
    Ok(())
}

fn stat(path: &Path) -> Result<FileNode, TreeError> {
    let meta = fs::metadata(path).map_err(|source| io_error(path, source))?;
    let modified = meta
        .modified()
        .map_err(|source| io_error(path, source))?;
    let name = base_name(path);
    Ok(if meta.is_dir() {
        FileNode::directory(name, modified)
    } else {
        FileNode::file(name, modified, meta.len())
    })
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn io_error(path: &Path, source: std::io::Error) -> TreeError {
    TreeError::Io {
        path: path.to_path_buf(),
        source,
    }
}
