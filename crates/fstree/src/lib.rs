//! # fstree
//!
//! Point-in-time snapshots of a directory tree and an additions-only diff
//! between two snapshots of the same root.
//!
//! A [`FileTree`] is an arena of [`FileNode`]s addressed by [`NodeId`]. The root
//! always lives at index 0 and every link points from a parent to its children,
//! so trees are plain values that can be cloned, compared and serialized.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use fstree::{diff, snapshot};
//!
//! let before = snapshot("/srv/job/run")?;
//! // ... something writes into /srv/job/run ...
//! let after = snapshot("/srv/job/run")?;
//!
//! if let Some(changes) = diff(&before, &after) {
//!     for (path, node) in changes.walk() {
//!         println!("{} ({} bytes)", path.display(), node.size);
//!     }
//! }
//! # Ok::<(), fstree::TreeError>(())
//! ```
//!
//! Only modification time and size are compared. File contents are never read,
//! and entries that disappear between snapshots are not reported.

pub mod diff;
pub mod snapshot;
pub mod tree;

pub use diff::{diff, merge};
pub use snapshot::snapshot;
pub use tree::{FileNode, FileTree, NodeId, TreeBuilder, TreeError};
