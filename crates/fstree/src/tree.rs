//! Arena representation of a directory tree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot add '{child}' under '{parent}': parent is not a directory")]
    NotADirectory { parent: String, child: String },

    #[error("malformed tree: {message}")]
    Malformed { message: String },
}

/// Index of a node inside its owning [`FileTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub(crate) fn from_index(index: usize) -> Self {
        NodeId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// One filesystem entry as it looked when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub is_dir: bool,
    pub modified: SystemTime,
    /// Size in bytes. Carries no meaning for directories.
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    children: BTreeMap<String, NodeId>,
}

impl FileNode {
    pub fn file(name: impl Into<String>, modified: SystemTime, size: u64) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            modified,
            size,
            children: BTreeMap::new(),
        }
    }

    pub fn directory(name: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            modified,
            size: 0,
            children: BTreeMap::new(),
        }
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Same entry metadata, no children.
    pub(crate) fn detached(&self) -> Self {
        Self {
            name: self.name.clone(),
            is_dir: self.is_dir,
            modified: self.modified,
            size: self.size,
            children: BTreeMap::new(),
        }
    }

    pub(crate) fn set_children(&mut self, children: BTreeMap<String, NodeId>) {
        debug_assert!(self.is_dir || children.is_empty());
        self.children = children;
    }
}

/// Immutable snapshot of a directory tree. Root is [`NodeId::ROOT`].
///
/// Deserialized trees are checked to have the same shape `TreeBuilder`
/// produces: a non-empty arena where every node except the root has exactly
/// one parent, is reachable from the root, and only directories have children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTree")]
pub struct FileTree {
    nodes: Vec<FileNode>,
}

#[derive(Deserialize)]
struct RawTree {
    nodes: Vec<FileNode>,
}

impl TryFrom<RawTree> for FileTree {
    type Error = TreeError;

    fn try_from(raw: RawTree) -> Result<Self, Self::Error> {
        let malformed = |message: String| TreeError::Malformed { message };
        let nodes = raw.nodes;
        if nodes.is_empty() {
            return Err(malformed("tree has no root".to_string()));
        }

        let mut parents = vec![0usize; nodes.len()];
        for (index, node) in nodes.iter().enumerate() {
            if !node.is_dir && node.has_children() {
                return Err(malformed(format!("file '{}' has children", node.name)));
            }
            for (name, child) in &node.children {
                let Some(target) = nodes.get(child.0) else {
                    return Err(malformed(format!(
                        "child '{}' of node {} points outside the tree",
                        name, index
                    )));
                };
                if child.0 == 0 {
                    return Err(malformed(format!("node {} lists the root as a child", index)));
                }
                if &target.name != name {
                    return Err(malformed(format!(
                        "child key '{}' does not match node name '{}'",
                        name, target.name
                    )));
                }
                parents[child.0] += 1;
            }
        }
        if let Some(index) = parents.iter().skip(1).position(|&count| count != 1) {
            return Err(malformed(format!(
                "node {} has {} parents",
                index + 1,
                parents[index + 1]
            )));
        }

        // One parent each does not rule out detached cycles; everything must
        // hang off the root.
        let mut reached = 0;
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            reached += 1;
            stack.extend(nodes[index].children.values().map(|child| child.0));
        }
        if reached != nodes.len() {
            return Err(malformed(format!(
                "{} nodes are not reachable from the root",
                nodes.len() - reached
            )));
        }

        Ok(FileTree { nodes })
    }
}

impl FileTree {
    pub(crate) fn from_nodes(nodes: Vec<FileNode>) -> Self {
        debug_assert!(!nodes.is_empty());
        Self { nodes }
    }

    pub fn root_id(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn root(&self) -> &FileNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> &FileNode {
        &self.nodes[id.0]
    }

    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.node(id).children.get(name).copied()
    }

    /// Children of `id` in name order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.node(id)
            .children
            .iter()
            .map(|(name, child)| (name.as_str(), *child))
    }

    /// Number of entries in the tree, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of non-directory entries.
    pub fn file_count(&self) -> usize {
        self.nodes.iter().filter(|node| !node.is_dir).count()
    }

    /// Looks up an entry by its path relative to the root.
    pub fn find(&self, relative: impl AsRef<Path>) -> Option<&FileNode> {
        let mut current = self.root_id();
        for component in relative.as_ref().components() {
            let name = component.as_os_str().to_str()?;
            current = self.child(current, name)?;
        }
        Some(self.node(current))
    }

    /// Pre-order traversal yielding each entry with its path relative to the
    /// root. The root itself is yielded first with an empty path.
    pub fn walk(&self) -> Vec<(PathBuf, &FileNode)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(PathBuf::new(), self.root_id())];
        while let Some((path, id)) = stack.pop() {
            let node = self.node(id);
            // Reverse so that name order survives the stack.
            for (name, child) in node.children.iter().rev() {
                stack.push((path.join(name), *child));
            }
            out.push((path, node));
        }
        out
    }
}

/// Incremental construction of a [`FileTree`].
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    nodes: Vec<FileNode>,
}

impl TreeBuilder {
    pub fn new(root: FileNode) -> Self {
        Self {
            nodes: vec![root.detached()],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Adds `node` as a child of `parent`. Replaces any existing child with
    /// the same name. Files cannot have children.
    pub fn insert(&mut self, parent: NodeId, node: FileNode) -> Result<NodeId, TreeError> {
        let parent_node = &self.nodes[parent.0];
        if !parent_node.is_dir {
            return Err(TreeError::NotADirectory {
                parent: parent_node.name.clone(),
                child: node.name,
            });
        }

        let id = NodeId(self.nodes.len());
        let name = node.name.clone();
        self.nodes.push(node.detached());
        self.nodes[parent.0].children.insert(name, id);
        Ok(id)
    }

    pub fn build(self) -> FileTree {
        FileTree::from_nodes(self.nodes)
    }
}
