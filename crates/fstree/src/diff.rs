//! Additions-only comparison of two snapshots.

use crate::tree::{FileNode, FileTree, NodeId};
use std::collections::BTreeMap;

/// Returns the subtree of `after` that was added or modified relative to
/// `before`, or `None` when nothing changed.
///
/// Both trees must describe the same root. A change of entry kind reports the
/// whole `after` subtree. Files compare by modification time and size only.
/// Entries present only in `before` are never reported.
pub fn diff(before: &FileTree, after: &FileTree) -> Option<FileTree> {
    let mut out = Vec::new();
    diff_node(before, before.root_id(), after, after.root_id(), &mut out)
        .map(|_| FileTree::from_nodes(out))
}

fn diff_node(
    before: &FileTree,
    before_id: NodeId,
    after: &FileTree,
    after_id: NodeId,
    out: &mut Vec<FileNode>,
) -> Option<NodeId> {
    let old = before.node(before_id);
    let new = after.node(after_id);

    if old.is_dir != new.is_dir {
        return Some(graft(after, after_id, out));
    }

    if !new.is_dir {
        let changed = old.modified != new.modified || old.size != new.size;
        return changed.then(|| graft(after, after_id, out));
    }

    // Reserve the directory slot first so the root of the result lands at 0.
    let slot = out.len();
    out.push(new.detached());

    let mut changed = BTreeMap::new();
    for (name, after_child) in after.children(after_id) {
        let child_diff = match before.child(before_id, name) {
            Some(before_child) => diff_node(before, before_child, after, after_child, out),
            None => Some(graft(after, after_child, out)),
        };
        if let Some(id) = child_diff {
            changed.insert(name.to_string(), id);
        }
    }

    if changed.is_empty() {
        out.truncate(slot);
        return None;
    }

    out[slot].set_children(changed);
    Some(NodeId::from_index(slot))
}

/// Copies the subtree rooted at `id` into `out`, parent before children.
fn graft(tree: &FileTree, id: NodeId, out: &mut Vec<FileNode>) -> NodeId {
    let slot = out.len();
    out.push(tree.node(id).detached());

    let children: BTreeMap<String, NodeId> = tree
        .children(id)
        .map(|(name, child)| (name.to_string(), graft(tree, child, out)))
        .collect();
    out[slot].set_children(children);
    NodeId::from_index(slot)
}

/// Overlays `changes` (typically the output of [`diff`]) on top of `base`.
///
/// Entries in `changes` replace their counterparts in `base`; everything else
/// in `base` is kept. Diffing the result against the snapshot that produced
/// `changes` yields `None`.
pub fn merge(base: &FileTree, changes: &FileTree) -> FileTree {
    let mut out = Vec::new();
    merge_node(base, base.root_id(), changes, changes.root_id(), &mut out);
    FileTree::from_nodes(out)
}

fn merge_node(
    base: &FileTree,
    base_id: NodeId,
    changes: &FileTree,
    change_id: NodeId,
    out: &mut Vec<FileNode>,
) -> NodeId {
    let old = base.node(base_id);
    let new = changes.node(change_id);

    if !new.is_dir || !old.is_dir {
        return graft(changes, change_id, out);
    }

    let slot = out.len();
    out.push(new.detached());

    let mut children = BTreeMap::new();
    for (name, base_child) in base.children(base_id) {
        let id = match changes.child(change_id, name) {
            Some(change_child) => merge_node(base, base_child, changes, change_child, out),
            None => graft(base, base_child, out),
        };
        children.insert(name.to_string(), id);
    }
    for (name, change_child) in changes.children(change_id) {
        if base.child(base_id, name).is_none() {
            children.insert(name.to_string(), graft(changes, change_child, out));
        }
    }

    out[slot].set_children(children);
    NodeId::from_index(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeBuilder;
    use std::time::{Duration, SystemTime};

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    /// run/
    ///   input.txt (10)
    ///   lib/
    ///     helper.py (100)
    ///   job.sh (40)
    fn before() -> FileTree {
        let mut b = TreeBuilder::new(FileNode::directory("run", at(1)));
        let root = b.root();
        b.insert(root, FileNode::file("input.txt", at(1), 10)).unwrap();
        let lib = b.insert(root, FileNode::directory("lib", at(1))).unwrap();
        b.insert(lib, FileNode::file("helper.py", at(1), 100)).unwrap();
        b.insert(root, FileNode::file("job.sh", at(1), 40)).unwrap();
        b.build()
    }

    #[test]
    fn test_identical_trees_have_no_diff() {
        assert!(diff(&before(), &before()).is_none());
    }

    #[test]
    fn test_modified_and_added_files_are_reported() {
        let mut b = TreeBuilder::new(FileNode::directory("run", at(5)));
        let root = b.root();
        b.insert(root, FileNode::file("input.txt", at(5), 20)).unwrap();
        let lib = b.insert(root, FileNode::directory("lib", at(1))).unwrap();
        b.insert(lib, FileNode::file("helper.py", at(1), 100)).unwrap();
        b.insert(root, FileNode::file("job.sh", at(1), 40)).unwrap();
        b.insert(root, FileNode::file("output.txt", at(5), 5)).unwrap();
        let after = b.build();

        let changes = diff(&before(), &after).expect("changes");
        let paths: Vec<String> = changes
            .walk()
            .into_iter()
            .map(|(path, _)| path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(paths, vec!["", "input.txt", "output.txt"]);
        assert_eq!(changes.find("input.txt").unwrap().size, 20);
        assert_eq!(changes.find("output.txt").unwrap().size, 5);
        assert_eq!(changes.root().name, "run");
    }

    #[test]
    fn test_mtime_only_change_is_reported() {
        let mut b = TreeBuilder::new(FileNode::directory("run", at(1)));
        let root = b.root();
        b.insert(root, FileNode::file("input.txt", at(9), 10)).unwrap();
        let lib = b.insert(root, FileNode::directory("lib", at(1))).unwrap();
        b.insert(lib, FileNode::file("helper.py", at(1), 100)).unwrap();
        b.insert(root, FileNode::file("job.sh", at(1), 40)).unwrap();

        let changes = diff(&before(), &b.build()).expect("changes");
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.find("input.txt").unwrap().modified, at(9));
    }

    #[test]
    fn test_deletions_are_not_reported() {
        let mut b = TreeBuilder::new(FileNode::directory("run", at(1)));
        let root = b.root();
        let lib = b.insert(root, FileNode::directory("lib", at(1))).unwrap();
        b.insert(lib, FileNode::file("helper.py", at(1), 100)).unwrap();
        b.insert(root, FileNode::file("job.sh", at(1), 40)).unwrap();

        assert!(diff(&before(), &b.build()).is_none());
    }

    #[test]
    fn test_nested_addition_keeps_only_changed_path() {
        let mut b = TreeBuilder::new(FileNode::directory("run", at(1)));
        let root = b.root();
        b.insert(root, FileNode::file("input.txt", at(1), 10)).unwrap();
        let lib = b.insert(root, FileNode::directory("lib", at(2))).unwrap();
        b.insert(lib, FileNode::file("helper.py", at(1), 100)).unwrap();
        b.insert(lib, FileNode::file("helper.pyc", at(2), 80)).unwrap();
        b.insert(root, FileNode::file("job.sh", at(1), 40)).unwrap();

        let changes = diff(&before(), &b.build()).expect("changes");
        assert!(changes.find("lib/helper.pyc").is_some());
        assert!(changes.find("lib/helper.py").is_none());
        assert!(changes.find("input.txt").is_none());
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_new_directory_is_reported_in_full() {
        let mut b = TreeBuilder::new(FileNode::directory("run", at(1)));
        let root = b.root();
        b.insert(root, FileNode::file("input.txt", at(1), 10)).unwrap();
        let lib = b.insert(root, FileNode::directory("lib", at(1))).unwrap();
        b.insert(lib, FileNode::file("helper.py", at(1), 100)).unwrap();
        b.insert(root, FileNode::file("job.sh", at(1), 40)).unwrap();
        let results = b.insert(root, FileNode::directory("results", at(3))).unwrap();
        let plots = b.insert(results, FileNode::directory("plots", at(3))).unwrap();
        b.insert(plots, FileNode::file("a.png", at(3), 512)).unwrap();
        b.insert(results, FileNode::directory("empty", at(3))).unwrap();

        let changes = diff(&before(), &b.build()).expect("changes");
        assert_eq!(changes.find("results/plots/a.png").unwrap().size, 512);
        assert!(changes.find("results/empty").unwrap().is_dir);
    }

    #[test]
    fn test_kind_flip_reports_after_subtree() {
        let mut b = TreeBuilder::new(FileNode::directory("run", at(1)));
        let root = b.root();
        let input = b.insert(root, FileNode::directory("input.txt", at(4))).unwrap();
        b.insert(input, FileNode::file("part-0", at(4), 1)).unwrap();
        let lib = b.insert(root, FileNode::directory("lib", at(1))).unwrap();
        b.insert(lib, FileNode::file("helper.py", at(1), 100)).unwrap();
        b.insert(root, FileNode::file("job.sh", at(1), 40)).unwrap();

        let changes = diff(&before(), &b.build()).expect("changes");
        assert!(changes.find("input.txt").unwrap().is_dir);
        assert!(changes.find("input.txt/part-0").is_some());
    }

    #[test]
    fn test_root_kind_flip_returns_whole_after() {
        let after = TreeBuilder::new(FileNode::file("run", at(1), 3)).build();
        let changes = diff(&before(), &after).expect("changes");
        assert_eq!(changes, after);
    }

    #[test]
    fn test_merge_then_rediff_is_clean() {
        let mut b = TreeBuilder::new(FileNode::directory("run", at(5)));
        let root = b.root();
        b.insert(root, FileNode::file("input.txt", at(5), 20)).unwrap();
        let lib = b.insert(root, FileNode::directory("lib", at(6))).unwrap();
        b.insert(lib, FileNode::file("helper.pyc", at(6), 80)).unwrap();
        b.insert(root, FileNode::file("job.sh", at(1), 40)).unwrap();
        let out = b.insert(root, FileNode::directory("out", at(6))).unwrap();
        b.insert(out, FileNode::file("result.bin", at(6), 4096)).unwrap();
        let after = b.build();

        let base = before();
        let changes = diff(&base, &after).expect("changes");
        let merged = merge(&base, &changes);

        assert!(diff(&merged, &after).is_none());
        // Deleted entries survive the merge; the diff never removes anything.
        assert!(merged.find("lib/helper.py").is_some());
    }
}
