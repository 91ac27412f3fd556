//! Hierarchical key/value namespace.
//!
//! Paths are slash-separated (`/config/db/primary`); empty components are
//! ignored, so `/a//b/` and `a/b` name the same node. Every node carries a
//! string value and a [`Stat`]:
//!
//! - `version` counts writes to the node's value (0 means "never written")
//! - `cversion` counts creations and deletions of direct children
//! - `num_children` is the current number of direct children
//!
//! Creating a deep path creates the missing intermediate nodes with
//! version 0. Such a node exists but has never been written, so a later
//! `Create` of it succeeds.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::codec::{decode, encode};
use crate::{KernelError, StateMachine};

// ============================================================================
// Commands and Replies
// ============================================================================

/// A command against the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeCommand {
    /// Creates a node, failing if it already holds data.
    Create { path: String, value: String },
    /// Deletes a childless node.
    Delete { path: String },
    /// Tests whether a node exists.
    Exists { path: String },
    /// Reads a node's value and stat.
    Get { path: String },
    /// Overwrites an existing node's value.
    Set { path: String, value: String },
    /// Lists a node's direct children in sorted order.
    Children { path: String },
    /// Reads a node's stat.
    Stat { path: String },
    /// Digest of the whole tree, for cross-replica comparison.
    Sha256,
}

impl TreeCommand {
    /// Returns true if this command never mutates the tree.
    pub fn is_read_only(&self) -> bool {
        !matches!(
            self,
            TreeCommand::Create { .. } | TreeCommand::Delete { .. } | TreeCommand::Set { .. }
        )
    }
}

/// Successful result of a [`TreeCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeOutput {
    Node(DataNode),
    Stat(Stat),
    Exists(bool),
    Children(Vec<String>),
    Hash(String),
}

/// Reply to a [`TreeCommand`] as carried back to the client.
pub type TreeReply = Result<TreeOutput, TreeError>;

/// Command-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TreeError {
    #[error("node {path} does not exist")]
    NotFound { path: String },

    #[error("node {path} already exists")]
    NodeExists { path: String },

    #[error("node {path} has children")]
    NotEmpty { path: String },

    #[error("invalid path {path:?}")]
    InvalidPath { path: String },

    #[error("malformed tree command")]
    Malformed,
}

// ============================================================================
// Nodes
// ============================================================================

/// Per-node bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub version: u64,
    pub cversion: u64,
    pub num_children: u64,
}

/// A node's value together with its stat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    pub value: String,
    pub stat: Stat,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TreeNode {
    value: String,
    stat: Stat,
    children: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    fn data(&self) -> DataNode {
        DataNode {
            value: self.value.clone(),
            stat: self.stat,
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

// ============================================================================
// Tree
// ============================================================================

/// The hierarchical namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    root: TreeNode,
}

impl Tree {
    /// Creates an empty tree containing only the root.
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, parts: &[&str]) -> Option<&TreeNode> {
        let mut node = &self.root;
        for part in parts {
            node = node.children.get(*part)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, parts: &[&str]) -> Option<&mut TreeNode> {
        let mut node = &mut self.root;
        for part in parts {
            node = node.children.get_mut(*part)?;
        }
        Some(node)
    }

    fn lookup(&self, path: &str) -> Result<&TreeNode, TreeError> {
        self.node(&split_path(path))
            .ok_or_else(|| TreeError::NotFound { path: path.into() })
    }

    /// Creates `path` with `value`, creating missing intermediate nodes.
    pub fn create(&mut self, path: &str, value: &str) -> Result<DataNode, TreeError> {
        let parts = split_path(path);
        if parts.is_empty() {
            return Err(TreeError::InvalidPath { path: path.into() });
        }
        if self.node(&parts).is_some_and(|n| n.stat.version != 0) {
            return Err(TreeError::NodeExists { path: path.into() });
        }

        let mut node = &mut self.root;
        for part in parts {
            if !node.children.contains_key(part) {
                node.stat.cversion += 1;
                node.stat.num_children += 1;
            }
            node = node.children.entry(part.to_string()).or_default();
        }
        node.value = value.to_string();
        node.stat.version += 1;
        Ok(node.data())
    }

    /// Deletes a childless node and returns its final stat.
    ///
    /// A node that still has children is refused with
    /// [`TreeError::NotEmpty`]; callers remove a subtree leaf first.
    pub fn delete(&mut self, path: &str) -> Result<Stat, TreeError> {
        let parts = split_path(path);
        let Some((name, parent_parts)) = parts.split_last() else {
            return Err(TreeError::InvalidPath { path: path.into() });
        };
        let not_found = || TreeError::NotFound { path: path.into() };

        let parent = self.node_mut(parent_parts).ok_or_else(not_found)?;
        let child = parent.children.get(*name).ok_or_else(not_found)?;
        if !child.children.is_empty() {
            return Err(TreeError::NotEmpty { path: path.into() });
        }
        let removed = parent.children.remove(*name).ok_or_else(not_found)?;
        parent.stat.cversion += 1;
        parent.stat.num_children -= 1;
        Ok(removed.stat)
    }

    /// Returns true if `path` names an existing node. The root always exists.
    pub fn exists(&self, path: &str) -> bool {
        self.node(&split_path(path)).is_some()
    }

    /// Reads a node.
    pub fn get(&self, path: &str) -> Result<DataNode, TreeError> {
        self.lookup(path).map(TreeNode::data)
    }

    /// Overwrites an existing node's value.
    pub fn set(&mut self, path: &str, value: &str) -> Result<DataNode, TreeError> {
        let node = self
            .node_mut(&split_path(path))
            .ok_or_else(|| TreeError::NotFound { path: path.into() })?;
        node.value = value.to_string();
        node.stat.version += 1;
        Ok(node.data())
    }

    /// Lists direct children in sorted order.
    pub fn children(&self, path: &str) -> Result<Vec<String>, TreeError> {
        self.lookup(path)
            .map(|node| node.children.keys().cloned().collect())
    }

    /// Reads a node's stat.
    pub fn stat(&self, path: &str) -> Result<Stat, TreeError> {
        self.lookup(path).map(|node| node.stat)
    }

    /// Hex SHA-256 over every node in sorted depth-first order.
    pub fn sha256(&self) -> String {
        fn visit(hasher: &mut Sha256, path: &str, node: &TreeNode) {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(node.value.as_bytes());
            hasher.update([0u8]);
            hasher.update(node.stat.version.to_le_bytes());
            for (name, child) in &node.children {
                visit(hasher, &format!("{path}/{name}"), child);
            }
        }

        let mut hasher = Sha256::new();
        visit(&mut hasher, "", &self.root);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Executes a command.
    pub fn execute(&mut self, command: &TreeCommand) -> TreeReply {
        match command {
            TreeCommand::Create { path, value } => self.create(path, value).map(TreeOutput::Node),
            TreeCommand::Delete { path } => self.delete(path).map(TreeOutput::Stat),
            TreeCommand::Set { path, value } => self.set(path, value).map(TreeOutput::Node),
            read => self.read(read),
        }
    }

    /// Executes a read-only command. Mutating commands are answered with
    /// [`TreeError::Malformed`].
    pub fn read(&self, command: &TreeCommand) -> TreeReply {
        match command {
            TreeCommand::Exists { path } => Ok(TreeOutput::Exists(self.exists(path))),
            TreeCommand::Get { path } => self.get(path).map(TreeOutput::Node),
            TreeCommand::Children { path } => self.children(path).map(TreeOutput::Children),
            TreeCommand::Stat { path } => self.stat(path).map(TreeOutput::Stat),
            TreeCommand::Sha256 => Ok(TreeOutput::Hash(self.sha256())),
            TreeCommand::Create { .. } | TreeCommand::Delete { .. } | TreeCommand::Set { .. } => {
                Err(TreeError::Malformed)
            }
        }
    }
}

impl StateMachine for Tree {
    fn apply(&mut self, command: &[u8]) -> Result<Bytes, KernelError> {
        let reply = match decode::<TreeCommand>(command) {
            Ok(cmd) => self.execute(&cmd),
            Err(_) => Err(TreeError::Malformed),
        };
        encode(&reply)
    }

    fn is_read_only(&self, command: &[u8]) -> bool {
        decode::<TreeCommand>(command).is_ok_and(|cmd| cmd.is_read_only())
    }

    fn query(&self, command: &[u8]) -> Result<Bytes, KernelError> {
        let reply = match decode::<TreeCommand>(command) {
            Ok(cmd) => self.read(&cmd),
            Err(_) => Err(TreeError::Malformed),
        };
        encode(&reply)
    }

    fn snapshot(&self) -> Result<Bytes, KernelError> {
        encode(self)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), KernelError> {
        *self = decode(snapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn create_then_get() {
        let mut tree = Tree::new();
        let node = tree.create("/dev/null", "empty").expect("create");
        assert_eq!(node.value, "empty");
        assert_eq!(node.stat.version, 1);

        let read = tree.get("/dev/null").expect("get");
        assert_eq!(read, node);
    }

    #[test]
    fn create_twice_fails() {
        let mut tree = Tree::new();
        tree.create("/a", "1").expect("create");
        assert_eq!(
            tree.create("/a", "2"),
            Err(TreeError::NodeExists { path: "/a".into() })
        );
        assert_eq!(tree.get("/a").expect("get").value, "1");
    }

    #[test]
    fn create_fills_intermediate_nodes() {
        let mut tree = Tree::new();
        tree.create("/a/b/c", "leaf").expect("create");

        let mid = tree.get("/a/b").expect("intermediate exists");
        assert_eq!(mid.stat.version, 0);
        assert_eq!(mid.stat.num_children, 1);

        // An intermediate node was never written, so it can still be created.
        let mid = tree.create("/a/b", "mid").expect("create intermediate");
        assert_eq!(mid.stat.version, 1);
        assert_eq!(mid.stat.num_children, 1);
    }

    #[test]
    fn delete_tracks_parent_stats() {
        let mut tree = Tree::new();
        tree.create("/p/x", "1").expect("create");
        tree.create("/p/y", "2").expect("create");
        let before = tree.stat("/p").expect("stat");
        assert_eq!(before.num_children, 2);
        assert_eq!(before.cversion, 2);

        tree.delete("/p/x").expect("delete");
        let after = tree.stat("/p").expect("stat");
        assert_eq!(after.num_children, 1);
        assert_eq!(after.cversion, 3);
        assert!(!tree.exists("/p/x"));
    }

    #[test]
    fn delete_refuses_non_empty() {
        let mut tree = Tree::new();
        tree.create("/p/x", "1").expect("create");
        assert_eq!(
            tree.delete("/p"),
            Err(TreeError::NotEmpty { path: "/p".into() })
        );
        assert!(tree.exists("/p/x"));

        tree.delete("/p/x").expect("delete leaf");
        tree.delete("/p").expect("delete emptied parent");
        assert!(!tree.exists("/p"));
    }

    #[test]
    fn set_requires_existing_node() {
        let mut tree = Tree::new();
        assert!(matches!(
            tree.set("/missing", "v"),
            Err(TreeError::NotFound { .. })
        ));
        tree.create("/k", "v1").expect("create");
        let node = tree.set("/k", "v2").expect("set");
        assert_eq!(node.value, "v2");
        assert_eq!(node.stat.version, 2);
    }

    #[test]
    fn children_are_sorted() {
        let mut tree = Tree::new();
        for name in ["zeta", "alpha", "mu"] {
            tree.create(&format!("/dir/{name}"), "").expect("create");
        }
        assert_eq!(
            tree.children("/dir").expect("children"),
            vec!["alpha", "mu", "zeta"]
        );
    }

    #[test_case("/a/b", "a/b" ; "leading slash optional")]
    #[test_case("/a/b", "/a//b/" ; "empty components ignored")]
    #[test_case("/", "" ; "root spellings")]
    fn equivalent_paths(left: &str, right: &str) {
        let mut tree = Tree::new();
        tree.create("/a/b", "v").expect("create");
        assert_eq!(tree.exists(left), tree.exists(right));
        assert_eq!(tree.stat(left), tree.stat(right));
    }

    #[test_case(TreeCommand::Sha256, true)]
    #[test_case(TreeCommand::Get { path: "/x".into() }, true)]
    #[test_case(TreeCommand::Children { path: "/".into() }, true)]
    #[test_case(TreeCommand::Set { path: "/x".into(), value: String::new() }, false)]
    #[test_case(TreeCommand::Delete { path: "/x".into() }, false)]
    fn read_only_classification(cmd: TreeCommand, expected: bool) {
        assert_eq!(cmd.is_read_only(), expected);
    }

    #[test]
    fn root_cannot_be_created_or_deleted() {
        let mut tree = Tree::new();
        assert!(matches!(tree.create("/", "x"), Err(TreeError::InvalidPath { .. })));
        assert!(matches!(tree.delete("/"), Err(TreeError::InvalidPath { .. })));
    }

    #[test]
    fn malformed_command_gets_error_reply() {
        let mut tree = Tree::new();
        let reply = tree.apply(&[0xff, 0x00, 0x13]).expect("apply");
        let reply: TreeReply = decode(&reply).expect("decode reply");
        assert_eq!(reply, Err(TreeError::Malformed));
    }

    #[test]
    fn snapshot_restores_identical_tree() {
        let mut tree = Tree::new();
        tree.create("/a/b", "1").expect("create");
        tree.create("/c", "2").expect("create");
        let bytes = tree.snapshot().expect("snapshot");

        let mut restored = Tree::new();
        restored.restore(&bytes).expect("restore");
        assert_eq!(restored, tree);
        assert_eq!(restored.sha256(), tree.sha256());
    }

    proptest! {
        #[test]
        fn same_commands_same_hash(values in proptest::collection::vec("[a-z]{1,6}", 1..20)) {
            let mut left = Tree::new();
            let mut right = Tree::new();
            for (i, v) in values.iter().enumerate() {
                let cmd = TreeCommand::Create { path: format!("/n{}/{v}", i % 3), value: v.clone() };
                let a = left.execute(&cmd);
                let b = right.execute(&cmd);
                prop_assert_eq!(a, b);
            }
            prop_assert_eq!(left.sha256(), right.sha256());
        }
    }
}
