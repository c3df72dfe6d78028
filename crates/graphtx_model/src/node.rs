//! Node storage.

use crate::value::Value;
use std::collections::HashMap;

/// A single node in the model.
///
/// A node carries two kinds of features, addressed by name:
/// - single-valued attributes (`set`/`unset`)
/// - multi-valued lists with stable positions (`insert`/`remove` at an index)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Node {
    /// Single-valued features.
    pub(crate) attrs: HashMap<String, Value>,
    /// Multi-valued features with positional semantics.
    pub(crate) lists: HashMap<String, Vec<Value>>,
}

impl Node {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            attrs: self.attrs.clone(),
            lists: self.lists.clone(),
        }
    }

    pub(crate) fn from_snapshot(snapshot: &NodeSnapshot) -> Self {
        Self {
            attrs: snapshot.attrs.clone(),
            lists: snapshot.lists.clone(),
        }
    }
}

/// An immutable copy of a node's full state.
///
/// Snapshots are taken when a node is removed so that the removal can be
/// reversed exactly: restoring from a snapshot reproduces every attribute and
/// every list position bit-for-bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// Single-valued features at snapshot time.
    pub attrs: HashMap<String, Value>,
    /// Multi-valued features at snapshot time.
    pub lists: HashMap<String, Vec<Value>>,
}

impl NodeSnapshot {
    /// Creates an empty snapshot (a freshly created node).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            attrs: HashMap::new(),
            lists: HashMap::new(),
        }
    }

    /// Returns true if the snapshot carries no feature data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty() && self.lists.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_roundtrip() {
        let mut node = Node::new();
        node.attrs.insert("name".to_string(), Value::from("a"));
        node.lists
            .insert("children".to_string(), vec![Value::Int(1), Value::Int(2)]);

        let snapshot = node.snapshot();
        let restored = Node::from_snapshot(&snapshot);
        assert_eq!(node, restored);
    }

    #[test]
    fn empty_snapshot() {
        assert!(NodeSnapshot::empty().is_empty());
        assert!(Node::new().snapshot().is_empty());
    }
}
