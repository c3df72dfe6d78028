//! Mutation notifications and the edit gate.
//!
//! Every mutation the model applies is described by one [`Mutation`] record
//! and delivered synchronously, on the mutating thread, to all registered
//! observers. The engine registers an observer to capture changes into the
//! active transaction's recorder, and installs an [`EditGate`] to refuse
//! mutations from threads that do not hold write access.

use crate::id::NodeId;
use crate::node::NodeSnapshot;
use crate::value::Value;

/// Describes one applied (or, for the gate, proposed) mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// The affected node.
    pub node: NodeId,
    /// What happened to it.
    pub kind: MutationKind,
}

/// The kind of a mutation, carrying enough detail to describe and reverse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    /// A node was created (empty).
    NodeCreated,
    /// A node was removed; the snapshot holds its full prior state.
    NodeRemoved {
        /// Full state of the node at removal time.
        snapshot: NodeSnapshot,
    },
    /// A single-valued feature changed.
    AttrSet {
        /// The feature name.
        feature: String,
        /// Previous value, `None` if the feature was unset.
        old: Option<Value>,
        /// New value, `None` if the feature was cleared.
        new: Option<Value>,
    },
    /// A value was inserted into a list feature.
    ListInserted {
        /// The feature name.
        feature: String,
        /// Position of the inserted value.
        index: usize,
        /// The inserted value.
        value: Value,
    },
    /// A value was removed from a list feature.
    ListRemoved {
        /// The feature name.
        feature: String,
        /// Position the value was removed from.
        index: usize,
        /// The removed value.
        value: Value,
    },
}

impl MutationKind {
    /// Returns the feature name this mutation touches, if any.
    #[must_use]
    pub fn feature(&self) -> Option<&str> {
        match self {
            Self::AttrSet { feature, .. }
            | Self::ListInserted { feature, .. }
            | Self::ListRemoved { feature, .. } => Some(feature),
            Self::NodeCreated | Self::NodeRemoved { .. } => None,
        }
    }
}

/// A synchronous mutation observer.
pub type Observer = Box<dyn Fn(&Mutation) + Send + Sync>;

/// A hook consulted before any mutation is applied.
///
/// Returning `Err(reason)` rejects the mutation; the model surfaces it as
/// [`crate::ModelError::EditRejected`] and leaves the graph untouched.
pub type EditGate = Box<dyn Fn(&Mutation) -> Result<(), String> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_accessor() {
        let set = MutationKind::AttrSet {
            feature: "name".to_string(),
            old: None,
            new: Some(Value::Int(1)),
        };
        assert_eq!(set.feature(), Some("name"));
        assert_eq!(MutationKind::NodeCreated.feature(), None);
    }
}
