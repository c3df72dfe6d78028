//! Reversible change recording.
//!
//! Every mutation a write transaction performs is captured here as a
//! [`Change`] that knows how to reverse itself. Rollback walks the recorded
//! list strictly in reverse order, reverse-applying each entry under a
//! capture bypass so the undo itself is not re-recorded.

use crate::operation::UndoableOperation;
use crate::types::{SequenceNumber, TransactionId};
use graphtx_model::{Model, Mutation, MutationKind, NodeSnapshot, Value};
use std::sync::Arc;
use tracing::warn;

/// One reversible change, either a graph mutation or an external operation.
#[derive(Clone)]
pub enum Change {
    /// A node was created.
    CreateNode {
        /// The created node.
        node: graphtx_model::NodeId,
    },
    /// A node was removed; the snapshot holds its full prior state.
    RemoveNode {
        /// The removed node.
        node: graphtx_model::NodeId,
        /// Its state at removal time.
        snapshot: NodeSnapshot,
    },
    /// A single-valued feature changed.
    SetAttr {
        /// The touched node.
        node: graphtx_model::NodeId,
        /// The feature name.
        feature: String,
        /// Previous value.
        old: Option<Value>,
        /// New value.
        new: Option<Value>,
    },
    /// A value was inserted into a list feature.
    ListInsert {
        /// The touched node.
        node: graphtx_model::NodeId,
        /// The feature name.
        feature: String,
        /// Insertion position.
        index: usize,
        /// The inserted value.
        value: Value,
    },
    /// A value was removed from a list feature.
    ListRemove {
        /// The touched node.
        node: graphtx_model::NodeId,
        /// The feature name.
        feature: String,
        /// Removal position.
        index: usize,
        /// The removed value.
        value: Value,
    },
    /// A reversible operation outside the object graph.
    External(Arc<dyn UndoableOperation>),
}

impl Change {
    /// Builds the change record for a captured model mutation.
    #[must_use]
    pub fn from_mutation(mutation: &Mutation) -> Self {
        let node = mutation.node;
        match &mutation.kind {
            MutationKind::NodeCreated => Self::CreateNode { node },
            MutationKind::NodeRemoved { snapshot } => Self::RemoveNode {
                node,
                snapshot: snapshot.clone(),
            },
            MutationKind::AttrSet { feature, old, new } => Self::SetAttr {
                node,
                feature: feature.clone(),
                old: old.clone(),
                new: new.clone(),
            },
            MutationKind::ListInserted {
                feature,
                index,
                value,
            } => Self::ListInsert {
                node,
                feature: feature.clone(),
                index: *index,
                value: value.clone(),
            },
            MutationKind::ListRemoved {
                feature,
                index,
                value,
            } => Self::ListRemove {
                node,
                feature: feature.clone(),
                index: *index,
                value: value.clone(),
            },
        }
    }

    /// Reverse-applies this change to the model.
    pub fn revert_on(&self, model: &Model) -> Result<(), String> {
        match self {
            Self::CreateNode { node } => model
                .remove_node(*node)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Self::RemoveNode { node, snapshot } => model
                .restore_node(*node, snapshot)
                .map_err(|e| e.to_string()),
            Self::SetAttr {
                node, feature, old, ..
            } => model
                .set_attr(*node, feature, old.clone())
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Self::ListInsert {
                node,
                feature,
                index,
                ..
            } => model
                .list_remove(*node, feature, *index)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Self::ListRemove {
                node,
                feature,
                index,
                value,
            } => model
                .list_insert(*node, feature, *index, value.clone())
                .map_err(|e| e.to_string()),
            Self::External(op) => {
                op.undo();
                Ok(())
            }
        }
    }

    /// Re-applies this change to the model, as during a redo replay.
    pub fn apply_to(&self, model: &Model) -> Result<(), String> {
        match self {
            Self::CreateNode { node } => model
                .restore_node(*node, &NodeSnapshot::empty())
                .map_err(|e| e.to_string()),
            Self::RemoveNode { node, .. } => model
                .remove_node(*node)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Self::SetAttr {
                node, feature, new, ..
            } => model
                .set_attr(*node, feature, new.clone())
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Self::ListInsert {
                node,
                feature,
                index,
                value,
            } => model
                .list_insert(*node, feature, *index, value.clone())
                .map_err(|e| e.to_string()),
            Self::ListRemove {
                node,
                feature,
                index,
                ..
            } => model
                .list_remove(*node, feature, *index)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Self::External(op) => {
                op.redo();
                Ok(())
            }
        }
    }

    /// Returns the node this change touches, if it is a graph change.
    #[must_use]
    pub fn node(&self) -> Option<graphtx_model::NodeId> {
        match self {
            Self::CreateNode { node }
            | Self::RemoveNode { node, .. }
            | Self::SetAttr { node, .. }
            | Self::ListInsert { node, .. }
            | Self::ListRemove { node, .. } => Some(*node),
            Self::External(_) => None,
        }
    }
}

impl std::fmt::Debug for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateNode { node } => write!(f, "CreateNode({node})"),
            Self::RemoveNode { node, .. } => write!(f, "RemoveNode({node})"),
            Self::SetAttr { node, feature, .. } => write!(f, "SetAttr({node}, {feature})"),
            Self::ListInsert {
                node,
                feature,
                index,
                ..
            } => write!(f, "ListInsert({node}, {feature}[{index}])"),
            Self::ListRemove {
                node,
                feature,
                index,
                ..
            } => write!(f, "ListRemove({node}, {feature}[{index}])"),
            Self::External(op) => write!(f, "External({})", op.label()),
        }
    }
}

/// A recorded change together with its notification disposition.
#[derive(Debug, Clone)]
pub struct RecordedChange {
    /// The reversible change.
    pub change: Change,
    /// True if the change was made under a silent transaction and must be
    /// excluded from the postcommit event.
    pub silent: bool,
}

/// Append-only log of a transaction's changes.
///
/// The recorder freezes when the owning transaction reaches its committing
/// phase; a frozen recorder rejects further appends. During the precommit
/// listener phase the recorder is still open, so trigger commands land in
/// the same delta as the original changes.
#[derive(Debug, Default)]
pub struct ChangeRecorder {
    changes: Vec<RecordedChange>,
    frozen: bool,
}

impl ChangeRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a change.
    ///
    /// Returns false without recording if the recorder is frozen.
    pub fn record(&mut self, change: Change, silent: bool) -> bool {
        if self.frozen {
            warn!(?change, "change ignored by frozen recorder");
            return false;
        }
        self.changes.push(RecordedChange { change, silent });
        true
    }

    /// Appends a batch of already-recorded changes, as when a child delta
    /// merges into its parent.
    pub fn extend(&mut self, changes: Vec<RecordedChange>) {
        self.changes.extend(changes);
    }

    /// Stops accepting appends.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Returns true once [`ChangeRecorder::freeze`] has run.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of recorded changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Takes the recorded changes, leaving the recorder empty.
    pub fn drain(&mut self) -> Vec<RecordedChange> {
        std::mem::take(&mut self.changes)
    }

    /// Clones the recorded changes for inspection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RecordedChange> {
        self.changes.clone()
    }

    /// Reverse-applies every recorded change, newest first, and leaves the
    /// recorder empty.
    ///
    /// The replay runs under a capture bypass so reversals are not
    /// re-recorded. A failed reversal is logged and skipped; later (older)
    /// entries are still reverted so the model ends as close to the prior
    /// state as possible.
    pub fn revert_all(&mut self, model: &Model) {
        let changes = self.drain();
        Model::bypass(|| {
            for recorded in changes.iter().rev() {
                if let Err(message) = recorded.change.revert_on(model) {
                    warn!(change = ?recorded.change, %message, "failed to revert change");
                }
            }
        });
    }
}

/// The published delta of a committed root transaction.
#[derive(Debug)]
pub struct ChangeDescription {
    /// The root transaction the delta came from.
    pub transaction: TransactionId,
    /// Position in the domain's total commit order.
    pub sequence: SequenceNumber,
    /// The recorded changes, in application order.
    pub changes: Vec<RecordedChange>,
}

impl ChangeDescription {
    /// Returns the changes that postcommit listeners should see, excluding
    /// silent contributions.
    #[must_use]
    pub fn reportable(&self) -> Vec<&RecordedChange> {
        self.changes.iter().filter(|c| !c.silent).collect()
    }

    /// Reverse-applies the whole delta, newest change first.
    pub fn revert(&self, model: &Model) {
        Model::bypass(|| {
            for recorded in self.changes.iter().rev() {
                if let Err(message) = recorded.change.revert_on(model) {
                    warn!(change = ?recorded.change, %message, "failed to revert change");
                }
            }
        });
    }

    /// Re-applies the whole delta in original order.
    pub fn apply(&self, model: &Model) {
        Model::bypass(|| {
            for recorded in &self.changes {
                if let Err(message) = recorded.change.apply_to(model) {
                    warn!(change = ?recorded.change, %message, "failed to apply change");
                }
            }
        });
    }
}
