//! The model: a table of nodes with observable mutations.

use crate::error::{ModelError, ModelResult};
use crate::id::NodeId;
use crate::mutation::{EditGate, Mutation, MutationKind, Observer};
use crate::node::{Node, NodeSnapshot};
use crate::value::Value;
use parking_lot::RwLock;
use std::cell::Cell;
use std::collections::HashMap;

thread_local! {
    /// When set, the current thread skips gate checks and observer delivery.
    static BYPASS: Cell<bool> = const { Cell::new(false) };
}

/// Full model state, used to compare models exactly.
pub type ModelState = HashMap<NodeId, NodeSnapshot>;

/// The shared mutable object graph.
///
/// `Model` is safe to share across threads (`Arc<Model>`); the engine layered
/// on top decides *when* each thread is allowed to mutate it. Every applied
/// mutation is reported synchronously to the registered observers on the
/// mutating thread, carrying the old and new values needed to reverse it.
///
/// Each mutation validates and applies under a single write lock, so the
/// old-value information in the emitted [`Mutation`] is always exact. The
/// edit gate runs under that lock and must not call back into the model;
/// observers run after the lock is released.
#[derive(Default)]
pub struct Model {
    /// Node table.
    nodes: RwLock<HashMap<NodeId, Node>>,
    /// Synchronous mutation observers.
    observers: RwLock<Vec<Observer>>,
    /// Hook consulted before any mutation is applied.
    gate: RwLock<Option<EditGate>>,
}

impl Model {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mutation observer.
    ///
    /// Observers run synchronously on the mutating thread, in registration
    /// order, after the mutation has been applied.
    pub fn add_observer(&self, observer: Observer) {
        self.observers.write().push(observer);
    }

    /// Installs the edit gate, replacing any previous one.
    pub fn set_edit_gate(&self, gate: EditGate) {
        *self.gate.write() = Some(gate);
    }

    /// Runs `f` with gate checks and observer delivery disabled on the
    /// current thread.
    ///
    /// The engine uses this to reverse-apply recorded changes during rollback
    /// and undo without re-capturing them.
    pub fn bypass<R>(f: impl FnOnce() -> R) -> R {
        BYPASS.with(|b| {
            let prev = b.replace(true);
            let result = f();
            b.set(prev);
            result
        })
    }

    /// Returns true if the current thread is inside a [`Model::bypass`] scope.
    #[must_use]
    pub fn is_bypassed() -> bool {
        BYPASS.with(Cell::get)
    }

    // ========== Mutations ==========

    /// Creates a new empty node and returns its ID.
    pub fn create_node(&self) -> ModelResult<NodeId> {
        let id = NodeId::new();
        let mutation = {
            let mut nodes = self.nodes.write();
            let mutation = Mutation {
                node: id,
                kind: MutationKind::NodeCreated,
            };
            self.check_gate(&mutation)?;
            nodes.insert(id, Node::new());
            mutation
        };
        self.notify(&mutation);
        Ok(id)
    }

    /// Removes a node, returning its full prior state.
    pub fn remove_node(&self, id: NodeId) -> ModelResult<NodeSnapshot> {
        let mutation = {
            let mut nodes = self.nodes.write();
            let node = nodes.get(&id).ok_or(ModelError::NodeNotFound(id))?;
            let mutation = Mutation {
                node: id,
                kind: MutationKind::NodeRemoved {
                    snapshot: node.snapshot(),
                },
            };
            self.check_gate(&mutation)?;
            nodes.remove(&id);
            mutation
        };
        let snapshot = match &mutation.kind {
            MutationKind::NodeRemoved { snapshot } => snapshot.clone(),
            _ => unreachable!(),
        };
        self.notify(&mutation);
        Ok(snapshot)
    }

    /// Restores a previously removed node from its snapshot.
    ///
    /// This is the reverse of [`Model::remove_node`].
    pub fn restore_node(&self, id: NodeId, snapshot: &NodeSnapshot) -> ModelResult<()> {
        let mutation = {
            let mut nodes = self.nodes.write();
            let mutation = Mutation {
                node: id,
                kind: MutationKind::NodeCreated,
            };
            self.check_gate(&mutation)?;
            nodes.insert(id, Node::from_snapshot(snapshot));
            mutation
        };
        self.notify(&mutation);
        Ok(())
    }

    /// Sets or clears a single-valued feature, returning the previous value.
    ///
    /// Setting a feature to the value it already has is a no-op: nothing is
    /// applied and no mutation is reported.
    pub fn set_attr(
        &self,
        id: NodeId,
        feature: &str,
        new: Option<Value>,
    ) -> ModelResult<Option<Value>> {
        let (old, mutation) = {
            let mut nodes = self.nodes.write();
            let node = nodes.get_mut(&id).ok_or(ModelError::NodeNotFound(id))?;
            let old = node.attrs.get(feature).cloned();
            if old == new {
                return Ok(old);
            }
            let mutation = Mutation {
                node: id,
                kind: MutationKind::AttrSet {
                    feature: feature.to_string(),
                    old: old.clone(),
                    new: new.clone(),
                },
            };
            self.check_gate(&mutation)?;
            match new {
                Some(value) => node.attrs.insert(feature.to_string(), value),
                None => node.attrs.remove(feature),
            };
            (old, mutation)
        };
        self.notify(&mutation);
        Ok(old)
    }

    /// Inserts a value into a list feature at the given position.
    ///
    /// `index` may equal the current length (append). A missing list feature
    /// is treated as empty.
    pub fn list_insert(
        &self,
        id: NodeId,
        feature: &str,
        index: usize,
        value: Value,
    ) -> ModelResult<()> {
        let mutation = {
            let mut nodes = self.nodes.write();
            let node = nodes.get_mut(&id).ok_or(ModelError::NodeNotFound(id))?;
            let len = node.lists.get(feature).map_or(0, Vec::len);
            if index > len {
                return Err(ModelError::IndexOutOfBounds {
                    feature: feature.to_string(),
                    index,
                    len,
                });
            }
            let mutation = Mutation {
                node: id,
                kind: MutationKind::ListInserted {
                    feature: feature.to_string(),
                    index,
                    value: value.clone(),
                },
            };
            self.check_gate(&mutation)?;
            node.lists
                .entry(feature.to_string())
                .or_default()
                .insert(index, value);
            mutation
        };
        self.notify(&mutation);
        Ok(())
    }

    /// Removes the value at the given position of a list feature.
    pub fn list_remove(&self, id: NodeId, feature: &str, index: usize) -> ModelResult<Value> {
        let (value, mutation) = {
            let mut nodes = self.nodes.write();
            let node = nodes.get_mut(&id).ok_or(ModelError::NodeNotFound(id))?;
            let len = node.lists.get(feature).map_or(0, Vec::len);
            if index >= len {
                return Err(ModelError::IndexOutOfBounds {
                    feature: feature.to_string(),
                    index,
                    len,
                });
            }
            let mutation = Mutation {
                node: id,
                kind: MutationKind::ListRemoved {
                    feature: feature.to_string(),
                    index,
                    value: node.lists[feature][index].clone(),
                },
            };
            self.check_gate(&mutation)?;
            let list = node.lists.get_mut(feature).ok_or_else(|| {
                ModelError::IndexOutOfBounds {
                    feature: feature.to_string(),
                    index,
                    len,
                }
            })?;
            let value = list.remove(index);
            if list.is_empty() {
                node.lists.remove(feature);
            }
            (value, mutation)
        };
        self.notify(&mutation);
        Ok(value)
    }

    // ========== Reads ==========

    /// Returns the value of a single-valued feature.
    #[must_use]
    pub fn attr(&self, id: NodeId, feature: &str) -> Option<Value> {
        self.nodes
            .read()
            .get(&id)
            .and_then(|n| n.attrs.get(feature).cloned())
    }

    /// Returns a copy of a list feature (empty if absent).
    #[must_use]
    pub fn list(&self, id: NodeId, feature: &str) -> Vec<Value> {
        self.nodes
            .read()
            .get(&id)
            .and_then(|n| n.lists.get(feature).cloned())
            .unwrap_or_default()
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.read().contains_key(&id)
    }

    /// Returns the number of nodes in the model.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Returns all node IDs.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().keys().copied().collect()
    }

    /// Returns a snapshot of a single node.
    pub fn snapshot_node(&self, id: NodeId) -> ModelResult<NodeSnapshot> {
        self.nodes
            .read()
            .get(&id)
            .map(Node::snapshot)
            .ok_or(ModelError::NodeNotFound(id))
    }

    /// Returns the full model state, for exact comparison in tests and
    /// consistency checks.
    #[must_use]
    pub fn state(&self) -> ModelState {
        self.nodes
            .read()
            .iter()
            .map(|(id, node)| (*id, node.snapshot()))
            .collect()
    }

    // ========== Internal ==========

    fn check_gate(&self, mutation: &Mutation) -> ModelResult<()> {
        if Self::is_bypassed() {
            return Ok(());
        }
        if let Some(gate) = self.gate.read().as_ref() {
            gate(mutation).map_err(|reason| ModelError::EditRejected { reason })?;
        }
        Ok(())
    }

    fn notify(&self, mutation: &Mutation) {
        if Self::is_bypassed() {
            return;
        }
        for observer in self.observers.read().iter() {
            observer(mutation);
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("node_count", &self.node_count())
            .finish_non_exhaustive()
    }
}
