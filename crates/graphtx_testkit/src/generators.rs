//! Property-based test generators using proptest.
//!
//! Edit scripts address nodes by slot index into the set of nodes the
//! script has created so far, so every generated script is applicable
//! regardless of which node ids the model hands out.

use graphtx_model::{Model, ModelResult, NodeId, Value};
use proptest::prelude::*;

/// One step of a generated edit script.
#[derive(Debug, Clone)]
pub enum EditOp {
    /// Create a fresh node.
    Create,
    /// Set an attribute on the node at `slot`.
    SetAttr {
        /// Index into the script's live nodes, taken modulo their count.
        slot: usize,
        /// Feature selector, mapped to a small fixed feature set.
        feature: u8,
        /// The value to set.
        value: i64,
    },
    /// Clear an attribute on the node at `slot`.
    ClearAttr {
        /// Index into the script's live nodes.
        slot: usize,
        /// Feature selector.
        feature: u8,
    },
    /// Append to a list feature of the node at `slot`.
    ListPush {
        /// Index into the script's live nodes.
        slot: usize,
        /// Feature selector.
        feature: u8,
        /// The value to append.
        value: i64,
    },
    /// Remove the last element of a list feature of the node at `slot`.
    ListPop {
        /// Index into the script's live nodes.
        slot: usize,
        /// Feature selector.
        feature: u8,
    },
    /// Remove the node at `slot` entirely.
    Remove {
        /// Index into the script's live nodes.
        slot: usize,
    },
}

fn feature_name(feature: u8) -> String {
    format!("f{}", feature % 4)
}

/// Strategy producing a single edit operation.
pub fn edit_op_strategy() -> impl Strategy<Value = EditOp> {
    prop_oneof![
        2 => Just(EditOp::Create),
        4 => (any::<usize>(), any::<u8>(), any::<i64>())
            .prop_map(|(slot, feature, value)| EditOp::SetAttr { slot, feature, value }),
        1 => (any::<usize>(), any::<u8>())
            .prop_map(|(slot, feature)| EditOp::ClearAttr { slot, feature }),
        3 => (any::<usize>(), any::<u8>(), any::<i64>())
            .prop_map(|(slot, feature, value)| EditOp::ListPush { slot, feature, value }),
        1 => (any::<usize>(), any::<u8>())
            .prop_map(|(slot, feature)| EditOp::ListPop { slot, feature }),
        1 => any::<usize>().prop_map(|slot| EditOp::Remove { slot }),
    ]
}

/// Strategy producing an edit script of up to `max_len` operations.
pub fn edit_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<EditOp>> {
    prop::collection::vec(edit_op_strategy(), 1..=max_len)
}

/// Applies a script to the model, tracking the script's live nodes.
///
/// Operations addressing a slot while no script-created node is alive are
/// skipped; a `ListPop` on an empty list is skipped too. Returns the nodes
/// still alive at the end.
pub fn apply_script(model: &Model, script: &[EditOp]) -> ModelResult<Vec<NodeId>> {
    let mut live: Vec<NodeId> = Vec::new();
    for op in script {
        match op {
            EditOp::Create => live.push(model.create_node()?),
            EditOp::SetAttr {
                slot,
                feature,
                value,
            } => {
                if let Some(node) = pick(&live, *slot) {
                    model.set_attr(node, &feature_name(*feature), Some(Value::Int(*value)))?;
                }
            }
            EditOp::ClearAttr { slot, feature } => {
                if let Some(node) = pick(&live, *slot) {
                    model.set_attr(node, &feature_name(*feature), None)?;
                }
            }
            EditOp::ListPush {
                slot,
                feature,
                value,
            } => {
                if let Some(node) = pick(&live, *slot) {
                    let feature = feature_name(*feature);
                    let len = model.list(node, &feature).len();
                    model.list_insert(node, &feature, len, Value::Int(*value))?;
                }
            }
            EditOp::ListPop { slot, feature } => {
                if let Some(node) = pick(&live, *slot) {
                    let feature = feature_name(*feature);
                    let len = model.list(node, &feature).len();
                    if len > 0 {
                        model.list_remove(node, &feature, len - 1)?;
                    }
                }
            }
            EditOp::Remove { slot } => {
                if let Some(node) = pick(&live, *slot) {
                    model.remove_node(node)?;
                    live.retain(|n| *n != node);
                }
            }
        }
    }
    Ok(live)
}

fn pick(live: &[NodeId], slot: usize) -> Option<NodeId> {
    if live.is_empty() {
        None
    } else {
        Some(live[slot % live.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::model_from_state;
    use graphtx_core::{Domain, OptionMap};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Rolling back a script leaves the model exactly as it was.
        #[test]
        fn rollback_restores_initial_state(script in edit_script_strategy(40)) {
            let domain = Domain::new();
            let before = domain.model().state();

            let tx = domain.start(OptionMap::new()).unwrap();
            apply_script(domain.model(), &script).unwrap();
            tx.rollback("property check").unwrap();

            prop_assert_eq!(domain.model().state(), before);
        }

        /// A committed delta replayed onto the prior state reproduces the
        /// final state, and reverting it goes back exactly.
        #[test]
        fn delta_round_trip(script in edit_script_strategy(40)) {
            let domain = Domain::new();
            let before = domain.model().state();

            let tx = domain.start(OptionMap::new()).unwrap();
            apply_script(domain.model(), &script).unwrap();
            tx.commit().unwrap();
            let after = domain.model().state();

            if let Some(description) = domain.pop_undo() {
                let replay = model_from_state(&before);
                description.apply(&replay);
                prop_assert_eq!(replay.state(), after.clone());

                description.revert(&replay);
                prop_assert_eq!(replay.state(), before);
            } else {
                // Empty scripts of skipped operations commit without a delta.
                prop_assert_eq!(after, before);
            }
        }
    }
}
