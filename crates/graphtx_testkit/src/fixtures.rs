//! Fixtures and domain helpers.
//!
//! Convenience builders for the small pre-populated domains most tests
//! start from.

use graphtx_core::{Config, Domain, EngineResult};
use graphtx_model::{Model, ModelState, NodeId, Value};

/// Shorthand for a text attribute value.
#[must_use]
pub fn text(s: &str) -> Option<Value> {
    Some(Value::Text(s.to_string()))
}

/// Shorthand for an integer attribute value.
#[must_use]
pub fn int(i: i64) -> Option<Value> {
    Some(Value::Int(i))
}

/// A domain together with the nodes its fixture created.
pub struct TestDomain {
    /// The domain under test.
    pub domain: Domain,
    /// Nodes created by the fixture, in creation order.
    pub nodes: Vec<NodeId>,
}

impl TestDomain {
    /// Runs a write transaction and panics on failure; fixture setup only.
    pub fn setup(&self, f: impl FnOnce(&graphtx_model::Model) -> EngineResult<()>) {
        self.domain.execute(f).expect("fixture setup failed");
    }
}

/// Builds a domain holding `nodes` empty nodes, each tagged with its
/// creation index under the `"index"` attribute.
#[must_use]
pub fn seeded_domain(nodes: usize) -> TestDomain {
    seeded_domain_with(Config::default(), nodes)
}

/// [`seeded_domain`] with explicit engine configuration.
#[must_use]
pub fn seeded_domain_with(config: Config, nodes: usize) -> TestDomain {
    let domain = Domain::with_config(config);
    let created = domain
        .execute(|model| {
            let mut created = Vec::with_capacity(nodes);
            for i in 0..nodes {
                let node = model.create_node()?;
                model.set_attr(node, "index", int(i as i64))?;
                created.push(node);
            }
            Ok(created)
        })
        .expect("fixture setup failed");
    TestDomain {
        domain,
        nodes: created,
    }
}

/// Builds a standalone model holding the given state.
///
/// Used to replay committed deltas onto a copy of an earlier state.
#[must_use]
pub fn model_from_state(state: &ModelState) -> Model {
    let model = Model::new();
    for (id, snapshot) in state {
        model
            .restore_node(*id, snapshot)
            .expect("state snapshots are restorable");
    }
    model
}
