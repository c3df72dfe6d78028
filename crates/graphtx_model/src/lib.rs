//! # GraphTx Model
//!
//! The shared, in-memory mutable object graph that the GraphTx engine
//! coordinates access to.
//!
//! This crate provides:
//! - Node storage with single-valued attributes and positional list features
//! - Synchronous mutation notifications (one record per applied change)
//! - An installable edit gate used by the engine to enforce the write-lock
//!   discipline
//!
//! The model itself knows nothing about transactions; it only reports every
//! mutation it applies and refuses mutations the gate rejects.

mod error;
mod id;
mod model;
mod mutation;
mod node;
mod value;

pub use error::{ModelError, ModelResult};
pub use id::NodeId;
pub use model::{Model, ModelState};
pub use mutation::{EditGate, Mutation, MutationKind, Observer};
pub use node::NodeSnapshot;
pub use value::Value;
