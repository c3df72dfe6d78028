//! # GraphTx Core
//!
//! Transactional engine for a shared in-memory object graph.
//!
//! This crate provides:
//! - A fair many-reader / one-writer lock arbiter with per-thread
//!   reentrancy and cancellable waits
//! - Nested transactions with option inheritance and a reversible change
//!   recorder per transaction
//! - A precommit listener pipeline with veto and trigger-command fixpoint,
//!   commit-time model validation, and postcommit notification
//! - A [`Domain`] façade tying one [`graphtx_model::Model`] to all of the
//!   above, plus a minimal undo history
//!
//! ## Example
//!
//! ```rust
//! use graphtx_core::Domain;
//! use graphtx_model::Value;
//!
//! let domain = Domain::new();
//! let node = domain
//!     .execute(|model| {
//!         let node = model.create_node()?;
//!         model.set_attr(node, "name", Some(Value::Text("root".into())))?;
//!         Ok(node)
//!     })
//!     .unwrap();
//!
//! domain
//!     .run_exclusive(|model| {
//!         assert_eq!(model.attr(node, "name"), Some(Value::Text("root".into())));
//!     })
//!     .unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod arbiter;
mod cancel;
mod change;
mod config;
mod domain;
mod error;
mod listener;
mod operation;
mod options;
mod task;
mod transaction;
mod types;
mod validation;

pub use arbiter::{Arbiter, ArbiterSnapshot, LockHandle, LockKind};
pub use cancel::CancelToken;
pub use change::{Change, ChangeDescription, ChangeRecorder, RecordedChange};
pub use config::Config;
pub use domain::Domain;
pub use error::{Diagnostic, EngineError, EngineResult, RollbackCause, Severity};
pub use listener::{
    FnPostcommit, FnPrecommit, FnTrigger, ListenerId, PostcommitEvent, PostcommitListener,
    PrecommitDecision, PrecommitEvent, PrecommitListener, TriggerCommand,
};
pub use operation::{FnOperation, UndoableOperation};
pub use options::{
    inherit_nothing, inherit_unless_blocked, inherit_value, InheritPolicy, OptionDef, OptionKey,
    OptionMap, OptionRegistry,
};
pub use task::{ReadContext, ReadTask};
pub use transaction::{Transaction, TxState};
pub use types::{SequenceNumber, TransactionId};
pub use validation::{blocking_findings, FnValidator, Validator};
