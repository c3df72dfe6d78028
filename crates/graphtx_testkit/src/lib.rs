//! # GraphTx Testkit
//!
//! Test utilities for GraphTx.
//!
//! This crate provides:
//! - Fixtures for building pre-populated domains
//! - Property-based test generators using proptest
//! - A concurrent stress harness checking the engine's core invariants
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphtx_testkit::prelude::*;
//!
//! #[test]
//! fn survives_mixed_load() {
//!     let report = run_mixed_load(&StressConfig::default());
//!     assert_eq!(report.failed_commits, 0);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::fixtures::{int, model_from_state, seeded_domain, seeded_domain_with, text, TestDomain};
    pub use crate::generators::{apply_script, edit_script_strategy, EditOp};
    pub use crate::stress::{run_mixed_load, StressConfig, StressReport};
}
