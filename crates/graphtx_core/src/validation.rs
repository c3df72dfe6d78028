//! Model validation at commit time.
//!
//! A validator inspects the model (already carrying the transaction's
//! uncommitted changes) together with the delta and reports findings.
//! Error-severity findings block the commit; warnings and infos are logged
//! and let it proceed. The `NoValidation` option skips this phase.

use crate::change::RecordedChange;
use crate::error::{Diagnostic, Severity};
use graphtx_model::Model;

/// Validates the model state a committing transaction would publish.
pub trait Validator: Send + Sync {
    /// Returns all findings for the pending state. An empty vector means
    /// the state is acceptable.
    fn validate(&self, model: &Model, changes: &[RecordedChange]) -> Vec<Diagnostic>;
}

/// A [`Validator`] built from a closure.
pub struct FnValidator<F>
where
    F: Fn(&Model, &[RecordedChange]) -> Vec<Diagnostic> + Send + Sync,
{
    body: F,
}

impl<F> FnValidator<F>
where
    F: Fn(&Model, &[RecordedChange]) -> Vec<Diagnostic> + Send + Sync,
{
    /// Wraps a closure as a validator.
    pub fn new(body: F) -> Self {
        Self { body }
    }
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&Model, &[RecordedChange]) -> Vec<Diagnostic> + Send + Sync,
{
    fn validate(&self, model: &Model, changes: &[RecordedChange]) -> Vec<Diagnostic> {
        (self.body)(model, changes)
    }
}

/// Splits findings into blocking errors and acceptable findings.
#[must_use]
pub fn blocking_findings(findings: Vec<Diagnostic>) -> (Vec<Diagnostic>, Vec<Diagnostic>) {
    findings
        .into_iter()
        .partition(|d| d.severity >= Severity::Error)
}
