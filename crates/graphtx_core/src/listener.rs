//! Precommit and postcommit listener contracts.
//!
//! Precommit listeners see a write transaction's accumulated delta at its
//! commit boundary, nested commits included, and may veto it or schedule
//! follow-up trigger commands. Trigger commands run inside the same
//! transaction, so their changes land in the same delta and the listeners
//! run again over the grown delta until no listener asks for more work.
//! Postcommit listeners are notified once per published root commit and
//! cannot affect the outcome.

use crate::change::{ChangeDescription, RecordedChange};
use crate::error::Diagnostic;
use crate::types::{SequenceNumber, TransactionId};
use graphtx_model::Model;
use std::fmt;
use std::sync::Arc;

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener:{}", self.0)
    }
}

/// What a precommit listener sees: the committing transaction's own delta
/// and read access to the model carrying its uncommitted state.
pub struct PrecommitEvent<'a> {
    /// The committing transaction; a child when the boundary is a nested
    /// commit.
    pub transaction: TransactionId,
    /// The model, already reflecting the transaction's changes.
    pub model: &'a Model,
    /// The accumulated delta so far, in application order.
    pub changes: &'a [RecordedChange],
}

/// A precommit listener's verdict.
pub enum PrecommitDecision {
    /// No objection and no follow-up work.
    Proceed,
    /// Block the commit; the transaction rolls back.
    Veto(Diagnostic),
    /// Run a follow-up command inside the transaction, then re-run the
    /// listener round over the grown delta.
    Trigger(Box<dyn TriggerCommand>),
}

/// A follow-up command scheduled by a precommit listener.
pub trait TriggerCommand: Send {
    /// Short description, used in logs and failure diagnostics.
    fn describe(&self) -> &str;

    /// Runs the command against the model inside the committing transaction.
    fn execute(&self, model: &Model) -> Result<(), Diagnostic>;
}

/// Inspects a write transaction's delta before it commits.
pub trait PrecommitListener: Send + Sync {
    /// Stable name, used in veto and failure diagnostics.
    fn name(&self) -> &str;

    /// Called during the precommit phase; may be called several times per
    /// commit as trigger commands grow the delta.
    fn transaction_about_to_commit(&self, ctx: &PrecommitEvent<'_>) -> PrecommitDecision;
}

/// What a postcommit listener sees: a published root transaction.
pub struct PostcommitEvent {
    /// The committed root transaction.
    pub transaction: TransactionId,
    /// Position in the domain's total commit order.
    pub sequence: SequenceNumber,
    /// The non-silent changes, in application order.
    pub changes: Vec<RecordedChange>,
    /// The full delta kept for the undo history; absent under `NoUndo`.
    pub description: Option<Arc<ChangeDescription>>,
}

/// Observes published commits.
pub trait PostcommitListener: Send + Sync {
    /// Stable name, used in logs.
    fn name(&self) -> &str;

    /// Called after a root transaction's delta has been published.
    ///
    /// Failures here never affect the already-committed transaction; a
    /// panicking listener is isolated and counted.
    fn transaction_committed(&self, event: &PostcommitEvent);
}

/// A [`PrecommitListener`] built from a closure.
pub struct FnPrecommit<F>
where
    F: Fn(&PrecommitEvent<'_>) -> PrecommitDecision + Send + Sync,
{
    name: String,
    body: F,
}

impl<F> FnPrecommit<F>
where
    F: Fn(&PrecommitEvent<'_>) -> PrecommitDecision + Send + Sync,
{
    /// Wraps a closure as a named precommit listener.
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F> PrecommitListener for FnPrecommit<F>
where
    F: Fn(&PrecommitEvent<'_>) -> PrecommitDecision + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transaction_about_to_commit(&self, ctx: &PrecommitEvent<'_>) -> PrecommitDecision {
        (self.body)(ctx)
    }
}

/// A [`PostcommitListener`] built from a closure.
pub struct FnPostcommit<F>
where
    F: Fn(&PostcommitEvent) + Send + Sync,
{
    name: String,
    body: F,
}

impl<F> FnPostcommit<F>
where
    F: Fn(&PostcommitEvent) + Send + Sync,
{
    /// Wraps a closure as a named postcommit listener.
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F> PostcommitListener for FnPostcommit<F>
where
    F: Fn(&PostcommitEvent) + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transaction_committed(&self, event: &PostcommitEvent) {
        (self.body)(event);
    }
}

/// A [`TriggerCommand`] built from a closure.
pub struct FnTrigger<F>
where
    F: Fn(&Model) -> Result<(), Diagnostic> + Send,
{
    description: String,
    body: F,
}

impl<F> FnTrigger<F>
where
    F: Fn(&Model) -> Result<(), Diagnostic> + Send,
{
    /// Wraps a closure as a described trigger command.
    pub fn new(description: impl Into<String>, body: F) -> Self {
        Self {
            description: description.into(),
            body,
        }
    }
}

impl<F> TriggerCommand for FnTrigger<F>
where
    F: Fn(&Model) -> Result<(), Diagnostic> + Send,
{
    fn describe(&self) -> &str {
        &self.description
    }

    fn execute(&self, model: &Model) -> Result<(), Diagnostic> {
        (self.body)(model)
    }
}
