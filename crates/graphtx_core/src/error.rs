//! Error types for the transaction engine.

use graphtx_model::{ModelError, NodeId};
use std::fmt;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in transaction engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A blocking lock wait was cancelled.
    ///
    /// The pending operation was abandoned without any partial effect: a
    /// cancelled `start` behaves as if the transaction never began.
    #[error("interrupted while waiting for the lock")]
    Interrupted,

    /// The transaction was rolled back; all of its recorded changes have
    /// been reverse-applied.
    #[error("transaction rolled back: {0}")]
    Rollback(RollbackCause),

    /// A thread holding only a read lock requested the write lock.
    ///
    /// There is no upgrade path; reentrancy exists only for a thread that
    /// already holds write access.
    #[error("write lock requested while holding only a read lock")]
    LockUpgrade,

    /// An operation was invoked from a thread other than the transaction's
    /// owning thread.
    #[error("transaction {transaction} is owned by another thread")]
    WrongThread {
        /// The transaction that was touched.
        transaction: crate::types::TransactionId,
    },

    /// A mutation was attempted through a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// An operation is not valid in the current state.
    #[error("invalid operation: {message}")]
    InvalidState {
        /// Description of the violated expectation.
        message: String,
    },

    /// The model rejected an operation.
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

impl EngineError {
    /// Creates an `InvalidState` error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Returns the rollback cause, if this error is a rollback.
    #[must_use]
    pub fn rollback_cause(&self) -> Option<&RollbackCause> {
        match self {
            Self::Rollback(cause) => Some(cause),
            _ => None,
        }
    }
}

/// Why a transaction was rolled back.
#[derive(Debug, Error)]
pub enum RollbackCause {
    /// A precommit listener vetoed the transaction.
    #[error("vetoed by '{listener}': {diagnostic}")]
    Veto {
        /// Name of the vetoing listener.
        listener: String,
        /// The veto diagnostic.
        diagnostic: Diagnostic,
    },

    /// Model validation of the captured changes failed.
    #[error("validation failed: {}", format_diagnostics(.0))]
    ValidationFailed(Vec<Diagnostic>),

    /// A precommit listener or trigger command failed unexpectedly.
    ///
    /// Unexpected failures fail closed: the transaction is rolled back.
    #[error("listener '{listener}' failed: {message}")]
    ListenerFailure {
        /// Name of the failing listener.
        listener: String,
        /// Description of the failure (panic payload or error).
        message: String,
    },

    /// The precommit trigger-command loop did not converge.
    #[error("trigger commands did not converge within {limit} iterations")]
    TriggerLoopExceeded {
        /// The configured iteration cap.
        limit: usize,
    },

    /// The caller requested the rollback.
    #[error("rollback requested: {reason}")]
    Requested {
        /// The caller-supplied reason.
        reason: String,
    },
}

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational; never blocks a commit.
    Info,
    /// Suspicious but acceptable; never blocks a commit.
    Warning,
    /// A violation; blocks the commit.
    Error,
}

/// A single finding from validation or a listener veto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// How serious the finding is.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// The node the finding is about, if any.
    pub node: Option<NodeId>,
}

impl Diagnostic {
    /// Creates an error-severity diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            node: None,
        }
    }

    /// Creates a warning-severity diagnostic.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            node: None,
        }
    }

    /// Attaches the node the finding is about.
    #[must_use]
    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(node) => write!(f, "{:?}: {} (node {node})", self.severity, self.message),
            None => write!(f, "{:?}: {}", self.severity, self.message),
        }
    }
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
