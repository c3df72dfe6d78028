//! Transaction handles and lifecycle states.
//!
//! A [`Transaction`] is a thread-bound guard over an entry in the domain's
//! per-thread active-transaction stack. All lifecycle calls go through the
//! owning [`crate::Domain`]; the guard verifies the calling thread and
//! rolls the transaction back if it is dropped while still active.

use crate::cancel::CancelToken;
use crate::domain::DomainShared;
use crate::error::{EngineError, EngineResult, RollbackCause};
use crate::operation::UndoableOperation;
use crate::types::{SequenceNumber, TransactionId};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::warn;

/// Lifecycle state of a transaction.
///
/// `Preparing` is re-enterable: the precommit trigger fixpoint keeps the
/// transaction there while the delta grows. The terminal states are
/// `Committed` and `RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting changes.
    Active,
    /// Running the precommit listener chain.
    Preparing,
    /// Delta frozen; publication in progress.
    Committing,
    /// Published. Terminal.
    Committed,
    /// Reverse-applying recorded changes.
    RollingBack,
    /// Fully reverted. Terminal.
    RolledBack,
}

impl TxState {
    /// Returns true if the transition to `next` is legal.
    #[must_use]
    pub fn may_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Preparing)
                | (Self::Active, Self::RollingBack)
                | (Self::Preparing, Self::Preparing)
                | (Self::Preparing, Self::Committing)
                | (Self::Preparing, Self::RollingBack)
                | (Self::Committing, Self::Committed)
                | (Self::RollingBack, Self::RolledBack)
        )
    }

    /// Returns true for the two terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// A live transaction, bound to the thread that started it.
///
/// Dropping an unfinished transaction rolls it back, so an early `?` return
/// from a transactional block cannot leave half-applied changes behind.
pub struct Transaction {
    shared: Arc<DomainShared>,
    id: TransactionId,
    owner: ThreadId,
    parent: Option<TransactionId>,
    read_only: bool,
    token: CancelToken,
    finished: bool,
    // Stack routing is keyed by thread; the guard must not migrate.
    _not_send: PhantomData<*const ()>,
}

impl Transaction {
    pub(crate) fn new(
        shared: Arc<DomainShared>,
        id: TransactionId,
        parent: Option<TransactionId>,
        read_only: bool,
        token: CancelToken,
    ) -> Self {
        Self {
            shared,
            id,
            owner: thread::current().id(),
            parent,
            read_only,
            token,
            finished: false,
            _not_send: PhantomData,
        }
    }

    /// The transaction's id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The parent transaction's id, `None` for a root.
    #[must_use]
    pub fn parent(&self) -> Option<TransactionId> {
        self.parent
    }

    /// Returns true for a root transaction.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Returns true if the transaction may not mutate the graph.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TxState {
        self.shared.tx_state(self.id).unwrap_or(if self.finished {
            TxState::Committed
        } else {
            TxState::Active
        })
    }

    fn check_thread(&self) -> EngineResult<()> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(EngineError::WrongThread {
                transaction: self.id,
            })
        }
    }

    /// Commits the transaction.
    ///
    /// A root write commit runs the precommit chain, validation, and
    /// publication, and returns its commit sequence number (or `None` when
    /// the delta was empty). A child commit merges its delta into the
    /// parent and returns `None`. On any failure the transaction is rolled
    /// back completely before the error is returned.
    pub fn commit(mut self) -> EngineResult<Option<SequenceNumber>> {
        self.check_thread()?;
        self.finished = true;
        self.shared.commit_transaction(self.id)
    }

    /// Rolls the transaction back at the caller's request.
    pub fn rollback(mut self, reason: impl Into<String>) -> EngineResult<()> {
        self.check_thread()?;
        self.finished = true;
        self.shared.rollback_transaction(
            self.id,
            RollbackCause::Requested {
                reason: reason.into(),
            },
        )
    }

    /// Runs and records an external reversible operation.
    ///
    /// The operation executes immediately; its undo joins this
    /// transaction's delta, so mixed graph and non-graph work forms one
    /// atomic unit.
    pub fn wrap_operation(&self, op: Arc<dyn UndoableOperation>) -> EngineResult<()> {
        self.check_thread()?;
        if self.read_only {
            return Err(EngineError::ReadOnly);
        }
        self.shared.wrap_operation(self.id, op)
    }

    /// Lets other threads at the lock.
    ///
    /// A read transaction fully releases and reacquires its grant. A write
    /// transaction does the same only while it has not yet recorded any
    /// change; afterwards the yield degrades to a scheduling pause so no
    /// reader can observe mid-transaction state.
    pub fn yield_now(&self) -> EngineResult<()> {
        self.check_thread()?;
        self.shared.yield_transaction(self.id, &self.token)
    }

    /// The cancellation token blocking waits of this transaction observe.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished || thread::current().id() != self.owner {
            return;
        }
        let result = self.shared.rollback_transaction(
            self.id,
            RollbackCause::Requested {
                reason: "transaction dropped without commit".to_string(),
            },
        );
        if let Err(error) = result {
            warn!(transaction = %self.id, %error, "rollback on drop failed");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}
