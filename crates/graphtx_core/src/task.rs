//! Long-running read tasks.
//!
//! Background analyses that hold the read side for a long time are
//! cooperative citizens: they run inside an ordinary read transaction and
//! call [`ReadContext::checkpoint`] at natural pause points. A checkpoint
//! observes the task's cancellation token and yields the read grant, so
//! waiting writers get through without the arbiter ever cancelling the
//! task from outside.

use crate::cancel::CancelToken;
use crate::domain::Domain;
use crate::error::{EngineError, EngineResult};
use crate::options::{OptionKey, OptionMap};
use crate::transaction::Transaction;
use graphtx_model::Model;

/// Execution context handed to a read task's body.
pub struct ReadContext<'a> {
    model: &'a Model,
    transaction: &'a Transaction,
    token: &'a CancelToken,
}

impl ReadContext<'_> {
    /// The shared object graph, readable for the duration of the task.
    #[must_use]
    pub fn model(&self) -> &Model {
        self.model
    }

    /// Returns true if the task has been asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Pause point: observes cancellation and yields the read grant.
    ///
    /// Returns [`EngineError::Interrupted`] once the task is cancelled;
    /// the body is expected to propagate it and return.
    pub fn checkpoint(&self) -> EngineResult<()> {
        if self.token.is_cancelled() {
            return Err(EngineError::Interrupted);
        }
        self.transaction.yield_now()
    }
}

/// A cancellable long-running read.
#[derive(Debug, Default)]
pub struct ReadTask {
    token: CancelToken,
}

impl ReadTask {
    /// Creates a task with a fresh cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the task's cancellation token, to hand to the
    /// controlling side.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Requests the task to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Runs the task body inside a read transaction on `domain`.
    ///
    /// An `Err` from the body, including the `Interrupted` a checkpoint
    /// reports after cancellation, ends the transaction and is returned.
    pub fn run<R>(
        &self,
        domain: &Domain,
        body: impl FnOnce(&ReadContext<'_>) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let transaction = domain.start_interruptible(
            OptionMap::new().with(OptionKey::ReadOnly, true),
            self.token.clone(),
        )?;
        let ctx = ReadContext {
            model: domain.model(),
            transaction: &transaction,
            token: &self.token,
        };
        match body(&ctx) {
            Ok(result) => {
                transaction.commit()?;
                Ok(result)
            }
            Err(error) => {
                transaction.rollback("read task ended early")?;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_reads_and_finishes() {
        let domain = Domain::new();
        domain.execute(|model| Ok(model.create_node().map(|_| ())?)).unwrap();

        let task = ReadTask::new();
        let count = task
            .run(&domain, |ctx| {
                ctx.checkpoint()?;
                Ok(ctx.model().node_count())
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn cancelled_task_stops_at_checkpoint() {
        let domain = Domain::new();
        let task = ReadTask::new();
        task.cancel();

        let result = task.run(&domain, |ctx| {
            ctx.checkpoint()?;
            Ok(())
        });
        assert!(matches!(result, Err(EngineError::Interrupted)));
        // The read grant is gone; a writer proceeds immediately.
        domain.execute(|model| Ok(model.create_node().map(|_| ())?)).unwrap();
    }
}
