//! External reversible operations.
//!
//! Work that lives outside the object graph (a file rename, an editor buffer
//! edit) can still ride in a transaction as long as it knows how to reverse
//! itself. The recorder treats an external operation exactly like a graph
//! change: it is undone during rollback and redone when a committed delta is
//! replayed.

use std::fmt;

/// A reversible unit of work outside the object graph.
///
/// `execute` runs once when the operation is first recorded and may fail;
/// `undo` and `redo` are expected to be infallible because they replay a
/// state change that has already succeeded once.
pub trait UndoableOperation: Send + Sync {
    /// Short human-readable label, used in logs.
    fn label(&self) -> &str;

    /// Runs the operation for the first time.
    fn execute(&self) -> Result<(), String>;

    /// Reverses the operation's effect.
    fn undo(&self);

    /// Re-applies the operation's effect after an undo.
    fn redo(&self);
}

impl fmt::Debug for dyn UndoableOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UndoableOperation({})", self.label())
    }
}

/// An [`UndoableOperation`] built from three closures.
pub struct FnOperation<E, U, R>
where
    E: Fn() -> Result<(), String> + Send + Sync,
    U: Fn() + Send + Sync,
    R: Fn() + Send + Sync,
{
    label: String,
    execute: E,
    undo: U,
    redo: R,
}

impl<E, U, R> FnOperation<E, U, R>
where
    E: Fn() -> Result<(), String> + Send + Sync,
    U: Fn() + Send + Sync,
    R: Fn() + Send + Sync,
{
    /// Creates an operation from its three closures.
    pub fn new(label: impl Into<String>, execute: E, undo: U, redo: R) -> Self {
        Self {
            label: label.into(),
            execute,
            undo,
            redo,
        }
    }
}

impl<E, U, R> UndoableOperation for FnOperation<E, U, R>
where
    E: Fn() -> Result<(), String> + Send + Sync,
    U: Fn() + Send + Sync,
    R: Fn() + Send + Sync,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn execute(&self) -> Result<(), String> {
        (self.execute)()
    }

    fn undo(&self) {
        (self.undo)();
    }

    fn redo(&self) {
        (self.redo)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fn_operation_round_trip() {
        let counter = Arc::new(AtomicI32::new(0));
        let (a, b, c) = (counter.clone(), counter.clone(), counter.clone());
        let op = FnOperation::new(
            "bump",
            move || {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            move || {
                b.fetch_sub(1, Ordering::SeqCst);
            },
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert_eq!(op.label(), "bump");
        op.execute().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        op.undo();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        op.redo();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
