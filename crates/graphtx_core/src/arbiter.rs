//! Fair many-reader / one-writer lock arbitration.
//!
//! The arbiter is a standalone lock manager rather than a wrapper around a
//! [`parking_lot::RwLock`] because it needs three behaviors an off-the-shelf
//! lock does not give us together: per-thread reentrancy, a fairness window
//! for queued writers, and cancellable waits. State lives behind one mutex;
//! two condvars park blocked readers and writers separately so a release can
//! wake the right side.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::thread::{self, ThreadId};
use tracing::trace;

/// Which side of the lock a handle holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared read access.
    Read,
    /// Exclusive write access.
    Write,
}

/// Proof of a granted lock, consumed by [`Arbiter::release`].
///
/// Handles are deliberately not `Clone`: each grant is released exactly
/// once.
#[derive(Debug)]
pub struct LockHandle {
    kind: LockKind,
    thread: ThreadId,
}

impl LockHandle {
    /// The side of the lock this handle holds.
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// The thread the grant belongs to.
    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

#[derive(Debug, Default)]
struct State {
    /// The thread holding exclusive access, if any.
    writer: Option<ThreadId>,
    /// Reentrant depth of the writer's grant.
    write_depth: usize,
    /// Reentrant read counts per holding thread.
    readers: HashMap<ThreadId, usize>,
    /// FIFO tickets of threads waiting for exclusive access.
    queue: VecDeque<u64>,
    next_ticket: u64,
    /// Fresh reader grants since the oldest queued writer started waiting.
    bypass: u32,
}

/// Observable arbiter state, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterSnapshot {
    /// The current writer thread, if any.
    pub writer: Option<ThreadId>,
    /// Reentrant depth of the writer's grant.
    pub write_depth: usize,
    /// Number of distinct reader threads.
    pub reader_threads: usize,
    /// Number of queued writer tickets.
    pub queued_writers: usize,
    /// Reader grants counted against the oldest queued writer.
    pub bypass: u32,
}

/// The lock arbiter.
#[derive(Debug, Default)]
pub struct Arbiter {
    state: Mutex<State>,
    readers_cv: Condvar,
    writers_cv: Condvar,
}

impl Arbiter {
    /// Creates an idle arbiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires shared read access for the calling thread.
    ///
    /// Reentrant: a thread already holding read or write access is granted
    /// immediately. A fresh reader defers to a queued writer once that
    /// writer has been bypassed `writer_priority_after` times.
    pub fn acquire_read(&self, token: &CancelToken, config: &Config) -> EngineResult<LockHandle> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            let reentrant = state.writer == Some(me) || state.readers.contains_key(&me);
            let writer_active = state.writer.is_some();
            let writer_starved =
                !state.queue.is_empty() && state.bypass >= config.writer_priority_after;
            if reentrant || (!writer_active && !writer_starved) {
                if !reentrant && !state.queue.is_empty() {
                    state.bypass += 1;
                }
                *state.readers.entry(me).or_insert(0) += 1;
                trace!(?me, "read lock granted");
                return Ok(LockHandle {
                    kind: LockKind::Read,
                    thread: me,
                });
            }
            if token.is_cancelled() {
                return Err(EngineError::Interrupted);
            }
            self.readers_cv.wait_for(&mut state, config.wait_slice);
        }
    }

    /// Acquires exclusive write access for the calling thread.
    ///
    /// Reentrant for the current writer. A thread holding only read access
    /// gets [`EngineError::LockUpgrade`]; there is no upgrade path. Fresh
    /// writers queue FIFO and are granted in ticket order once the lock is
    /// free of readers.
    pub fn acquire_write(&self, token: &CancelToken, config: &Config) -> EngineResult<LockHandle> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.writer == Some(me) {
            state.write_depth += 1;
            return Ok(LockHandle {
                kind: LockKind::Write,
                thread: me,
            });
        }
        if state.readers.contains_key(&me) {
            return Err(EngineError::LockUpgrade);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);
        loop {
            let free = state.writer.is_none() && state.readers.is_empty();
            if free && state.queue.front() == Some(&ticket) {
                state.queue.pop_front();
                state.writer = Some(me);
                state.write_depth = 1;
                state.bypass = 0;
                trace!(?me, "write lock granted");
                return Ok(LockHandle {
                    kind: LockKind::Write,
                    thread: me,
                });
            }
            if token.is_cancelled() {
                state.queue.retain(|t| *t != ticket);
                drop(state);
                // The abandoned slot may unblock a successor or a reader.
                self.writers_cv.notify_all();
                self.readers_cv.notify_all();
                return Err(EngineError::Interrupted);
            }
            self.writers_cv.wait_for(&mut state, config.wait_slice);
        }
    }

    /// Releases one grant.
    ///
    /// Readers blocked only by a starved-writer window are woken first so a
    /// departing writer's peers do not jump ahead of them.
    pub fn release(&self, handle: LockHandle) {
        let mut state = self.state.lock();
        match handle.kind {
            LockKind::Read => {
                if let Some(count) = state.readers.get_mut(&handle.thread) {
                    *count -= 1;
                    if *count == 0 {
                        state.readers.remove(&handle.thread);
                    }
                }
            }
            LockKind::Write => {
                if state.writer == Some(handle.thread) {
                    state.write_depth -= 1;
                    if state.write_depth == 0 {
                        state.writer = None;
                    }
                }
            }
        }
        let idle = state.writer.is_none();
        drop(state);
        if idle {
            self.readers_cv.notify_all();
            self.writers_cv.notify_all();
        }
    }

    /// Releases a grant, lets other threads run, and reacquires the same
    /// kind of grant.
    ///
    /// The reacquisition goes through normal arbitration, so a yielding
    /// writer re-queues behind writers that arrived while it held the lock.
    pub fn yield_lock(
        &self,
        handle: LockHandle,
        token: &CancelToken,
        config: &Config,
    ) -> EngineResult<LockHandle> {
        let kind = handle.kind;
        self.release(handle);
        thread::yield_now();
        match kind {
            LockKind::Read => self.acquire_read(token, config),
            LockKind::Write => self.acquire_write(token, config),
        }
    }

    /// Returns true if the given thread currently holds exclusive access.
    #[must_use]
    pub fn is_writer(&self, thread: ThreadId) -> bool {
        self.state.lock().writer == Some(thread)
    }

    /// Returns true if the given thread holds any grant.
    #[must_use]
    pub fn holds_any(&self, thread: ThreadId) -> bool {
        let state = self.state.lock();
        state.writer == Some(thread) || state.readers.contains_key(&thread)
    }

    /// Captures the current arbitration state.
    #[must_use]
    pub fn snapshot(&self) -> ArbiterSnapshot {
        let state = self.state.lock();
        ArbiterSnapshot {
            writer: state.writer,
            write_depth: state.write_depth,
            reader_threads: state.readers.len(),
            queued_writers: state.queue.len(),
            bypass: state.bypass,
        }
    }
}
