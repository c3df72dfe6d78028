//! The domain façade.
//!
//! A [`Domain`] ties one [`Model`] to one lock arbiter, one option
//! registry, the listener lists, the validator slot, the commit sequence
//! counter, and the undo history. Captured mutations are routed to the
//! innermost active write transaction of the mutating thread through a
//! per-thread transaction stack; the model itself stays oblivious to
//! transactions.

use crate::arbiter::{Arbiter, LockHandle};
use crate::cancel::CancelToken;
use crate::change::{Change, ChangeDescription, ChangeRecorder, RecordedChange};
use crate::config::Config;
use crate::error::{EngineError, EngineResult, RollbackCause};
use crate::listener::{
    ListenerId, PostcommitEvent, PostcommitListener, PrecommitDecision, PrecommitEvent,
    PrecommitListener, TriggerCommand,
};
use crate::operation::UndoableOperation;
use crate::options::{OptionKey, OptionMap, OptionRegistry};
use crate::transaction::{Transaction, TxState};
use crate::types::{SequenceNumber, TransactionId};
use crate::validation::{blocking_findings, Validator};
use graphtx_model::{Model, Mutation};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

/// One entry of a thread's active-transaction stack.
struct ActiveTx {
    id: TransactionId,
    read_only: bool,
    options: OptionMap,
    state: TxState,
    recorder: Arc<Mutex<ChangeRecorder>>,
    handle: Option<LockHandle>,
}

impl ActiveTx {
    /// Advances a popped entry to its terminal state.
    ///
    /// The entry is dropped right after, but walking the remaining
    /// transitions keeps every lifecycle inside the state machine and lets
    /// debug builds assert the chain is complete.
    fn seal(&mut self, terminal: TxState) {
        let chain: &[TxState] = match terminal {
            TxState::Committed => &[TxState::Preparing, TxState::Committing, TxState::Committed],
            _ => &[TxState::RollingBack, TxState::RolledBack],
        };
        for &next in chain {
            if self.state.may_transition(next) {
                self.state = next;
            }
        }
        debug_assert_eq!(self.state, terminal);
    }
}

pub(crate) struct DomainShared {
    model: Model,
    arbiter: Arbiter,
    config: Config,
    registry: OptionRegistry,
    stacks: Mutex<HashMap<ThreadId, Vec<ActiveTx>>>,
    precommit: RwLock<Vec<(ListenerId, Arc<dyn PrecommitListener>)>>,
    postcommit: RwLock<Vec<(ListenerId, Arc<dyn PostcommitListener>)>>,
    validator: RwLock<Option<Arc<dyn Validator>>>,
    next_tx: AtomicU64,
    next_listener: AtomicU64,
    next_seq: AtomicU64,
    undo_stack: Mutex<Vec<Arc<ChangeDescription>>>,
    handler_failures: AtomicU64,
    in_commit: AtomicBool,
}

/// Transactional façade over one shared object graph.
pub struct Domain {
    shared: Arc<DomainShared>,
}

impl Domain {
    /// Creates a domain around a fresh, empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a domain with explicit configuration.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let shared = Arc::new(DomainShared {
            model: Model::new(),
            arbiter: Arbiter::new(),
            config,
            registry: OptionRegistry::standard(),
            stacks: Mutex::new(HashMap::new()),
            precommit: RwLock::new(Vec::new()),
            postcommit: RwLock::new(Vec::new()),
            validator: RwLock::new(None),
            next_tx: AtomicU64::new(0),
            next_listener: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            undo_stack: Mutex::new(Vec::new()),
            handler_failures: AtomicU64::new(0),
            in_commit: AtomicBool::new(false),
        });

        let gate_shared = Arc::downgrade(&shared);
        shared.model.set_edit_gate(Box::new(move |mutation| {
            match gate_shared.upgrade() {
                Some(shared) => shared.gate_mutation(mutation),
                None => Ok(()),
            }
        }));
        let capture_shared = Arc::downgrade(&shared);
        shared.model.add_observer(Box::new(move |mutation| {
            if let Some(shared) = capture_shared.upgrade() {
                shared.capture_mutation(mutation);
            }
        }));

        Self { shared }
    }

    /// The shared object graph.
    ///
    /// Mutations are rejected unless the calling thread is inside an
    /// active write transaction of this domain.
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.shared.model
    }

    /// Starts a transaction.
    ///
    /// With no transaction active on the calling thread this starts a
    /// root; otherwise the innermost active transaction becomes the
    /// parent and the given options are merged with its option map through
    /// the registry. `OptionKey::ReadOnly` selects a read transaction.
    pub fn start(&self, options: OptionMap) -> EngineResult<Transaction> {
        self.start_interruptible(options, CancelToken::new())
    }

    /// Starts a transaction whose blocking lock wait observes `token`.
    ///
    /// Cancellation during the wait surfaces [`EngineError::Interrupted`]
    /// and leaves no trace; the transaction never began.
    pub fn start_interruptible(
        &self,
        options: OptionMap,
        token: CancelToken,
    ) -> EngineResult<Transaction> {
        self.shared.clone().start(options, token)
    }

    /// Runs a closure inside a read transaction.
    pub fn run_exclusive<R>(&self, f: impl FnOnce(&Model) -> R) -> EngineResult<R> {
        self.run_exclusive_interruptible(CancelToken::new(), f)
    }

    /// Runs a closure inside a read transaction with a cancellable lock
    /// wait.
    pub fn run_exclusive_interruptible<R>(
        &self,
        token: CancelToken,
        f: impl FnOnce(&Model) -> R,
    ) -> EngineResult<R> {
        let tx = self.start_interruptible(
            OptionMap::new().with(OptionKey::ReadOnly, true),
            token,
        )?;
        let result = f(self.model());
        tx.commit()?;
        Ok(result)
    }

    /// Runs a closure inside a write transaction and commits on success.
    ///
    /// An `Err` from the closure rolls the transaction back before the
    /// error is returned.
    pub fn execute<R>(&self, f: impl FnOnce(&Model) -> EngineResult<R>) -> EngineResult<R> {
        self.execute_with(OptionMap::new(), f)
    }

    /// [`Domain::execute`] with explicit transaction options.
    pub fn execute_with<R>(
        &self,
        options: OptionMap,
        f: impl FnOnce(&Model) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let tx = self.start(options)?;
        match f(self.model()) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(error) => {
                tx.rollback(error.to_string())?;
                Err(error)
            }
        }
    }

    /// Registers a precommit listener; listeners run in registration
    /// order.
    pub fn add_precommit_listener(
        &self,
        listener: Arc<dyn PrecommitListener>,
    ) -> EngineResult<ListenerId> {
        self.shared.check_not_committing()?;
        let id = self.shared.fresh_listener_id();
        self.shared.precommit.write().push((id, listener));
        Ok(id)
    }

    /// Removes a precommit listener. Returns false if the id is unknown.
    pub fn remove_precommit_listener(&self, id: ListenerId) -> EngineResult<bool> {
        self.shared.check_not_committing()?;
        let mut listeners = self.shared.precommit.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        Ok(listeners.len() != before)
    }

    /// Registers a postcommit listener.
    pub fn add_postcommit_listener(
        &self,
        listener: Arc<dyn PostcommitListener>,
    ) -> EngineResult<ListenerId> {
        self.shared.check_not_committing()?;
        let id = self.shared.fresh_listener_id();
        self.shared.postcommit.write().push((id, listener));
        Ok(id)
    }

    /// Removes a postcommit listener. Returns false if the id is unknown.
    pub fn remove_postcommit_listener(&self, id: ListenerId) -> EngineResult<bool> {
        self.shared.check_not_committing()?;
        let mut listeners = self.shared.postcommit.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        Ok(listeners.len() != before)
    }

    /// Installs the commit-time model validator.
    pub fn set_validator(&self, validator: Arc<dyn Validator>) {
        *self.shared.validator.write() = Some(validator);
    }

    /// Removes the commit-time model validator.
    pub fn clear_validator(&self) {
        *self.shared.validator.write() = None;
    }

    /// Number of retained undo entries.
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.shared.undo_stack.lock().len()
    }

    /// Pops the most recent undo entry.
    ///
    /// Reverting it is the caller's job and must happen inside a write
    /// transaction opened with `NoNotifications`, so the replay is not
    /// captured as a fresh delta.
    #[must_use]
    pub fn pop_undo(&self) -> Option<Arc<ChangeDescription>> {
        self.shared.undo_stack.lock().pop()
    }

    /// Number of postcommit listener failures isolated so far.
    #[must_use]
    pub fn handler_failures(&self) -> u64 {
        self.shared.handler_failures.load(Ordering::Relaxed)
    }

    /// The arbiter, exposed for instrumentation and tests.
    #[must_use]
    pub fn arbiter(&self) -> &Arbiter {
        &self.shared.arbiter
    }

    /// The domain configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("nodes", &self.shared.model.node_count())
            .field("sequence", &self.shared.next_seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Clears the commit flag even on a panicking unwind out of a listener.
struct CommitFlag<'a>(&'a AtomicBool);

impl Drop for CommitFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DomainShared {
    fn fresh_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn check_not_committing(&self) -> EngineResult<()> {
        if self.in_commit.load(Ordering::SeqCst) {
            Err(EngineError::invalid_state(
                "listener lists are locked while a commit is in progress",
            ))
        } else {
            Ok(())
        }
    }

    /// Edit gate installed on the model: every mutation must come from the
    /// innermost transaction of the mutating thread, and that transaction
    /// must be a write transaction still accepting changes.
    fn gate_mutation(&self, _mutation: &Mutation) -> Result<(), String> {
        let stacks = self.stacks.lock();
        let me = thread::current().id();
        match stacks.get(&me).and_then(|stack| stack.last()) {
            None => Err("no active transaction on this thread".to_string()),
            Some(tx) if tx.read_only => Err("transaction is read-only".to_string()),
            Some(tx) if !matches!(tx.state, TxState::Active | TxState::Preparing) => {
                Err("transaction is no longer accepting changes".to_string())
            }
            Some(_) => Ok(()),
        }
    }

    /// Observer installed on the model: records the mutation into the
    /// innermost transaction's recorder.
    fn capture_mutation(&self, mutation: &Mutation) {
        let (recorder, silent) = {
            let stacks = self.stacks.lock();
            let me = thread::current().id();
            let Some(tx) = stacks.get(&me).and_then(|stack| stack.last()) else {
                warn!(?mutation, "mutation captured outside any transaction");
                return;
            };
            if tx.options.is_set(OptionKey::NoNotifications) {
                return;
            }
            (tx.recorder.clone(), tx.options.is_set(OptionKey::Silent))
        };
        recorder.lock().record(Change::from_mutation(mutation), silent);
    }

    fn fresh_tx_id(&self) -> TransactionId {
        TransactionId(self.next_tx.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn start(
        self: Arc<Self>,
        options: OptionMap,
        token: CancelToken,
    ) -> EngineResult<Transaction> {
        let me = thread::current().id();
        let parent = {
            let stacks = self.stacks.lock();
            stacks
                .get(&me)
                .and_then(|stack| stack.last())
                .map(|tx| (tx.id, tx.read_only, tx.options.clone()))
        };

        let merged = self
            .registry
            .merge(parent.as_ref().map(|(_, _, options)| options), options);
        let read_only = merged.is_set(OptionKey::ReadOnly);

        if let Some((parent_id, parent_read_only, _)) = &parent {
            if *parent_read_only && !read_only {
                debug!(parent = %parent_id, "write child rejected under read-only parent");
                return Err(EngineError::LockUpgrade);
            }
        }

        // The stacks mutex is never held across a blocking lock wait; for
        // a nested transaction the acquisition is reentrant and immediate.
        let handle = if read_only {
            self.arbiter.acquire_read(&token, &self.config)?
        } else {
            self.arbiter.acquire_write(&token, &self.config)?
        };

        let id = self.fresh_tx_id();
        debug!(transaction = %id, read_only, nested = parent.is_some(), "transaction started");
        {
            let mut stacks = self.stacks.lock();
            stacks.entry(me).or_default().push(ActiveTx {
                id,
                read_only,
                options: merged,
                state: TxState::Active,
                recorder: Arc::new(Mutex::new(ChangeRecorder::new())),
                handle: Some(handle),
            });
        }

        let parent_id = parent.map(|(id, _, _)| id);
        Ok(Transaction::new(self, id, parent_id, read_only, token))
    }

    pub(crate) fn tx_state(&self, id: TransactionId) -> Option<TxState> {
        let stacks = self.stacks.lock();
        stacks
            .values()
            .flatten()
            .find(|tx| tx.id == id)
            .map(|tx| tx.state)
    }

    pub(crate) fn wrap_operation(
        &self,
        id: TransactionId,
        op: Arc<dyn UndoableOperation>,
    ) -> EngineResult<()> {
        let (recorder, silent) = {
            let stacks = self.stacks.lock();
            let me = thread::current().id();
            let tx = stacks
                .get(&me)
                .and_then(|stack| stack.last())
                .filter(|tx| tx.id == id)
                .ok_or_else(|| {
                    EngineError::invalid_state("transaction is not the innermost on this thread")
                })?;
            if tx.state != TxState::Active {
                return Err(EngineError::invalid_state(
                    "transaction is no longer accepting changes",
                ));
            }
            (tx.recorder.clone(), tx.options.is_set(OptionKey::Silent))
        };

        op.execute().map_err(|message| {
            EngineError::invalid_state(format!("operation '{}' failed: {message}", op.label()))
        })?;
        recorder.lock().record(Change::External(op), silent);
        Ok(())
    }

    pub(crate) fn yield_transaction(
        &self,
        id: TransactionId,
        token: &CancelToken,
    ) -> EngineResult<()> {
        let me = thread::current().id();
        let (handle, read_only) = {
            let mut stacks = self.stacks.lock();
            let tx = stacks
                .get_mut(&me)
                .and_then(|stack| stack.last_mut())
                .filter(|tx| tx.id == id)
                .ok_or_else(|| {
                    EngineError::invalid_state("transaction is not the innermost on this thread")
                })?;
            if !tx.read_only && !tx.recorder.lock().is_empty() {
                // A dirty writer must not expose mid-transaction state;
                // give other threads a slice without releasing the lock.
                drop(stacks);
                thread::yield_now();
                return Ok(());
            }
            let handle = tx.handle.take().ok_or_else(|| {
                EngineError::invalid_state("transaction holds no lock grant")
            })?;
            (handle, tx.read_only)
        };

        match self.arbiter.yield_lock(handle, token, &self.config) {
            Ok(handle) => {
                let mut stacks = self.stacks.lock();
                if let Some(tx) = stacks
                    .get_mut(&me)
                    .and_then(|stack| stack.last_mut())
                    .filter(|tx| tx.id == id)
                {
                    tx.handle = Some(handle);
                    Ok(())
                } else {
                    // Stack changed under us; impossible on a single
                    // thread, but do not leak the grant.
                    self.arbiter.release(handle);
                    Err(EngineError::invalid_state("transaction vanished during yield"))
                }
            }
            Err(error) => {
                debug!(transaction = %id, read_only, %error, "yield reacquisition failed");
                // The grant is gone; unwind the transaction.
                self.rollback_from(id);
                Err(error)
            }
        }
    }

    /// Rolls back the given transaction, and any transaction nested above
    /// it that its owner dropped out of order.
    fn rollback_from(&self, id: TransactionId) {
        let me = thread::current().id();
        loop {
            let entry = {
                let mut stacks = self.stacks.lock();
                let Some(stack) = stacks.get_mut(&me) else {
                    return;
                };
                if !stack.iter().any(|tx| tx.id == id) {
                    return;
                }
                stack.pop()
            };
            let Some(mut entry) = entry else { return };
            if entry.id != id {
                warn!(
                    abandoned = %entry.id,
                    target = %id,
                    "rolling back transaction nested above a finished parent"
                );
            }
            entry.state = TxState::RollingBack;
            entry.recorder.lock().revert_all(&self.model);
            if let Some(handle) = entry.handle.take() {
                self.arbiter.release(handle);
            }
            entry.seal(TxState::RolledBack);
            if entry.id == id {
                return;
            }
        }
    }

    pub(crate) fn rollback_transaction(
        &self,
        id: TransactionId,
        cause: RollbackCause,
    ) -> EngineResult<()> {
        debug!(transaction = %id, %cause, "rolling back");
        self.rollback_from(id);
        Ok(())
    }

    fn fail_commit(&self, id: TransactionId, cause: RollbackCause) -> EngineError {
        self.rollback_from(id);
        EngineError::Rollback(cause)
    }

    pub(crate) fn commit_transaction(&self, id: TransactionId) -> EngineResult<Option<SequenceNumber>> {
        let me = thread::current().id();
        let (root, read_only, options, recorder) = {
            let stacks = self.stacks.lock();
            let stack = stacks
                .get(&me)
                .filter(|stack| stack.last().is_some_and(|tx| tx.id == id))
                .ok_or_else(|| {
                    EngineError::invalid_state("transaction is not the innermost on this thread")
                })?;
            let tx = stack.last().ok_or_else(|| {
                EngineError::invalid_state("transaction is not the innermost on this thread")
            })?;
            if tx.state != TxState::Active {
                return Err(EngineError::invalid_state(
                    "transaction is not in a committable state",
                ));
            }
            (
                stack.len() == 1,
                tx.read_only,
                tx.options.clone(),
                tx.recorder.clone(),
            )
        };

        if read_only {
            return self.commit_read(id);
        }
        if !root {
            return self.commit_child(id, &options, &recorder);
        }
        self.commit_root(id, &options, &recorder)
    }

    /// A read transaction has nothing to publish; commit is release.
    fn commit_read(&self, id: TransactionId) -> EngineResult<Option<SequenceNumber>> {
        let mut entry = self.pop_innermost(id)?;
        if let Some(handle) = entry.handle.take() {
            self.arbiter.release(handle);
        }
        entry.seal(TxState::Committed);
        debug!(transaction = %id, "read transaction finished");
        Ok(None)
    }

    /// The commit phases shared by every write transaction: precommit
    /// fixpoint, validation, freeze. Children run them over their own delta
    /// before it merges upward; only publication is reserved for the root.
    fn prepare_commit(
        &self,
        id: TransactionId,
        options: &OptionMap,
        recorder: &Arc<Mutex<ChangeRecorder>>,
    ) -> EngineResult<()> {
        self.set_state(id, TxState::Preparing);
        self.in_commit.store(true, Ordering::SeqCst);
        let flag = CommitFlag(&self.in_commit);

        self.run_precommit_chain(id, recorder)?;

        if !options.is_set(OptionKey::NoValidation) {
            let validator = self.validator.read().clone();
            if let Some(validator) = validator {
                let changes = recorder.lock().snapshot();
                let findings = validator.validate(&self.model, &changes);
                let (blocking, accepted) = blocking_findings(findings);
                for finding in &accepted {
                    warn!(transaction = %id, %finding, "validation finding");
                }
                if !blocking.is_empty() {
                    return Err(self.fail_commit(id, RollbackCause::ValidationFailed(blocking)));
                }
            }
        }

        self.set_state(id, TxState::Committing);
        recorder.lock().freeze();
        drop(flag);
        Ok(())
    }

    /// A nested commit runs the same precommit pipeline over the child's
    /// delta, then merges it into the parent recorder, or drops it when the
    /// child blocks change propagation.
    fn commit_child(
        &self,
        id: TransactionId,
        options: &OptionMap,
        recorder: &Arc<Mutex<ChangeRecorder>>,
    ) -> EngineResult<Option<SequenceNumber>> {
        self.prepare_commit(id, options, recorder)?;

        let blocking = options.is_set(OptionKey::AllowChangePropagationBlocking);
        let mut entry = self.pop_innermost(id)?;
        let changes = entry.recorder.lock().drain();

        {
            let mut stacks = self.stacks.lock();
            let me = thread::current().id();
            if let Some(parent) = stacks.get_mut(&me).and_then(|stack| stack.last_mut()) {
                if blocking {
                    // The child's effects stay applied but leave the parent's
                    // delta, so the parent's rollback (and any wrapped
                    // operation's undo) cannot run over them again.
                    parent.options.insert(OptionKey::BlockingApplied, true);
                    debug!(
                        transaction = %id,
                        parent = %parent.id,
                        dropped = changes.len(),
                        "child delta withheld from parent"
                    );
                } else {
                    parent.recorder.lock().extend(changes);
                }
            }
        }

        if let Some(handle) = entry.handle.take() {
            self.arbiter.release(handle);
        }
        entry.seal(TxState::Committed);
        debug!(transaction = %id, "child transaction merged");
        Ok(None)
    }

    /// Root write commit: the shared prepare phases, then publication.
    fn commit_root(
        &self,
        id: TransactionId,
        options: &OptionMap,
        recorder: &Arc<Mutex<ChangeRecorder>>,
    ) -> EngineResult<Option<SequenceNumber>> {
        self.prepare_commit(id, options, recorder)?;

        let mut entry = self.pop_innermost(id)?;
        let changes = entry.recorder.lock().drain();
        let handle = entry.handle.take();
        entry.seal(TxState::Committed);

        if changes.is_empty() {
            if let Some(handle) = handle {
                self.arbiter.release(handle);
            }
            debug!(transaction = %id, "empty transaction committed");
            return Ok(None);
        }

        let sequence = SequenceNumber(self.next_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let description = Arc::new(ChangeDescription {
            transaction: id,
            sequence,
            changes,
        });
        let keep_undo = !options.is_set(OptionKey::NoUndo);
        if keep_undo {
            self.undo_stack.lock().push(description.clone());
        }

        // Publication is complete once the lock is released; postcommit
        // listeners run outside it and may start their own transactions.
        if let Some(handle) = handle {
            self.arbiter.release(handle);
        }
        debug!(transaction = %id, %sequence, changes = description.changes.len(), "committed");

        if !options.is_set(OptionKey::Silent) {
            self.notify_postcommit(id, sequence, &description, keep_undo);
        }
        Ok(Some(sequence))
    }

    /// Runs the precommit listener chain to fixpoint.
    ///
    /// Each round walks the listeners in registration order over a snapshot
    /// of the delta. Triggers collected in a round run afterwards, inside
    /// the transaction, and force another round. The loop is bounded by
    /// `Config::max_trigger_iterations`.
    fn run_precommit_chain(
        &self,
        id: TransactionId,
        recorder: &Arc<Mutex<ChangeRecorder>>,
    ) -> EngineResult<()> {
        let listeners = self.precommit.read().clone();
        if listeners.is_empty() {
            return Ok(());
        }

        for _round in 0..self.config.max_trigger_iterations {
            let changes = recorder.lock().snapshot();
            let event = PrecommitEvent {
                transaction: id,
                model: &self.model,
                changes: &changes,
            };

            let mut triggers: Vec<(String, Box<dyn TriggerCommand>)> = Vec::new();
            for (_, listener) in &listeners {
                let name = listener.name().to_string();
                let decision =
                    catch_unwind(AssertUnwindSafe(|| listener.transaction_about_to_commit(&event)));
                match decision {
                    Ok(PrecommitDecision::Proceed) => {}
                    Ok(PrecommitDecision::Veto(diagnostic)) => {
                        return Err(self.fail_commit(
                            id,
                            RollbackCause::Veto {
                                listener: name,
                                diagnostic,
                            },
                        ));
                    }
                    Ok(PrecommitDecision::Trigger(command)) => {
                        triggers.push((name, command));
                    }
                    Err(payload) => {
                        return Err(self.fail_commit(
                            id,
                            RollbackCause::ListenerFailure {
                                listener: name,
                                message: panic_message(&*payload),
                            },
                        ));
                    }
                }
            }
            drop(event);

            if triggers.is_empty() {
                return Ok(());
            }
            for (listener, command) in triggers {
                let outcome = catch_unwind(AssertUnwindSafe(|| command.execute(&self.model)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(diagnostic)) => {
                        return Err(self.fail_commit(
                            id,
                            RollbackCause::ListenerFailure {
                                listener,
                                message: format!(
                                    "trigger '{}' failed: {diagnostic}",
                                    command.describe()
                                ),
                            },
                        ));
                    }
                    Err(payload) => {
                        return Err(self.fail_commit(
                            id,
                            RollbackCause::ListenerFailure {
                                listener,
                                message: format!(
                                    "trigger '{}' panicked: {}",
                                    command.describe(),
                                    panic_message(&*payload)
                                ),
                            },
                        ));
                    }
                }
            }
        }

        Err(self.fail_commit(
            id,
            RollbackCause::TriggerLoopExceeded {
                limit: self.config.max_trigger_iterations,
            },
        ))
    }

    fn notify_postcommit(
        &self,
        id: TransactionId,
        sequence: SequenceNumber,
        description: &Arc<ChangeDescription>,
        keep_undo: bool,
    ) {
        let listeners = self.postcommit.read().clone();
        if listeners.is_empty() {
            return;
        }
        let event = PostcommitEvent {
            transaction: id,
            sequence,
            changes: description
                .reportable()
                .into_iter()
                .cloned()
                .collect::<Vec<RecordedChange>>(),
            description: keep_undo.then(|| description.clone()),
        };
        for (_, listener) in listeners {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| listener.transaction_committed(&event)));
            if let Err(payload) = outcome {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    listener = listener.name(),
                    message = panic_message(&*payload),
                    "postcommit listener panicked"
                );
            }
        }
    }

    fn set_state(&self, id: TransactionId, state: TxState) {
        let mut stacks = self.stacks.lock();
        let me = thread::current().id();
        if let Some(tx) = stacks
            .get_mut(&me)
            .and_then(|stack| stack.iter_mut().find(|tx| tx.id == id))
        {
            debug_assert!(tx.state.may_transition(state) || tx.state == state);
            tx.state = state;
        }
    }

    fn pop_innermost(&self, id: TransactionId) -> EngineResult<ActiveTx> {
        let mut stacks = self.stacks.lock();
        let me = thread::current().id();
        let stack = stacks.get_mut(&me).ok_or_else(|| {
            EngineError::invalid_state("no transactions active on this thread")
        })?;
        if !stack.last().is_some_and(|tx| tx.id == id) {
            return Err(EngineError::invalid_state(
                "transaction is not the innermost on this thread",
            ));
        }
        let entry = stack.pop().ok_or_else(|| {
            EngineError::invalid_state("no transactions active on this thread")
        })?;
        if stack.is_empty() {
            stacks.remove(&me);
        }
        Ok(entry)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{FnPostcommit, FnPrecommit, FnTrigger};
    use crate::validation::FnValidator;
    use graphtx_model::Value;
    use std::sync::atomic::AtomicUsize;

    fn text(s: &str) -> Option<Value> {
        Some(Value::Text(s.to_string()))
    }

    #[test]
    fn commit_publishes_sequence() {
        let domain = Domain::new();
        let tx = domain.start(OptionMap::new()).unwrap();
        let node = domain.model().create_node().unwrap();
        domain.model().set_attr(node, "name", text("a")).unwrap();
        let seq = tx.commit().unwrap();
        assert_eq!(seq, Some(SequenceNumber::new(1)));
        assert_eq!(domain.undo_depth(), 1);
    }

    #[test]
    fn empty_commit_has_no_sequence() {
        let domain = Domain::new();
        let tx = domain.start(OptionMap::new()).unwrap();
        assert_eq!(tx.commit().unwrap(), None);
        assert_eq!(domain.undo_depth(), 0);
    }

    #[test]
    fn mutation_outside_transaction_is_rejected() {
        let domain = Domain::new();
        assert!(domain.model().create_node().is_err());
    }

    #[test]
    fn mutation_in_read_transaction_is_rejected() {
        let domain = Domain::new();
        domain
            .run_exclusive(|model| {
                assert!(model.create_node().is_err());
            })
            .unwrap();
    }

    #[test]
    fn rollback_restores_prior_state() {
        let domain = Domain::new();
        let node = domain
            .execute(|model| {
                let node = model.create_node()?;
                model.set_attr(node, "name", text("before"))?;
                Ok(node)
            })
            .unwrap();

        let tx = domain.start(OptionMap::new()).unwrap();
        domain.model().set_attr(node, "name", text("after")).unwrap();
        let extra = domain.model().create_node().unwrap();
        tx.rollback("changed my mind").unwrap();

        assert_eq!(domain.model().attr(node, "name"), text("before"));
        assert!(!domain.model().contains(extra));
    }

    #[test]
    fn drop_rolls_back() {
        let domain = Domain::new();
        {
            let _tx = domain.start(OptionMap::new()).unwrap();
            domain.model().create_node().unwrap();
        }
        assert_eq!(domain.model().node_count(), 0);
        // The lock was released by the drop as well.
        domain.execute(|model| Ok(model.create_node().map(|_| ())?)).unwrap();
    }

    #[test]
    fn nested_commit_merges_into_parent() {
        let domain = Domain::new();
        let outer = domain.start(OptionMap::new()).unwrap();
        let node = domain.model().create_node().unwrap();

        let inner = domain.start(OptionMap::new()).unwrap();
        domain.model().set_attr(node, "name", text("inner")).unwrap();
        inner.commit().unwrap();

        // The child's change rolls back with the outer transaction.
        outer.rollback("outer").unwrap();
        assert_eq!(domain.model().node_count(), 0);
    }

    #[test]
    fn nested_rollback_keeps_parent_changes() {
        let domain = Domain::new();
        let outer = domain.start(OptionMap::new()).unwrap();
        let node = domain.model().create_node().unwrap();
        domain.model().set_attr(node, "name", text("outer")).unwrap();

        let inner = domain.start(OptionMap::new()).unwrap();
        domain.model().set_attr(node, "name", text("inner")).unwrap();
        inner.rollback("inner only").unwrap();

        assert_eq!(domain.model().attr(node, "name"), text("outer"));
        outer.commit().unwrap();
        assert_eq!(domain.model().attr(node, "name"), text("outer"));
    }

    #[test]
    fn precommit_chain_runs_at_child_commit() {
        let domain = Domain::new();
        let rounds = Arc::new(AtomicUsize::new(0));
        let counter = rounds.clone();
        domain
            .add_precommit_listener(Arc::new(FnPrecommit::new("count", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                PrecommitDecision::Proceed
            })))
            .unwrap();

        let outer = domain.start(OptionMap::new()).unwrap();
        let node = domain.model().create_node().unwrap();

        let inner = domain.start(OptionMap::new()).unwrap();
        domain.model().set_attr(node, "name", text("inner")).unwrap();
        inner.commit().unwrap();
        // The child's commit boundary ran the chain over its own delta.
        assert_eq!(rounds.load(Ordering::SeqCst), 1);

        outer.commit().unwrap();
        assert_eq!(rounds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn child_commit_veto_rolls_back_only_the_child() {
        let domain = Domain::new();
        let anchor = domain.execute(|model| Ok(model.create_node()?)).unwrap();

        let outer = domain.start(OptionMap::new()).unwrap();
        domain.model().set_attr(anchor, "outer", text("kept")).unwrap();

        let veto = domain
            .add_precommit_listener(Arc::new(FnPrecommit::new("veto-all", |_| {
                PrecommitDecision::Veto(crate::error::Diagnostic::error("rejected"))
            })))
            .unwrap();
        let inner = domain.start(OptionMap::new()).unwrap();
        domain.model().set_attr(anchor, "inner", text("lost")).unwrap();
        let error = inner.commit().unwrap_err();
        assert!(matches!(
            error.rollback_cause(),
            Some(RollbackCause::Veto { listener, .. }) if listener == "veto-all"
        ));

        // Only the child was unwound; the parent stays active and commits.
        assert_eq!(domain.model().attr(anchor, "inner"), None);
        assert_eq!(domain.model().attr(anchor, "outer"), text("kept"));
        domain.remove_precommit_listener(veto).unwrap();
        outer.commit().unwrap();
        assert_eq!(domain.model().attr(anchor, "outer"), text("kept"));
    }

    #[test]
    fn veto_leaves_model_unchanged() {
        let domain = Domain::new();
        let state_before = domain.model().state();
        domain
            .add_precommit_listener(Arc::new(FnPrecommit::new("veto-all", |_| {
                PrecommitDecision::Veto(crate::error::Diagnostic::error("rejected"))
            })))
            .unwrap();

        let tx = domain.start(OptionMap::new()).unwrap();
        domain.model().create_node().unwrap();
        let error = tx.commit().unwrap_err();

        assert!(matches!(
            error.rollback_cause(),
            Some(RollbackCause::Veto { listener, .. }) if listener == "veto-all"
        ));
        assert_eq!(domain.model().state(), state_before);
    }

    #[test]
    fn trigger_changes_join_the_delta() {
        let domain = Domain::new();
        domain
            .add_precommit_listener(Arc::new(FnPrecommit::new("ensure-two-nodes", |event| {
                if event.model.node_count() < 2 {
                    PrecommitDecision::Trigger(Box::new(FnTrigger::new(
                        "add node",
                        |model: &Model| {
                            model
                                .create_node()
                                .map(|_| ())
                                .map_err(|e| crate::error::Diagnostic::error(e.to_string()))
                        },
                    )))
                } else {
                    PrecommitDecision::Proceed
                }
            })))
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_listener = seen.clone();
        domain
            .add_postcommit_listener(Arc::new(FnPostcommit::new("count", move |event| {
                seen_in_listener.store(event.changes.len(), Ordering::SeqCst);
            })))
            .unwrap();

        let tx = domain.start(OptionMap::new()).unwrap();
        domain.model().create_node().unwrap();
        tx.commit().unwrap();

        assert_eq!(domain.model().node_count(), 2);
        // Original create plus the triggered one, both in the published delta.
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_converging_trigger_fails_closed() {
        let domain = Domain::with_config(Config::new().max_trigger_iterations(4));
        domain
            .add_precommit_listener(Arc::new(FnPrecommit::new("always-more", |_| {
                PrecommitDecision::Trigger(Box::new(FnTrigger::new(
                    "add node",
                    |model: &Model| {
                        model
                            .create_node()
                            .map(|_| ())
                            .map_err(|e| crate::error::Diagnostic::error(e.to_string()))
                    },
                )))
            })))
            .unwrap();

        let tx = domain.start(OptionMap::new()).unwrap();
        domain.model().create_node().unwrap();
        let error = tx.commit().unwrap_err();

        assert!(matches!(
            error.rollback_cause(),
            Some(RollbackCause::TriggerLoopExceeded { limit: 4 })
        ));
        // Everything, triggered nodes included, was rolled back.
        assert_eq!(domain.model().node_count(), 0);
    }

    #[test]
    fn panicking_precommit_listener_is_a_veto() {
        let domain = Domain::new();
        domain
            .add_precommit_listener(Arc::new(FnPrecommit::new("broken", |_| {
                panic!("listener bug")
            })))
            .unwrap();

        let tx = domain.start(OptionMap::new()).unwrap();
        domain.model().create_node().unwrap();
        let error = tx.commit().unwrap_err();

        assert!(matches!(
            error.rollback_cause(),
            Some(RollbackCause::ListenerFailure { listener, message })
                if listener == "broken" && message.contains("listener bug")
        ));
        assert_eq!(domain.model().node_count(), 0);
    }

    #[test]
    fn panicking_postcommit_listener_is_isolated() {
        let domain = Domain::new();
        domain
            .add_postcommit_listener(Arc::new(FnPostcommit::new("broken", |_| {
                panic!("observer bug")
            })))
            .unwrap();

        domain.execute(|model| Ok(model.create_node().map(|_| ())?)).unwrap();
        assert_eq!(domain.handler_failures(), 1);
        assert_eq!(domain.model().node_count(), 1);
    }

    #[test]
    fn validation_error_blocks_commit() {
        let domain = Domain::new();
        domain.set_validator(Arc::new(FnValidator::new(|model: &Model, _| {
            if model.node_count() > 0 {
                vec![crate::error::Diagnostic::error("no nodes allowed")]
            } else {
                Vec::new()
            }
        })));

        let tx = domain.start(OptionMap::new()).unwrap();
        domain.model().create_node().unwrap();
        let error = tx.commit().unwrap_err();
        assert!(matches!(
            error.rollback_cause(),
            Some(RollbackCause::ValidationFailed(findings)) if findings.len() == 1
        ));
        assert_eq!(domain.model().node_count(), 0);

        let no_validation = OptionMap::new().with(OptionKey::NoValidation, true);
        domain
            .execute_with(no_validation, |model| Ok(model.create_node().map(|_| ())?))
            .unwrap();
        assert_eq!(domain.model().node_count(), 1);
    }

    #[test]
    fn silent_commit_skips_postcommit_event() {
        let domain = Domain::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let notified_in_listener = notified.clone();
        domain
            .add_postcommit_listener(Arc::new(FnPostcommit::new("count", move |_| {
                notified_in_listener.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();

        let silent = OptionMap::new().with(OptionKey::Silent, true);
        domain
            .execute_with(silent, |model| Ok(model.create_node().map(|_| ())?))
            .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        domain.execute(|model| Ok(model.create_node().map(|_| ())?)).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_undo_commit_keeps_history_clean() {
        let domain = Domain::new();
        let no_undo = OptionMap::new().with(OptionKey::NoUndo, true);
        domain
            .execute_with(no_undo, |model| Ok(model.create_node().map(|_| ())?))
            .unwrap();
        assert_eq!(domain.undo_depth(), 0);
    }

    #[test]
    fn pop_undo_supports_manual_revert() {
        let domain = Domain::new();
        let node = domain
            .execute(|model| {
                let node = model.create_node()?;
                model.set_attr(node, "name", text("v1"))?;
                Ok(node)
            })
            .unwrap();

        let description = domain.pop_undo().unwrap();
        let no_capture = OptionMap::new().with(OptionKey::NoNotifications, true);
        domain
            .execute_with(no_capture, |model| {
                description.revert(model);
                Ok(())
            })
            .unwrap();

        assert!(!domain.model().contains(node));
        assert_eq!(domain.undo_depth(), 0);
    }

    #[test]
    fn blocking_child_keeps_changes_out_of_parent_delta() {
        let domain = Domain::new();
        let anchor = domain
            .execute(|model| Ok(model.create_node()?))
            .unwrap();

        let outer = domain.start(OptionMap::new()).unwrap();
        domain.model().set_attr(anchor, "outer", text("yes")).unwrap();

        let blocking = OptionMap::new().with(OptionKey::AllowChangePropagationBlocking, true);
        let inner = domain.start(blocking).unwrap();
        domain.model().set_attr(anchor, "inner", text("kept")).unwrap();
        inner.commit().unwrap();

        // Outer rollback reverts only the outer change; the blocked child
        // delta stays applied.
        outer.rollback("outer undone").unwrap();
        assert_eq!(domain.model().attr(anchor, "outer"), None);
        assert_eq!(domain.model().attr(anchor, "inner"), text("kept"));
    }

    #[test]
    fn wrapped_operation_round_trips_with_rollback() {
        use crate::operation::FnOperation;

        let domain = Domain::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (a, b, c) = (counter.clone(), counter.clone(), counter.clone());
        let op = Arc::new(FnOperation::new(
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
        ));

        let tx = domain.start(OptionMap::new()).unwrap();
        domain.model().create_node().unwrap();
        tx.wrap_operation(op).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tx.rollback("abort both").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(domain.model().node_count(), 0);
    }

    #[test]
    fn nested_external_operations_undo_once_on_outer_rollback() {
        use crate::operation::FnOperation;

        let domain = Domain::new();
        let outer_undos = Arc::new(AtomicUsize::new(0));
        let inner_undos = Arc::new(AtomicUsize::new(0));
        let blocking = OptionMap::new().with(OptionKey::AllowChangePropagationBlocking, true);

        let outer = domain.start(blocking.clone()).unwrap();
        let undos = outer_undos.clone();
        outer
            .wrap_operation(Arc::new(FnOperation::new(
                "outer work",
                || Ok(()),
                move || {
                    undos.fetch_add(1, Ordering::SeqCst);
                },
                || {},
            )))
            .unwrap();

        let inner = domain.start(blocking).unwrap();
        let undos = inner_undos.clone();
        inner
            .wrap_operation(Arc::new(FnOperation::new(
                "inner work",
                || Ok(()),
                move || {
                    undos.fetch_add(1, Ordering::SeqCst);
                },
                || {},
            )))
            .unwrap();
        inner.commit().unwrap();

        // The committed child blocked propagation, so the outer rollback
        // runs only the outer operation's undo, exactly once.
        outer.rollback("abandon").unwrap();
        assert_eq!(outer_undos.load(Ordering::SeqCst), 1);
        assert_eq!(inner_undos.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reentrant_nesting_never_self_blocks() {
        let domain = Domain::new();
        let outer = domain.start(OptionMap::new()).unwrap();
        let read_opts = OptionMap::new().with(OptionKey::ReadOnly, true);
        let read = domain.start(read_opts).unwrap();
        read.commit().unwrap();
        let inner = domain.start(OptionMap::new()).unwrap();
        inner.commit().unwrap();
        outer.commit().unwrap();
    }

    #[test]
    fn write_child_under_read_parent_is_rejected() {
        let domain = Domain::new();
        let read_opts = OptionMap::new().with(OptionKey::ReadOnly, true);
        let read = domain.start(read_opts).unwrap();
        let error = domain.start(OptionMap::new()).unwrap_err();
        assert!(matches!(error, EngineError::LockUpgrade));
        read.commit().unwrap();
    }

    #[test]
    fn listener_registration_rejected_mid_commit() {
        let domain = Arc::new(Domain::new());
        let inner = domain.clone();
        domain
            .add_precommit_listener(Arc::new(FnPrecommit::new("re-register", move |_| {
                let result = inner.add_precommit_listener(Arc::new(FnPrecommit::new(
                    "late",
                    |_| PrecommitDecision::Proceed,
                )));
                assert!(result.is_err());
                PrecommitDecision::Proceed
            })))
            .unwrap();

        domain.execute(|model| Ok(model.create_node().map(|_| ())?)).unwrap();
    }

    #[test]
    fn every_lifecycle_reaches_a_terminal_state() {
        // seal() asserts in debug builds that each finished entry walked the
        // full transition chain; drive every commit and rollback shape
        // through it.
        let domain = Domain::new();
        domain.run_exclusive(|_| {}).unwrap();

        let outer = domain.start(OptionMap::new()).unwrap();
        domain.model().create_node().unwrap();
        let inner = domain.start(OptionMap::new()).unwrap();
        domain.model().create_node().unwrap();
        inner.commit().unwrap();
        outer.commit().unwrap();

        let tx = domain.start(OptionMap::new()).unwrap();
        domain.model().create_node().unwrap();
        tx.rollback("done").unwrap();
    }
}
