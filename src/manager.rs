// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The transaction manager façade.
//!
//! A [`TransactionManager`] coordinates exclusive, undoable access of many
//! threads to a fixed set of registered resources. Each thread runs at most
//! one transaction at a time; the state store is an explicit lookup table
//! keyed by [`ThreadId`], so "one transaction per execution context" is a
//! table invariant rather than ambient thread-local state.
//!
//! The protocol for a contended acquisition:
//!
//! 1. Under the global critical section, try the resource's [`QueueLock`].
//!    A free resource is granted without blocking.
//! 2. Otherwise the caller is queued, its wait-for edge is recorded and the
//!    deadlock detector walks the chain while the critical section is still
//!    held. A caller selected as victim fails with `Aborted` before ever
//!    blocking.
//! 3. The critical section is dropped and the caller blocks on the lock,
//!    cancellable through its [`CancelToken`]. Ownership is handed over by
//!    the releasing transaction, FIFO per resource.
//!
//! The critical section is only ever held for table and graph bookkeeping,
//! never across a blocking wait.

use crate::{
    cancel::{CancelReason, CancelToken},
    errors::TxError,
    graph::WaitGraph,
    qlock::QueueLock,
    types::{MonotonicTime, Resource, ResourceId, ResourceOperation, TimeSource, TxId},
    Result,
};
use log::{info, warn};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, ThreadId},
};

/// How [`TransactionManager::execute`] reacts when the transaction is
/// sacrificed to break a deadlock.
#[derive(Debug, Clone, Copy)]
pub enum Strategy {
    /// Roll back and run the transaction again until it commits.
    Retry,

    /// Roll back and report `Aborted` to the caller.
    Abort,
}

/// One applied operation, retained for rollback.
struct LogEntry<R>
where
    R: Resource,
{
    op: Box<dyn ResourceOperation<R>>,
    resource: Arc<R>,
}

struct TxBody<R>
where
    R: Resource,
{
    owned: HashSet<ResourceId>,
    undo: Vec<LogEntry<R>>,
}

/// Per-transaction record in the state store.
pub(crate) struct TxState<R>
where
    R: Resource,
{
    id: TxId,
    started: u64,
    aborted: AtomicBool,
    token: CancelToken,
    // owned set and undo log; only ever touched by the owning thread
    body: Mutex<TxBody<R>>,
}

struct Slot<R>
where
    R: Resource,
{
    resource: Arc<R>,
    lock: QueueLock,
}

/// Tables behind the global critical section.
struct Core<R>
where
    R: Resource,
{
    threads: HashMap<ThreadId, Arc<TxState<R>>>,
    active: HashMap<TxId, Arc<TxState<R>>>,
    graph: WaitGraph,
}

/// Coordinates transactions of many threads over a fixed resource registry.
///
/// The registry is immutable after construction; resources are never
/// duplicated and live behind `Arc` for the undo log's sake.
pub struct TransactionManager<R>
where
    R: Resource,
{
    slots: HashMap<ResourceId, Slot<R>>,
    core: Mutex<Core<R>>,
    next_id: AtomicU64,
    time: Arc<dyn TimeSource>,
}

impl<R> TransactionManager<R>
where
    R: Resource,
{
    /// Creates a manager over `resources` with the default monotonic time
    /// source.
    pub fn new(resources: impl IntoIterator<Item = R>) -> Self {
        Self::with_time_source(resources, Arc::new(MonotonicTime))
    }

    /// Creates a manager with a caller-supplied [`TimeSource`].
    pub fn with_time_source(resources: impl IntoIterator<Item = R>, time: Arc<dyn TimeSource>) -> Self {
        let slots = resources
            .into_iter()
            .map(|resource| {
                (
                    resource.id(),
                    Slot {
                        resource: Arc::new(resource),
                        lock: QueueLock::new(),
                    },
                )
            })
            .collect();

        Self {
            slots,
            core: Mutex::new(Core {
                threads: HashMap::new(),
                active: HashMap::new(),
                graph: WaitGraph::new(),
            }),
            next_id: AtomicU64::new(0),
            time,
        }
    }

    /// Starts a transaction in the calling thread.
    pub fn start(&self) -> Result<()> {
        let mut core = self.core.lock().expect("core tables poisoned");
        let key = thread::current().id();

        if core.threads.contains_key(&key) {
            return Err(TxError::AlreadyActive);
        }

        let id = TxId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let started = self.time.now();
        let tx = Arc::new(TxState {
            id,
            started,
            aborted: AtomicBool::new(false),
            token: CancelToken::new(),
            body: Mutex::new(TxBody {
                owned: HashSet::new(),
                undo: Vec::new(),
            }),
        });

        core.threads.insert(key, tx.clone());
        core.active.insert(id, tx);

        info!("TRANSACTION({}): START (time {})", id, started);
        Ok(())
    }

    /// Applies `operation` to the resource `rid` inside the calling thread's
    /// transaction, acquiring exclusive ownership first.
    ///
    /// Owned resources are reentrant: no re-locking takes place. An operation
    /// failure propagates unchanged; the resource stays owned and nothing is
    /// recorded for undo.
    pub fn operate<O>(&self, rid: ResourceId, operation: O) -> Result<()>
    where
        O: ResourceOperation<R> + 'static,
    {
        let tx = self.current()?;
        if tx.aborted.load(Ordering::SeqCst) {
            return Err(TxError::Aborted);
        }
        let slot = self.slots.get(&rid).ok_or(TxError::UnknownResource(rid))?;

        let owned = tx.body.lock().expect("transaction body poisoned").owned.contains(&rid);
        if !owned {
            self.lock_resource(&tx, rid, slot)?;
        }

        match operation.execute(&slot.resource) {
            Err(cause) => {
                warn!("TRANSACTION({}): OPERATION ON RESOURCE({}) FAILED ({})", tx.id, rid, cause);
                Err(TxError::OperationFailed(cause))
            }
            Ok(()) => {
                let mut body = tx.body.lock().expect("transaction body poisoned");
                body.undo.push(LogEntry {
                    op: Box::new(operation),
                    resource: slot.resource.clone(),
                });
                Ok(())
            }
        }
    }

    /// Commits the calling thread's transaction, releasing every owned
    /// resource in hand-off order.
    pub fn commit(&self) -> Result<()> {
        let tx = self.current()?;
        if tx.aborted.load(Ordering::SeqCst) {
            return Err(TxError::Aborted);
        }

        let owned: Vec<ResourceId> = {
            let mut body = tx.body.lock().expect("transaction body poisoned");
            body.undo.clear();
            body.owned.drain().collect()
        };

        for rid in &owned {
            self.slot(*rid).lock.release(tx.id);
        }
        self.retire(&tx);

        info!("TRANSACTION({}): COMMIT ({} resources released)", tx.id, owned.len());
        Ok(())
    }

    /// Rolls back the calling thread's transaction: undoes the recorded
    /// operations in reverse order of application, releases every owned
    /// resource and clears the transaction, aborted or not.
    ///
    /// A no-op without an active transaction; rollback never fails.
    pub fn rollback(&self) {
        let key = thread::current().id();
        let tx = {
            let core = self.core.lock().expect("core tables poisoned");
            core.threads.get(&key).cloned()
        };
        let tx = match tx {
            Some(tx) => tx,
            None => return,
        };

        let (entries, owned) = {
            let mut body = tx.body.lock().expect("transaction body poisoned");
            let entries = std::mem::take(&mut body.undo);
            let owned: Vec<ResourceId> = body.owned.drain().collect();
            (entries, owned)
        };

        let undone = entries.len();
        for entry in entries.into_iter().rev() {
            entry.op.undo(&entry.resource);
        }
        for rid in &owned {
            self.slot(*rid).lock.release(tx.id);
        }
        self.retire(&tx);

        info!(
            "TRANSACTION({}): ROLLBACK ({} operations undone, {} resources released)",
            tx.id,
            undone,
            owned.len()
        );
    }

    /// Whether the calling thread has a transaction in progress.
    pub fn is_active(&self) -> bool {
        let core = self.core.lock().expect("core tables poisoned");
        core.threads.contains_key(&thread::current().id())
    }

    /// Whether the calling thread's transaction has been marked a deadlock
    /// victim. Once aborted, only [`Self::rollback`] clears the transaction.
    pub fn is_aborted(&self) -> bool {
        let core = self.core.lock().expect("core tables poisoned");
        core.threads
            .get(&thread::current().id())
            .map(|tx| tx.aborted.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Cancellation handle of the calling thread's transaction, for handing
    /// to a supervising thread.
    pub fn cancel_token(&self) -> Result<CancelToken> {
        Ok(self.current()?.token.clone())
    }

    /// Current owner of a registered resource, if any.
    pub fn owner_of(&self, rid: ResourceId) -> Result<Option<TxId>> {
        self.slots
            .get(&rid)
            .map(|slot| slot.lock.holder())
            .ok_or(TxError::UnknownResource(rid))
    }

    /// Runs `body` inside a fresh transaction and commits it.
    ///
    /// When the transaction is sacrificed to break a deadlock the manager
    /// rolls back and either retries or reports `Aborted`, depending on
    /// `strategy`. Any other failure rolls back and propagates.
    pub fn execute<F, T>(&self, strategy: Strategy, body: F) -> Result<T>
    where
        F: Fn(&Self) -> Result<T>,
    {
        loop {
            self.start()?;

            let outcome = body(self).and_then(|value| self.commit().map(|_| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(TxError::Aborted) => {
                    self.rollback();
                    match strategy {
                        Strategy::Retry => continue,
                        Strategy::Abort => return Err(TxError::Aborted),
                    }
                }
                Err(err) => {
                    self.rollback();
                    return Err(err);
                }
            }
        }
    }

    fn current(&self) -> Result<Arc<TxState<R>>> {
        let core = self.core.lock().expect("core tables poisoned");
        core.threads
            .get(&thread::current().id())
            .cloned()
            .ok_or(TxError::NoActiveTransaction)
    }

    fn slot(&self, rid: ResourceId) -> &Slot<R> {
        self.slots.get(&rid).expect("owned resource missing from registry")
    }

    /// Acquires exclusive ownership of `rid` for `tx`, blocking when the
    /// resource is held by another transaction.
    fn lock_resource(&self, tx: &Arc<TxState<R>>, rid: ResourceId, slot: &Slot<R>) -> Result<()> {
        let mut core = self.core.lock().expect("core tables poisoned");

        let blocker = match slot.lock.acquire_or_enqueue(tx.id) {
            None => {
                drop(core);
                tx.body.lock().expect("transaction body poisoned").owned.insert(rid);
                return Ok(());
            }
            Some(blocker) => blocker,
        };

        core.graph.record(tx.id, blocker);
        info!(
            "TRANSACTION({}): WAIT ON RESOURCE({}) OWNED BY TRANSACTION({})",
            tx.id, rid, blocker
        );

        if Self::detect_and_abort(&mut core, tx.id) == Some(tx.id) {
            slot.lock.abandon(tx.id);
            core.graph.clear(tx.id);
            return Err(TxError::Aborted);
        }
        drop(core);

        let woken = slot.lock.await_grant(tx.id, &tx.token);

        let mut core = self.core.lock().expect("core tables poisoned");
        core.graph.clear(tx.id);
        drop(core);

        match woken {
            Ok(()) => {
                tx.body.lock().expect("transaction body poisoned").owned.insert(rid);
                info!("TRANSACTION({}): GRANTED RESOURCE({})", tx.id, rid);
                Ok(())
            }
            Err(CancelReason::DeadlockVictim) => Err(TxError::Aborted),
            Err(CancelReason::External) => {
                info!("TRANSACTION({}): WAIT ON RESOURCE({}) CANCELLED", tx.id, rid);
                Err(TxError::Cancelled)
            }
        }
    }

    /// Runs the deadlock detector after the edge of `start` was inserted.
    ///
    /// Must be called with the global critical section held, so the victim
    /// decision is taken on a consistent snapshot of the chain.
    fn detect_and_abort(core: &mut Core<R>, start: TxId) -> Option<TxId> {
        let victim_id = {
            let active = &core.active;
            core.graph.victim_of(start, |id| {
                active.get(&id).expect("waiting transaction not registered").started
            })
        }?;

        let victim = core
            .active
            .get(&victim_id)
            .expect("victim not registered")
            .clone();
        victim.aborted.store(true, Ordering::SeqCst);
        victim.token.signal(CancelReason::DeadlockVictim);
        core.graph.clear(victim_id);

        warn!("DEADLOCK: TRANSACTION({}) ABORTED TO BREAK THE CYCLE", victim_id);
        Some(victim_id)
    }

    fn retire(&self, tx: &Arc<TxState<R>>) {
        let mut core = self.core.lock().expect("core tables poisoned");
        core.threads.remove(&thread::current().id());
        core.active.remove(&tx.id);
        core.graph.clear(tx.id);
    }
}
