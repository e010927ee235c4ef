// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-resource mutual exclusion.
//!
//! [`QueueLock`] is a binary gate with first-blocked, first-granted fairness.
//! The holder slot doubles as the ownership-table entry of the guarded
//! resource: ownership changes and lock transitions happen under the same
//! mutex, so a resource can never appear free while it is not grantable.
//!
//! Release hands the lock directly to the longest-waiting transaction instead
//! of clearing the holder and letting woken threads race: a resource with
//! waiters therefore always has an owner.

use crate::{
    cancel::{CancelReason, CancelToken},
    types::TxId,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
};

#[derive(Default)]
struct LockState {
    holder: Option<TxId>,
    queue: VecDeque<TxId>,
}

pub(crate) struct LockShared {
    state: Mutex<LockState>,
    wakeup: Condvar,
}

impl LockShared {
    /// Wakes all parked waiters so they can re-inspect their cancel token.
    pub(crate) fn poke(&self) {
        let _state = self.state.lock().expect("lock state poisoned");
        self.wakeup.notify_all();
    }
}

/// Binary, fairness-ordered, cancellable mutual-exclusion gate.
///
/// One instance guards exactly one resource and is never shared across
/// resources. Waiters are granted the lock in the order they blocked.
#[derive(Clone)]
pub struct QueueLock {
    shared: Arc<LockShared>,
}

impl QueueLock {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LockShared {
                state: Mutex::new(LockState::default()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Grants the lock immediately when it is free, otherwise appends `tx` to
    /// the wait queue and returns the current holder it will be waiting for.
    ///
    /// The caller must not already hold the lock.
    pub fn acquire_or_enqueue(&self, tx: TxId) -> Option<TxId> {
        let mut state = self.shared.state.lock().expect("lock state poisoned");
        match state.holder {
            None => {
                debug_assert!(state.queue.is_empty());
                state.holder = Some(tx);
                None
            }
            Some(holder) => {
                debug_assert_ne!(holder, tx);
                state.queue.push_back(tx);
                Some(holder)
            }
        }
    }

    /// Blocks until `tx` is handed the lock, or until its token is signalled.
    ///
    /// This is the single suspension point of a transaction. The token is
    /// checked before the grant on every wake, so the two wake causes are
    /// always distinguishable. On cancellation the queue slot is given up (or
    /// the lock is passed on, if a grant raced the signal) and the typed
    /// reason is returned.
    pub fn await_grant(&self, tx: TxId, token: &CancelToken) -> Result<(), CancelReason> {
        token.park(self.shared.clone());

        let mut state = self.shared.state.lock().expect("lock state poisoned");
        loop {
            if let Some(reason) = token.take() {
                self.unseat(&mut state, tx);
                token.unpark();
                return Err(reason);
            }

            if state.holder == Some(tx) {
                token.unpark();
                return Ok(());
            }

            state = self.shared.wakeup.wait(state).expect("lock state poisoned");
        }
    }

    /// Withdraws `tx` from the lock without blocking, whether it is still
    /// queued or was already handed the lock in absence.
    pub fn abandon(&self, tx: TxId) {
        let mut state = self.shared.state.lock().expect("lock state poisoned");
        self.unseat(&mut state, tx);
    }

    /// Releases the lock held by `tx`, handing it to the longest-waiting
    /// queued transaction.
    pub fn release(&self, tx: TxId) {
        let mut state = self.shared.state.lock().expect("lock state poisoned");
        debug_assert_eq!(state.holder, Some(tx));
        state.holder = state.queue.pop_front();
        if state.holder.is_some() {
            self.wakeup_all();
        }
    }

    /// Current owner of the guarded resource. `None` means free.
    pub fn holder(&self) -> Option<TxId> {
        self.shared.state.lock().expect("lock state poisoned").holder
    }

    fn unseat(&self, state: &mut LockState, tx: TxId) {
        if state.holder == Some(tx) {
            state.holder = state.queue.pop_front();
            if state.holder.is_some() {
                self.wakeup_all();
            }
        } else {
            state.queue.retain(|queued| *queued != tx);
        }
    }

    fn wakeup_all(&self) {
        self.shared.wakeup.notify_all();
    }
}

impl Default for QueueLock {
    fn default() -> Self {
        Self::new()
    }
}
