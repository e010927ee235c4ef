// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::qlock::LockShared;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex,
};

const SIG_NONE: u8 = 0;
const SIG_VICTIM: u8 = 1;
const SIG_EXTERNAL: u8 = 2;

/// Why a blocked acquisition was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The transaction was selected by the deadlock detector and must abort.
    DeadlockVictim,

    /// The wait was interrupted from outside the transaction; the transaction
    /// itself is left untouched and may retry.
    External,
}

/// Typed cancellation handle of a single transaction.
///
/// A token is created at `start()` and checked at the one designated
/// suspension point, the wait inside [`crate::QueueLock::await_grant`]. The
/// first signal wins; an `External` signal is consumed when delivered so a
/// cancelled wait can be retried later.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    reason: AtomicU8,
    // the lock the owning transaction is currently blocked on, if any
    parked: Mutex<Option<Arc<LockShared>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                reason: AtomicU8::new(SIG_NONE),
                parked: Mutex::new(None),
            }),
        }
    }

    /// Interrupts the owning transaction's blocked wait, if there is one.
    pub fn cancel(&self) {
        self.signal(CancelReason::External);
    }

    pub(crate) fn signal(&self, reason: CancelReason) {
        let code = match reason {
            CancelReason::DeadlockVictim => SIG_VICTIM,
            CancelReason::External => SIG_EXTERNAL,
        };

        if self
            .inner
            .reason
            .compare_exchange(SIG_NONE, code, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let parked = self.inner.parked.lock().expect("parked slot poisoned").take();
            if let Some(shared) = parked {
                shared.poke();
            }
        }
    }

    /// Consumes a pending signal, if any.
    pub(crate) fn take(&self) -> Option<CancelReason> {
        match self.inner.reason.swap(SIG_NONE, Ordering::SeqCst) {
            SIG_VICTIM => Some(CancelReason::DeadlockVictim),
            SIG_EXTERNAL => Some(CancelReason::External),
            _ => None,
        }
    }

    pub(crate) fn park(&self, at: Arc<LockShared>) {
        *self.inner.parked.lock().expect("parked slot poisoned") = Some(at);
    }

    pub(crate) fn unpark(&self) {
        self.inner.parked.lock().expect("parked slot poisoned").take();
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
