// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Identifier newtypes and the collaborator traits of the transaction manager.
//!
//! The manager never implements resource semantics itself. A [`Resource`] is an
//! external entity registered once at construction, a [`ResourceOperation`] is
//! the unit of undoable work applied to it, and a [`TimeSource`] orders
//! transaction start times for victim selection.

use lazy_static::lazy_static;
use std::{error::Error, fmt, time::Instant};

/// Stable, opaque identifier of a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl From<u64> for ResourceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a transaction, unique for the lifetime of the process.
///
/// Ids are handed out from a monotonically increasing counter, so a
/// transaction started later always carries a larger id. The total order is
/// used only as the deterministic tie-break in victim selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(pub(crate) u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An entity that can be placed under transactional control.
///
/// The manager guarantees exclusive access while a transaction owns the
/// resource; mutation behind `&self` is the implementor's concern.
pub trait Resource: Send + Sync + 'static {
    /// Returns the stable identifier this resource is registered under.
    fn id(&self) -> ResourceId;
}

/// A single undoable unit of work against a resource of type `R`.
///
/// `execute` errors propagate to the caller unchanged (boxed); an operation
/// that failed is never recorded for undo.
pub trait ResourceOperation<R>: Send + Sync
where
    R: Resource,
{
    fn execute(&self, resource: &R) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Reverses a previously successful `execute`. Must not fail.
    fn undo(&self, resource: &R);
}

/// Monotonic time used to order transaction start times.
///
/// Values need not relate to wall-clock time; they only have to grow.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> u64;
}

lazy_static! {
    static ref MONOTONIC_ORIGIN: Instant = Instant::now();
}

/// Default [`TimeSource`], measuring nanoseconds from a process-wide origin.
///
/// The shared origin keeps timestamps comparable across manager instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicTime;

impl TimeSource for MonotonicTime {
    fn now(&self) -> u64 {
        MONOTONIC_ORIGIN.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_time_grows() {
        let time = MonotonicTime;
        let a = time.now();
        let b = time.now();
        assert!(b >= a);
    }

    #[test]
    fn test_tx_id_order() {
        assert!(TxId(2) > TxId(1));
        assert!((7u64, TxId(4)) > (7u64, TxId(3)));
    }
}
