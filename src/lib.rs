// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Resource Transaction Manager
//!
//! A pessimistic, single-process transaction manager: many threads perform
//! exclusive, undoable operations on a fixed set of shared resources, while
//! deadlocks are detected and broken synchronously at the moment a wait would
//! create a cycle, instead of via timeouts.
//!
//! Every resource is guarded by its own [`QueueLock`], a binary gate with
//! first-blocked, first-granted fairness. A transaction that blocks gets a
//! single edge in the [`WaitGraph`]; because a transaction is only ever
//! blocked on one resource at a time the graph is functional, and cycle
//! detection reduces to walking one chain. The youngest member of a cycle
//! (latest start time, ties broken towards the larger transaction id) is
//! aborted and woken through its typed [`CancelToken`], so an interrupted
//! wait can always tell a deadlock abort from an external cancellation.
//!
//! Successful operations are recorded on a per-transaction undo log;
//! `rollback` reverses them in LIFO order.
//!
//! # Example
//! ```
//! use stronghold_txm::{Resource, ResourceId, ResourceOperation, TransactionManager};
//! use std::sync::atomic::{AtomicI64, Ordering};
//!
//! struct Account {
//!     id: ResourceId,
//!     balance: AtomicI64,
//! }
//!
//! impl Resource for Account {
//!     fn id(&self) -> ResourceId {
//!         self.id
//!     }
//! }
//!
//! struct Deposit(i64);
//!
//! impl ResourceOperation<Account> for Deposit {
//!     fn execute(&self, account: &Account) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         account.balance.fetch_add(self.0, Ordering::SeqCst);
//!         Ok(())
//!     }
//!
//!     fn undo(&self, account: &Account) {
//!         account.balance.fetch_sub(self.0, Ordering::SeqCst);
//!     }
//! }
//!
//! let manager = TransactionManager::new([Account {
//!     id: ResourceId::new(1),
//!     balance: AtomicI64::new(0),
//! }]);
//!
//! manager.start()?;
//! manager.operate(ResourceId::new(1), Deposit(10))?;
//! manager.commit()?;
//! # Ok::<(), stronghold_txm::TxError>(())
//! ```

pub mod cancel;
pub mod errors;
pub mod graph;
pub mod manager;
pub mod qlock;
pub mod types;

pub use cancel::{CancelReason, CancelToken};
pub use errors::TxError;
pub use graph::WaitGraph;
pub use manager::{Strategy, TransactionManager};
pub use qlock::QueueLock;
pub use types::{MonotonicTime, Resource, ResourceId, ResourceOperation, TimeSource, TxId};

/// Global return type
pub type Result<T> = core::result::Result<T, TxError>;
