// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
        mpsc, Arc, Barrier, Mutex,
    },
    thread,
    time::Duration,
};
use stronghold_txm as txm;
use threadpool::ThreadPool;
use txm::{Resource, ResourceId, ResourceOperation, Strategy, TimeSource, TransactionManager, TxError};

#[cfg(test)]
#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let level = match cfg!(feature = "verbose") {
        true => log::LevelFilter::Debug,
        false => log::LevelFilter::Info,
    };

    let _ = env_logger::builder().is_test(true).filter_level(level).try_init();
}

struct Counter {
    id: ResourceId,
    value: Arc<AtomicI64>,
}

impl Counter {
    fn new(id: u64, start: i64) -> (Self, Arc<AtomicI64>) {
        let value = Arc::new(AtomicI64::new(start));
        (
            Self {
                id: ResourceId::new(id),
                value: value.clone(),
            },
            value,
        )
    }

    fn plain(id: u64) -> Self {
        Self::new(id, 0).0
    }
}

impl Resource for Counter {
    fn id(&self) -> ResourceId {
        self.id
    }
}

struct Add(i64);

impl ResourceOperation<Counter> for Add {
    fn execute(&self, counter: &Counter) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        counter.value.fetch_add(self.0, Ordering::SeqCst);
        Ok(())
    }

    fn undo(&self, counter: &Counter) {
        counter.value.fetch_sub(self.0, Ordering::SeqCst);
    }
}

struct Journal {
    id: ResourceId,
    log: Arc<Mutex<Vec<String>>>,
}

impl Resource for Journal {
    fn id(&self) -> ResourceId {
        self.id
    }
}

struct Tag(&'static str);

impl ResourceOperation<Journal> for Tag {
    fn execute(&self, journal: &Journal) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        journal.log.lock().expect("journal poisoned").push(format!("apply:{}", self.0));
        Ok(())
    }

    fn undo(&self, journal: &Journal) {
        journal.log.lock().expect("journal poisoned").push(format!("undo:{}", self.0));
    }
}

/// Ticks once per call; start order fully determines transaction age.
#[derive(Default)]
struct ManualTime(AtomicU64);

impl TimeSource for ManualTime {
    fn now(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Every transaction starts at the same instant, forcing the id tie-break.
struct ConstantTime;

impl TimeSource for ConstantTime {
    fn now(&self) -> u64 {
        42
    }
}

#[test]
fn test_blocked_acquire_proceeds_after_commit() {
    let (counter, value) = Counter::new(1, 0);
    let manager = Arc::new(TransactionManager::new([counter]));
    let rid = ResourceId::new(1);

    let (owned_tx, owned_rx) = mpsc::channel();

    let holder = {
        let manager = manager.clone();
        thread::spawn(move || {
            manager.start().expect("start");
            manager.operate(rid, Add(1)).expect("operate");
            owned_tx.send(()).expect("signal ownership");

            // keep the resource long enough for the second transaction to block
            thread::sleep(Duration::from_millis(100));
            manager.commit().expect("commit");
        })
    };

    let waiter = {
        let manager = manager.clone();
        thread::spawn(move || {
            owned_rx.recv().expect("wait for ownership");
            manager.start().expect("start");
            manager.operate(rid, Add(2)).expect("blocked operate succeeds");
            assert!(manager.owner_of(rid).expect("registered").is_some());
            manager.commit().expect("commit");
        })
    };

    holder.join().expect("holder panicked");
    waiter.join().expect("waiter panicked");

    assert_eq!(value.load(Ordering::SeqCst), 3);
    assert_eq!(manager.owner_of(rid).expect("registered"), None);
}

fn run_two_party_deadlock(time: Arc<dyn TimeSource>) {
    let manager = Arc::new(TransactionManager::with_time_source(
        [Counter::plain(1), Counter::plain(2)],
        time,
    ));
    let r1 = ResourceId::new(1);
    let r2 = ResourceId::new(2);

    let (first_started_tx, first_started_rx) = mpsc::channel();
    let (second_armed_tx, second_armed_rx) = mpsc::channel();

    let elder = {
        let manager = manager.clone();
        thread::spawn(move || {
            manager.start().expect("start");
            manager.operate(r1, Add(1)).expect("own r1");
            first_started_tx.send(()).expect("signal start order");

            second_armed_rx.recv().expect("wait for the younger transaction");
            manager.operate(r2, Add(1)).expect("elder proceeds after the cycle is broken");
            manager.commit().expect("commit");
        })
    };

    let younger = {
        let manager = manager.clone();
        thread::spawn(move || {
            first_started_rx.recv().expect("wait for start order");
            manager.start().expect("start");
            manager.operate(r2, Add(1)).expect("own r2");
            second_armed_tx.send(()).expect("signal armed");

            let denied = manager.operate(r1, Add(1));
            assert!(matches!(denied, Err(TxError::Aborted)), "younger must be the victim");
            assert!(manager.is_aborted());
            assert!(matches!(manager.commit(), Err(TxError::Aborted)));

            manager.rollback();
            assert!(!manager.is_active());
            assert!(!manager.is_aborted());
        })
    };

    elder.join().expect("elder panicked");
    younger.join().expect("younger panicked");

    assert_eq!(manager.owner_of(r1).expect("registered"), None);
    assert_eq!(manager.owner_of(r2).expect("registered"), None);
}

#[test]
fn test_deadlock_aborts_the_youngest() {
    run_two_party_deadlock(Arc::new(ManualTime::default()));
}

#[test]
fn test_deadlock_tie_broken_by_larger_id() {
    run_two_party_deadlock(Arc::new(ConstantTime));
}

#[test]
fn test_three_way_deadlock_aborts_only_the_youngest() {
    let manager = Arc::new(TransactionManager::with_time_source(
        [Counter::plain(1), Counter::plain(2), Counter::plain(3)],
        Arc::new(ManualTime::default()),
    ));
    let barrier = Arc::new(Barrier::new(3));
    let aborted = Arc::new(Mutex::new(Vec::new()));

    let mut prev_rx = {
        let (tx, rx) = mpsc::channel();
        tx.send(()).expect("prime start order");
        rx
    };

    let mut workers = Vec::new();
    for i in 0..3u64 {
        let (next_tx, next_rx) = mpsc::channel();
        let rx = std::mem::replace(&mut prev_rx, next_rx);

        let manager = manager.clone();
        let barrier = barrier.clone();
        let aborted = aborted.clone();
        workers.push(thread::spawn(move || {
            rx.recv().expect("start order");
            manager.start().expect("start");
            manager.operate(ResourceId::new(i + 1), Add(1)).expect("own resource");
            let _ = next_tx.send(());

            barrier.wait();
            match manager.operate(ResourceId::new((i + 1) % 3 + 1), Add(1)) {
                Ok(()) => manager.commit().expect("commit"),
                Err(TxError::Aborted) => {
                    aborted.lock().expect("aborted list poisoned").push(i);
                    manager.rollback();
                }
                Err(err) => panic!("unexpected failure: {}", err),
            }
        }));
    }

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(*aborted.lock().expect("aborted list poisoned"), vec![2]);
    for i in 1..=3u64 {
        assert_eq!(manager.owner_of(ResourceId::new(i)).expect("registered"), None);
    }
}

#[test]
fn test_waiters_are_granted_in_fifo_order() {
    let (counter, _) = Counter::new(1, 0);
    let manager = Arc::new(TransactionManager::new([counter]));
    let rid = ResourceId::new(1);
    let grants = Arc::new(Mutex::new(Vec::new()));

    let (owned_tx, owned_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();

    let holder = {
        let manager = manager.clone();
        thread::spawn(move || {
            manager.start().expect("start");
            manager.operate(rid, Add(1)).expect("operate");
            owned_tx.send(()).expect("signal ownership");
            release_rx.recv().expect("wait for release order");
            manager.commit().expect("commit");
        })
    };

    owned_rx.recv().expect("wait for ownership");

    let mut waiters = Vec::new();
    for index in 1..=3usize {
        let manager = manager.clone();
        let grants = grants.clone();
        waiters.push(thread::spawn(move || {
            manager.start().expect("start");
            manager.operate(rid, Add(1)).expect("blocked operate succeeds");
            grants.lock().expect("grants poisoned").push(index);
            manager.commit().expect("commit");
        }));
        // stagger the block order
        thread::sleep(Duration::from_millis(50));
    }

    release_tx.send(()).expect("release holder");
    holder.join().expect("holder panicked");
    for waiter in waiters {
        waiter.join().expect("waiter panicked");
    }

    assert_eq!(*grants.lock().expect("grants poisoned"), vec![1, 2, 3]);
}

#[test]
fn test_external_cancel_leaves_transaction_intact() {
    let (counter, value) = Counter::new(1, 0);
    let manager = Arc::new(TransactionManager::new([counter]));
    let rid = ResourceId::new(1);

    let (owned_tx, owned_rx) = mpsc::channel();
    let (token_tx, token_rx) = mpsc::channel();
    let (cancelled_tx, cancelled_rx) = mpsc::channel();
    let (finish_tx, finish_rx) = mpsc::channel();

    let holder = {
        let manager = manager.clone();
        thread::spawn(move || {
            manager.start().expect("start");
            manager.operate(rid, Add(1)).expect("operate");
            owned_tx.send(()).expect("signal ownership");
            finish_rx.recv().expect("wait for finish order");
            manager.commit().expect("commit");
        })
    };

    let cancelled = {
        let manager = manager.clone();
        thread::spawn(move || {
            owned_rx.recv().expect("wait for ownership");
            manager.start().expect("start");
            token_tx
                .send(manager.cancel_token().expect("token of active transaction"))
                .expect("hand out token");

            let denied = manager.operate(rid, Add(2));
            assert!(matches!(denied, Err(TxError::Cancelled)));

            // an external cancel is not an abort: the transaction survives
            assert!(manager.is_active());
            assert!(!manager.is_aborted());
            cancelled_tx.send(()).expect("signal cancelled");

            manager.operate(rid, Add(2)).expect("retry succeeds");
            manager.commit().expect("commit");
        })
    };

    let token = token_rx.recv().expect("token");
    thread::sleep(Duration::from_millis(50));
    token.cancel();

    cancelled_rx.recv().expect("wait for the cancelled wait");
    finish_tx.send(()).expect("finish holder");

    holder.join().expect("holder panicked");
    cancelled.join().expect("cancelled thread panicked");

    assert_eq!(value.load(Ordering::SeqCst), 3);
    assert_eq!(manager.owner_of(rid).expect("registered"), None);
}

#[test]
fn test_rollback_undoes_in_reverse_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = TransactionManager::new([Journal {
        id: ResourceId::new(1),
        log: log.clone(),
    }]);
    let rid = ResourceId::new(1);

    manager.start().expect("start");
    manager.operate(rid, Tag("a")).expect("operate");
    manager.operate(rid, Tag("b")).expect("operate");
    manager.operate(rid, Tag("c")).expect("operate");
    manager.rollback();

    assert_eq!(
        *log.lock().expect("journal poisoned"),
        vec!["apply:a", "apply:b", "apply:c", "undo:c", "undo:b", "undo:a"]
    );

    // nothing recorded, nothing to undo
    manager.start().expect("start");
    manager.rollback();
    assert_eq!(log.lock().expect("journal poisoned").len(), 6);
}

#[test]
fn test_concurrent_transfers_conserve_total() {
    const ACCOUNTS: usize = 8;
    const INITIAL: i64 = 1000;
    const WORKERS: usize = 8;
    const ROUNDS: usize = 50;

    let mut resources = Vec::new();
    let mut values = Vec::new();
    for i in 0..ACCOUNTS {
        let (counter, value) = Counter::new(i as u64 + 1, INITIAL);
        resources.push(counter);
        values.push(value);
    }

    let manager = Arc::new(TransactionManager::new(resources));
    let completed = Arc::new(AtomicUsize::new(0));
    let pool = ThreadPool::new(WORKERS);

    for _ in 0..WORKERS {
        let manager = manager.clone();
        let completed = completed.clone();

        pool.execute(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..ROUNDS {
                let from = rng.gen_range(0..ACCOUNTS) as u64 + 1;
                let mut to = rng.gen_range(0..ACCOUNTS) as u64 + 1;
                while to == from {
                    to = rng.gen_range(0..ACCOUNTS) as u64 + 1;
                }
                let amount = rng.gen_range(1..=25i64);

                manager
                    .execute(Strategy::Retry, |m| {
                        m.operate(ResourceId::new(from), Add(-amount))?;
                        m.operate(ResourceId::new(to), Add(amount))?;
                        Ok(())
                    })
                    .expect("transfer commits");

                completed.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    pool.join();

    assert_eq!(completed.load(Ordering::SeqCst), WORKERS * ROUNDS);

    let total: i64 = values.iter().map(|value| value.load(Ordering::SeqCst)).sum();
    assert_eq!(total, ACCOUNTS as i64 * INITIAL);

    for i in 0..ACCOUNTS {
        assert_eq!(
            manager.owner_of(ResourceId::new(i as u64 + 1)).expect("registered"),
            None
        );
    }
}
