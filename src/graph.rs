// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Wait-for graph and victim selection.
//!
//! The graph is functional: a transaction blocks on at most one resource at a
//! time, so it has at most one outgoing edge. Any cycle is therefore simple
//! and found by walking a single chain instead of a general graph search, in
//! O(chain length). Detection runs on every edge insertion, while the global
//! critical section is held, so a pre-existing cycle can never be missed: the
//! cycle must contain the edge that was just inserted.

use crate::types::TxId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct WaitGraph {
    edges: HashMap<TxId, TxId>,
}

impl WaitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `waiter` blocks on a resource held by `blocker`.
    pub fn record(&mut self, waiter: TxId, blocker: TxId) {
        debug_assert_ne!(waiter, blocker);
        self.edges.insert(waiter, blocker);
    }

    /// Removes the outgoing edge of `waiter`, if any.
    pub fn clear(&mut self, waiter: TxId) {
        self.edges.remove(&waiter);
    }

    pub fn blocker_of(&self, waiter: TxId) -> Option<TxId> {
        self.edges.get(&waiter).copied()
    }

    /// Walks the chain starting at `start` and selects a victim if the walk
    /// closes back on `start`.
    ///
    /// While walking, the candidate is replaced whenever the current node
    /// started strictly later, or started at the same time and carries the
    /// larger id. The returned victim is thus the youngest member of the
    /// cycle, which approximates a wound-wait policy: the longest-running
    /// transaction is never sacrificed, bounding starvation.
    ///
    /// The caller is responsible for aborting the victim and removing its
    /// outgoing edge.
    pub fn victim_of<F>(&self, start: TxId, started: F) -> Option<TxId>
    where
        F: Fn(TxId) -> u64,
    {
        let mut candidate: Option<(u64, TxId)> = None;
        let mut node = start;

        while let Some(next) = self.blocker_of(node) {
            let stamp = (started(node), node);
            if candidate.map_or(true, |best| stamp > best) {
                candidate = Some(stamp);
            }

            node = next;
            if node == start {
                return candidate.map(|(_, id)| id);
            }
        }

        None
    }
}
