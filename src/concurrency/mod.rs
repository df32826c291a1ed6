//! Per-key two-phase locking with deadlock detection.
//!
//! Each key holds a grant list plus a FIFO wait queue (and at most one
//! pending upgrader). Grants are promoted from the queue head while
//! compatible, so writers cannot starve and readers batch naturally. A
//! waits-for graph is computed on demand at every acquire and searched for
//! cycles; the acquiring transaction is the victim. All blocking happens on
//! one condition variable; `release` never blocks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StoneError};
use crate::stats::Statistics;
use crate::wal::record::TxnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

fn compatible(held: LockMode, requested: LockMode) -> bool {
    held == LockMode::Shared && requested == LockMode::Shared
}

struct Waiter {
    txn_id: TxnId,
    mode: LockMode,
}

#[derive(Default)]
struct KeyQueue {
    grants: Vec<(TxnId, LockMode)>,
    /// A transaction holding Shared and waiting to convert to Exclusive.
    /// At most one: a second concurrent upgrader is a certain deadlock.
    upgrader: Option<TxnId>,
    waiters: VecDeque<Waiter>,
}

impl KeyQueue {
    fn is_empty(&self) -> bool {
        self.grants.is_empty() && self.upgrader.is_none() && self.waiters.is_empty()
    }

    fn grant_of(&self, txn_id: TxnId) -> Option<LockMode> {
        self.grants
            .iter()
            .find(|(id, _)| *id == txn_id)
            .map(|(_, mode)| *mode)
    }
}

#[derive(Default)]
struct TxnLocks {
    held: HashSet<Vec<u8>>,
    waiting_on: Option<Vec<u8>>,
}

#[derive(Default)]
struct Tables {
    keys: HashMap<Vec<u8>, KeyQueue>,
    txns: HashMap<TxnId, TxnLocks>,
    /// Deadlock victims selected while queued; they wake, find themselves
    /// here, and return `Deadlock` from their acquire.
    victims: HashSet<TxnId>,
}

impl Tables {
    /// Grant from the head of the queue while compatibility allows. A
    /// pending upgrader goes first and blocks everything behind it until its
    /// transaction is the sole holder.
    fn promote(&mut self, key: &[u8]) {
        let Some(queue) = self.keys.get_mut(key) else {
            return;
        };
        loop {
            if let Some(upgrader) = queue.upgrader {
                if queue.grants.len() == 1 && queue.grants[0].0 == upgrader {
                    queue.grants[0].1 = LockMode::Exclusive;
                    queue.upgrader = None;
                    continue;
                }
                return;
            }
            match queue.waiters.front() {
                Some(waiter)
                    if queue
                        .grants
                        .iter()
                        .all(|(_, held)| compatible(*held, waiter.mode)) =>
                {
                    let waiter = queue.waiters.pop_front().unwrap();
                    queue.grants.push((waiter.txn_id, waiter.mode));
                }
                _ => return,
            }
        }
    }

    fn is_granted(&self, key: &[u8], txn_id: TxnId, mode: LockMode) -> bool {
        self.keys
            .get(key)
            .and_then(|q| q.grant_of(txn_id))
            .map(|held| held == LockMode::Exclusive || mode == LockMode::Shared)
            .unwrap_or(false)
    }

    /// DFS over the on-demand waits-for view: edge A -> B when A waits on a
    /// key where B holds an incompatible grant. Returns whether any cycle is
    /// reachable from `start`.
    fn has_cycle_from(&self, start: TxnId) -> bool {
        let mut visited = HashSet::new();
        let mut path = HashSet::new();
        self.dfs(start, &mut visited, &mut path)
    }

    fn dfs(&self, current: TxnId, visited: &mut HashSet<TxnId>, path: &mut HashSet<TxnId>) -> bool {
        if path.contains(&current) {
            return true;
        }
        if !visited.insert(current) {
            return false;
        }
        path.insert(current);

        if let Some(blockers) = self.blockers_of(current) {
            for blocker in blockers {
                if self.dfs(blocker, visited, path) {
                    return true;
                }
            }
        }

        path.remove(&current);
        false
    }

    fn blockers_of(&self, txn_id: TxnId) -> Option<Vec<TxnId>> {
        let key = self.txns.get(&txn_id)?.waiting_on.as_ref()?;
        let queue = self.keys.get(key)?;
        let mode = if queue.upgrader == Some(txn_id) {
            LockMode::Exclusive
        } else {
            queue
                .waiters
                .iter()
                .find(|w| w.txn_id == txn_id)
                .map(|w| w.mode)?
        };
        Some(
            queue
                .grants
                .iter()
                .filter(|(holder, held)| *holder != txn_id && !compatible(*held, mode))
                .map(|(holder, _)| *holder)
                .collect(),
        )
    }

    /// Remove every trace of `txn_id` from one key's queue.
    fn remove_from_key(&mut self, key: &[u8], txn_id: TxnId) {
        if let Some(queue) = self.keys.get_mut(key) {
            queue.grants.retain(|(id, _)| *id != txn_id);
            queue.waiters.retain(|w| w.txn_id != txn_id);
            if queue.upgrader == Some(txn_id) {
                queue.upgrader = None;
            }
            if queue.is_empty() {
                self.keys.remove(key);
            } else {
                self.promote(key);
            }
        }
    }
}

pub struct LockManager {
    tables: Mutex<Tables>,
    available: Condvar,
    stats: Arc<Statistics>,
}

impl LockManager {
    pub fn new(stats: Arc<Statistics>) -> Self {
        LockManager {
            tables: Mutex::new(Tables::default()),
            available: Condvar::new(),
            stats,
        }
    }

    /// Acquire `mode` on `key` for `txn_id`, blocking until granted.
    ///
    /// Re-entrant: a held Exclusive satisfies any request and a held Shared
    /// satisfies Shared. Shared-to-Exclusive is an upgrade, granted once the
    /// transaction is the sole holder. Returns `Deadlock` when this acquire
    /// would close a waits-for cycle or when the transaction is chosen as a
    /// victim while queued; the caller is expected to abort.
    pub fn acquire(&self, txn_id: TxnId, key: &[u8], mode: LockMode) -> Result<()> {
        let mut tables = self.tables.lock();

        let held = tables
            .keys
            .get(key)
            .and_then(|queue| queue.grant_of(txn_id));
        match held {
            Some(LockMode::Exclusive) => return Ok(()),
            Some(LockMode::Shared) if mode == LockMode::Shared => return Ok(()),
            Some(LockMode::Shared) => {
                return self.acquire_upgrade(tables, txn_id, key);
            }
            None => {}
        }

        let queue = tables.keys.entry(key.to_vec()).or_default();
        queue.waiters.push_back(Waiter { txn_id, mode });
        tables.txns.entry(txn_id).or_default();
        tables.promote(key);

        if tables.is_granted(key, txn_id, mode) {
            let txn = tables.txns.get_mut(&txn_id).unwrap();
            txn.held.insert(key.to_vec());
            return Ok(());
        }

        tables.txns.get_mut(&txn_id).unwrap().waiting_on = Some(key.to_vec());
        if tables.has_cycle_from(txn_id) {
            warn!("deadlock detected at acquire: txn {} on {} byte key", txn_id, key.len());
            tables.remove_from_key(key, txn_id);
            tables.txns.get_mut(&txn_id).unwrap().waiting_on = None;
            self.stats.record_deadlock();
            self.available.notify_all();
            return Err(StoneError::Deadlock(txn_id));
        }

        self.stats.record_lock_wait();
        debug!("txn {} waiting for {:?} lock", txn_id, mode);
        loop {
            self.available.wait(&mut tables);

            if tables.victims.remove(&txn_id) {
                tables.txns.get_mut(&txn_id).unwrap().waiting_on = None;
                self.stats.record_deadlock();
                return Err(StoneError::Deadlock(txn_id));
            }
            if tables.is_granted(key, txn_id, mode) {
                let txn = tables.txns.get_mut(&txn_id).unwrap();
                txn.waiting_on = None;
                txn.held.insert(key.to_vec());
                self.available.notify_all();
                return Ok(());
            }
        }
    }

    fn acquire_upgrade(
        &self,
        mut tables: parking_lot::MutexGuard<'_, Tables>,
        txn_id: TxnId,
        key: &[u8],
    ) -> Result<()> {
        let evicted = {
            let queue = tables.keys.get_mut(key).unwrap();
            if queue.grants.len() == 1 {
                queue.grants[0].1 = LockMode::Exclusive;
                return Ok(());
            }

            if let Some(other) = queue.upgrader {
                // Two upgraders on one key can never both proceed: each waits
                // for the other's shared grant to go away. Abort the younger.
                if txn_id > other {
                    self.stats.record_deadlock();
                    return Err(StoneError::Deadlock(txn_id));
                }
                queue.upgrader = Some(txn_id);
                Some(other)
            } else {
                queue.upgrader = Some(txn_id);
                None
            }
        };
        if let Some(other) = evicted {
            tables.victims.insert(other);
            if let Some(other_txn) = tables.txns.get_mut(&other) {
                other_txn.waiting_on = None;
            }
            self.available.notify_all();
        }
        tables.txns.entry(txn_id).or_default().waiting_on = Some(key.to_vec());

        if tables.has_cycle_from(txn_id) {
            let queue = tables.keys.get_mut(key).unwrap();
            if queue.upgrader == Some(txn_id) {
                queue.upgrader = None;
            }
            tables.txns.get_mut(&txn_id).unwrap().waiting_on = None;
            tables.promote(key);
            self.stats.record_deadlock();
            self.available.notify_all();
            return Err(StoneError::Deadlock(txn_id));
        }

        self.stats.record_lock_wait();
        debug!("txn {} waiting to upgrade", txn_id);
        loop {
            self.available.wait(&mut tables);

            if tables.victims.remove(&txn_id) {
                tables.txns.get_mut(&txn_id).unwrap().waiting_on = None;
                self.stats.record_deadlock();
                return Err(StoneError::Deadlock(txn_id));
            }
            tables.promote(key);
            if tables.is_granted(key, txn_id, LockMode::Exclusive) {
                tables.txns.get_mut(&txn_id).unwrap().waiting_on = None;
                self.available.notify_all();
                return Ok(());
            }
        }
    }

    /// Drop every grant and pending request of `txn_id` on `key`, then wake
    /// waiters to re-test grantability. Never blocks.
    pub fn release(&self, txn_id: TxnId, key: &[u8]) {
        let mut tables = self.tables.lock();
        tables.remove_from_key(key, txn_id);
        if let Some(txn) = tables.txns.get_mut(&txn_id) {
            txn.held.remove(key);
        }
        self.available.notify_all();
    }

    /// Release everything `txn_id` holds or waits for. After this the
    /// transaction appears in no lock-table entry.
    pub fn release_all(&self, txn_id: TxnId) {
        let mut tables = self.tables.lock();
        if let Some(txn) = tables.txns.remove(&txn_id) {
            for key in txn.held {
                tables.remove_from_key(&key, txn_id);
            }
            if let Some(key) = txn.waiting_on {
                tables.remove_from_key(&key, txn_id);
            }
        }
        tables.victims.remove(&txn_id);
        self.available.notify_all();
        debug!("txn {} released all locks", txn_id);
    }

    /// Keys currently locked (granted) by anyone. For diagnostics and tests.
    pub fn locked_key_count(&self) -> usize {
        self.tables.lock().keys.len()
    }
}
