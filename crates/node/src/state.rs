use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use jointmesh_primitives::id::UnitId;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Mutable state of the sync layer shared by every handler.
#[derive(Debug)]
pub(crate) struct NodeState {
    catching_up: AtomicBool,
    waiting_for_catchup_chain: AtomicBool,
    /// A poll loop is waiting for the current hash tree to be drained.
    draining_hash_tree: AtomicBool,
    waiting_till_idle: AtomicBool,
    coming_online_at: Mutex<Instant>,
    /// When each unit was last requested with `get_joint`.
    requested: Mutex<HashMap<UnitId, Instant>>,
    pub(crate) units_in_work: UnitsInWork,
    /// Addresses of the local wallet.
    watched_addresses: Mutex<BTreeSet<String>>,
}

impl NodeState {
    pub(crate) fn new() -> Self {
        Self {
            catching_up: AtomicBool::new(false),
            waiting_for_catchup_chain: AtomicBool::new(false),
            draining_hash_tree: AtomicBool::new(false),
            waiting_till_idle: AtomicBool::new(false),
            coming_online_at: Mutex::new(Instant::now()),
            requested: Mutex::default(),
            units_in_work: UnitsInWork::default(),
            watched_addresses: Mutex::default(),
        }
    }

    pub(crate) fn is_catching_up(&self) -> bool {
        self.catching_up.load(Ordering::Acquire)
    }

    pub(crate) fn set_catching_up(&self, value: bool) {
        self.catching_up.store(value, Ordering::Release);
    }

    pub(crate) fn is_waiting_for_catchup_chain(&self) -> bool {
        self.waiting_for_catchup_chain.load(Ordering::Acquire)
    }

    pub(crate) fn set_waiting_for_catchup_chain(&self, value: bool) {
        self.waiting_for_catchup_chain
            .store(value, Ordering::Release);
    }

    /// Returns `false` if a drain poll is already running.
    pub(crate) fn begin_draining_hash_tree(&self) -> bool {
        !self.draining_hash_tree.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_draining_hash_tree(&self) {
        self.draining_hash_tree.store(false, Ordering::Release);
    }

    pub(crate) fn begin_waiting_till_idle(&self) -> bool {
        !self.waiting_till_idle.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_waiting_till_idle(&self) {
        self.waiting_till_idle.store(false, Ordering::Release);
    }

    pub(crate) fn came_online(&self) {
        *self.coming_online_at.lock() = Instant::now();
    }

    pub(crate) fn online_for(&self) -> Duration {
        self.coming_online_at.lock().elapsed()
    }

    /// Records a `get_joint` for `unit` unless one was sent within `window`.
    pub(crate) fn mark_requested(&self, unit: &UnitId, window: Duration) -> bool {
        let mut requested = self.requested.lock();

        if let Some(at) = requested.get(unit) {
            if at.elapsed() <= window {
                return false;
            }
        }

        drop(requested.insert(unit.clone(), Instant::now()));

        true
    }

    pub(crate) fn forget_requested(&self, unit: &UnitId) {
        drop(self.requested.lock().remove(unit));
    }

    pub(crate) fn watch_addresses(&self, addresses: impl IntoIterator<Item = String>) {
        self.watched_addresses.lock().extend(addresses);
    }

    pub(crate) fn watches_any<'a>(&self, addresses: impl IntoIterator<Item = &'a str>) -> bool {
        let watched = self.watched_addresses.lock();

        addresses.into_iter().any(|address| watched.contains(address))
    }

    pub(crate) fn watched_addresses(&self) -> Vec<String> {
        self.watched_addresses.lock().iter().cloned().collect()
    }
}

/// Units currently going through admission, process wide.
#[derive(Clone, Debug, Default)]
pub(crate) struct UnitsInWork {
    units: Arc<Mutex<HashSet<UnitId>>>,
}

impl UnitsInWork {
    /// Claims `unit`, or returns `None` if someone else is admitting it.
    pub(crate) fn try_acquire(&self, unit: &UnitId) -> Option<UnitGuard> {
        if !self.units.lock().insert(unit.clone()) {
            return None;
        }

        Some(UnitGuard {
            units: Arc::clone(&self.units),
            unit: unit.clone(),
        })
    }

    pub(crate) fn contains(&self, unit: &UnitId) -> bool {
        self.units.lock().contains(unit)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.units.lock().is_empty()
    }
}

/// Releases the unit when dropped.
#[derive(Debug)]
pub(crate) struct UnitGuard {
    units: Arc<Mutex<HashSet<UnitId>>>,
    unit: UnitId,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        let _removed = self.units.lock().remove(&self.unit);
    }
}
