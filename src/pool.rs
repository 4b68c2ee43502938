//! Pool allocator and lease reaper.
//!
//! One `PoolManager` owns the pool for a process. Compound operations
//! serialize on an in-process mutex first, then take the store's
//! cross-process flock; that order is the same everywhere, so the two
//! locks cannot deadlock. No pool state is cached in memory — every
//! operation re-reads the collections from the store.

use crate::error::{PoolError, Result};
use crate::store::{LeaseRecord, PoolSnapshot, PoolStore, StoreView, VmId};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Directory holding the persisted collections and the lock artifact.
    pub state_dir: PathBuf,
    /// Highest VM id; the pool manages ids `0..=max_id`.
    pub max_id: VmId,
    /// Seconds between reaper sweeps, and the amount a silent lease's
    /// lifetime shrinks per sweep.
    pub sweep_interval: u64,
}

pub struct PoolManager {
    store: PoolStore,
    gate: Mutex<()>,
    max_id: VmId,
    sweep_interval: u64,
}

impl PoolManager {
    pub fn open(config: PoolConfig) -> Result<Self> {
        let store = PoolStore::open(&config.state_dir, config.max_id)?;
        Ok(Self {
            store,
            gate: Mutex::new(()),
            max_id: config.max_id,
            sweep_interval: config.sweep_interval,
        })
    }

    pub fn max_id(&self) -> VmId {
        self.max_id
    }

    pub fn sweep_interval(&self) -> u64 {
        self.sweep_interval
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        // The mutex guards no in-memory data, so a panic while holding it
        // cannot leave anything inconsistent.
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease the most recently freed VM. Fails with `PoolExhausted`,
    /// leaving the store untouched, when no VM is free.
    pub fn allocate(&self) -> Result<VmId> {
        let _gate = self.gate();
        let id = self.store.with_lock(|view| {
            let mut free = view.load_free()?;
            let Some(id) = free.pop() else {
                return Err(PoolError::PoolExhausted);
            };
            let mut leased = view.load_leased()?;
            leased.push(id);
            view.save_free(&free)?;
            view.save_leased(&leased)?;
            Ok(id)
        })?;
        info!(vm_id = id, "Allocated VM");
        Ok(id)
    }

    /// Return a VM to the free list and drop its lease record. Idempotent:
    /// releasing a free or out-of-range id is a no-op, never an error.
    pub fn release(&self, id: VmId) -> Result<()> {
        let _gate = self.gate();
        let released = self.store.with_lock(|view| release_one(view, id))?;
        if released {
            info!(vm_id = id, "Released VM");
        }
        Ok(())
    }

    /// Release every leased VM in one gated sequence. Returns the ids
    /// that were released.
    pub fn release_all(&self) -> Result<Vec<VmId>> {
        let _gate = self.gate();
        let released = self.store.with_lock(|view| {
            let mut leased = view.load_leased()?;
            if leased.is_empty() {
                return Ok(Vec::new());
            }
            let released = leased.clone();
            let mut free = view.load_free()?;
            free.append(&mut leased);
            view.save_leased(&leased)?;
            view.save_free(&free)?;
            view.save_leases(&Default::default())?;
            Ok(released)
        })?;
        if !released.is_empty() {
            info!(count = released.len(), "Released all VMs");
        }
        Ok(released)
    }

    pub fn is_leased(&self, id: VmId) -> Result<bool> {
        let _gate = self.gate();
        self.store
            .with_lock(|view| Ok(view.load_leased()?.contains(&id)))
    }

    /// Declare the idle allowance for an already-leased VM. Overwrites any
    /// existing record with a full budget and a cleared heartbeat.
    pub fn set_lease(&self, id: VmId, timeout: u64) -> Result<()> {
        let _gate = self.gate();
        self.store.with_lock(|view| {
            if !view.load_leased()?.contains(&id) {
                return Err(PoolError::LeaseNotFound(id));
            }
            let mut leases = view.load_leases()?;
            leases.insert(
                id,
                LeaseRecord {
                    timeout,
                    lifetime: timeout,
                    visited: false,
                },
            );
            view.save_leases(&leases)
        })?;
        info!(vm_id = id, timeout, "Set VM lease timeout");
        Ok(())
    }

    /// Record a heartbeat on a lease. The next sweep restores the full
    /// budget instead of decrementing. Ignores ids without a record, so
    /// handler activity racing a release stays harmless.
    pub fn touch(&self, id: VmId) -> Result<()> {
        let _gate = self.gate();
        self.store.with_lock(|view| {
            let mut leases = view.load_leases()?;
            if let Some(record) = leases.get_mut(&id) {
                record.visited = true;
                view.save_leases(&leases)?;
            }
            Ok(())
        })
    }

    /// One reaper pass. Heartbeats forgive the full budget; silent leases
    /// lose one sweep interval of lifetime. Leases at zero — including
    /// leased VMs that never declared a timeout — are reclaimed with the
    /// same transition as a voluntary release. Returns the reclaimed ids.
    pub fn sweep(&self) -> Result<Vec<VmId>> {
        let _gate = self.gate();
        let reclaimed = self.store.with_lock(|view| {
            let mut leased = view.load_leased()?;
            let mut free = view.load_free()?;
            let mut leases = view.load_leases()?;

            let mut reclaimed = Vec::new();
            for id in leased.clone() {
                let expired = match leases.get_mut(&id) {
                    Some(record) => {
                        if record.visited {
                            record.visited = false;
                            record.lifetime = record.timeout;
                        } else {
                            record.lifetime =
                                record.lifetime.saturating_sub(self.sweep_interval);
                        }
                        record.lifetime == 0
                    }
                    None => true,
                };
                if expired {
                    leases.remove(&id);
                    leased.retain(|&v| v != id);
                    free.push(id);
                    reclaimed.push(id);
                }
            }

            view.save_leased(&leased)?;
            view.save_free(&free)?;
            view.save_leases(&leases)?;
            Ok(reclaimed)
        })?;
        if !reclaimed.is_empty() {
            info!(vm_ids = ?reclaimed, "Reclaimed expired VM leases");
        }
        Ok(reclaimed)
    }

    /// Unguarded read of the whole pool, for display and tests only.
    pub fn snapshot(&self) -> Result<PoolSnapshot> {
        self.store.read_unlocked()
    }
}

fn release_one(view: &StoreView<'_>, id: VmId) -> Result<bool> {
    let mut leased = view.load_leased()?;
    let Some(pos) = leased.iter().position(|&v| v == id) else {
        return Ok(false);
    };
    leased.remove(pos);
    let mut free = view.load_free()?;
    free.push(id);
    let mut leases = view.load_leases()?;
    leases.remove(&id);
    view.save_leased(&leased)?;
    view.save_free(&free)?;
    view.save_leases(&leases)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_pool(max_id: VmId) -> (TempDir, PoolManager) {
        let dir = TempDir::new().unwrap();
        let pool = PoolManager::open(PoolConfig {
            state_dir: dir.path().join("state"),
            max_id,
            sweep_interval: 60,
        })
        .unwrap();
        (dir, pool)
    }

    fn assert_invariant(pool: &PoolManager) {
        let snap = pool.snapshot().unwrap();
        snap.check_invariant(pool.max_id()).unwrap();
    }

    #[test]
    fn allocates_vm_zero_first() {
        let (_dir, pool) = open_pool(5);
        assert_eq!(pool.allocate().unwrap(), 0);
        assert_eq!(pool.allocate().unwrap(), 1);
        assert_invariant(&pool);
    }

    #[test]
    fn reuses_most_recently_freed_vm() {
        let (_dir, pool) = open_pool(5);
        for _ in 0..3 {
            pool.allocate().unwrap();
        }
        pool.release(1).unwrap();
        assert_eq!(pool.allocate().unwrap(), 1);
        assert_invariant(&pool);
    }

    #[test]
    fn exhaustion_fails_without_mutating_state() {
        let (_dir, pool) = open_pool(2);
        for _ in 0..3 {
            pool.allocate().unwrap();
        }
        let before = pool.snapshot().unwrap();
        assert!(matches!(pool.allocate(), Err(PoolError::PoolExhausted)));
        let after = pool.snapshot().unwrap();
        assert_eq!(before.free, after.free);
        assert_eq!(before.leased, after.leased);
        assert_invariant(&pool);
    }

    #[test]
    fn release_is_idempotent() {
        let (_dir, pool) = open_pool(3);
        let id = pool.allocate().unwrap();
        pool.release(id).unwrap();
        let once = pool.snapshot().unwrap();
        pool.release(id).unwrap();
        let twice = pool.snapshot().unwrap();
        assert_eq!(once.free, twice.free);
        assert_eq!(once.leased, twice.leased);
        assert_invariant(&pool);
    }

    #[test]
    fn releasing_out_of_range_id_is_a_noop() {
        let (_dir, pool) = open_pool(3);
        pool.release(999).unwrap();
        assert_invariant(&pool);
    }

    #[test]
    fn set_lease_requires_a_leased_vm() {
        let (_dir, pool) = open_pool(3);
        assert!(matches!(
            pool.set_lease(0, 100),
            Err(PoolError::LeaseNotFound(0))
        ));
    }

    #[test]
    fn silent_lease_expires_after_its_budget() {
        let (_dir, pool) = open_pool(3);
        let id = pool.allocate().unwrap();
        pool.set_lease(id, 120).unwrap();

        assert!(pool.sweep().unwrap().is_empty());
        let snap = pool.snapshot().unwrap();
        assert_eq!(snap.leases[&id].lifetime, 60);

        assert_eq!(pool.sweep().unwrap(), vec![id]);
        assert!(!pool.is_leased(id).unwrap());
        assert_invariant(&pool);
    }

    #[test]
    fn heartbeat_restores_the_full_budget() {
        let (_dir, pool) = open_pool(3);
        let id = pool.allocate().unwrap();
        pool.set_lease(id, 120).unwrap();

        assert!(pool.sweep().unwrap().is_empty());
        pool.touch(id).unwrap();
        assert!(pool.sweep().unwrap().is_empty());

        let snap = pool.snapshot().unwrap();
        assert!(pool.is_leased(id).unwrap());
        assert_eq!(snap.leases[&id].lifetime, 120);
        assert!(!snap.leases[&id].visited);
    }

    #[test]
    fn lease_without_declared_timeout_is_reclaimed() {
        let (_dir, pool) = open_pool(3);
        let id = pool.allocate().unwrap();
        assert_eq!(pool.sweep().unwrap(), vec![id]);
        assert_invariant(&pool);
    }

    #[test]
    fn release_all_then_reallocate_yields_distinct_ids() {
        let (_dir, pool) = open_pool(12);
        for _ in 0..5 {
            pool.allocate().unwrap();
        }
        let released = pool.release_all().unwrap();
        assert_eq!(released.len(), 5);
        assert!(pool.snapshot().unwrap().leased.is_empty());

        let mut ids = HashSet::new();
        for _ in 0..3 {
            let id = pool.allocate().unwrap();
            assert!(id <= 12);
            assert!(ids.insert(id));
        }
        assert_invariant(&pool);
    }

    #[test]
    fn release_all_drops_every_lease_record() {
        let (_dir, pool) = open_pool(3);
        for _ in 0..2 {
            let id = pool.allocate().unwrap();
            pool.set_lease(id, 300).unwrap();
        }
        pool.release_all().unwrap();
        assert!(pool.snapshot().unwrap().leases.is_empty());
        assert_invariant(&pool);
    }

    #[test]
    fn concurrent_allocates_hand_out_distinct_ids() {
        let (_dir, pool) = open_pool(7);
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.allocate().unwrap())
            })
            .collect();

        let ids: HashSet<VmId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 8);
        assert!(pool.snapshot().unwrap().free.is_empty());
        assert_invariant(&pool);
    }
}
