//! Persistent pool state: three JSON collections plus a lock artifact,
//! all living under one state directory shared by every process that
//! touches the pool.

use crate::error::{PoolError, Result};
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Identifier of one slot in the pool. The full ID space is fixed at
/// initialization; IDs are never created or destroyed at runtime.
pub type VmId = u32;

/// Per-lease metadata, keyed by VM id. Exists only while the VM is leased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Idle allowance declared at lease time, in seconds.
    pub timeout: u64,
    /// Counts down from `timeout`; the reaper reclaims the VM at zero.
    pub lifetime: u64,
    /// Set by any activity on the lease, consumed by the reaper.
    #[serde(default)]
    pub visited: bool,
}

/// A point-in-time copy of all three collections, for display and tests.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub free: Vec<VmId>,
    pub leased: Vec<VmId>,
    pub leases: HashMap<VmId, LeaseRecord>,
}

impl PoolSnapshot {
    /// Check the pool invariant: `free` and `leased` are disjoint and
    /// together cover exactly `0..=max_id`, with no duplicates.
    pub fn check_invariant(&self, max_id: VmId) -> std::result::Result<(), String> {
        let mut seen = vec![0u8; max_id as usize + 1];
        for &id in self.free.iter().chain(self.leased.iter()) {
            if id > max_id {
                return Err(format!("VM {} is outside the pool range 0..={}", id, max_id));
            }
            seen[id as usize] += 1;
        }
        for (id, count) in seen.iter().enumerate() {
            match count {
                0 => return Err(format!("VM {} is in neither free nor leased", id)),
                1 => {}
                _ => return Err(format!("VM {} appears {} times", id, count)),
            }
        }
        for id in self.leases.keys() {
            if !self.leased.contains(id) {
                return Err(format!("lease record for VM {} which is not leased", id));
            }
        }
        Ok(())
    }
}

/// File-backed store for the pool collections. All mutation goes through
/// [`PoolStore::with_lock`], which holds an exclusive `flock` on the lock
/// artifact for the whole read-modify-write sequence so that concurrent
/// processes never act on a stale snapshot.
pub struct PoolStore {
    free_path: PathBuf,
    leased_path: PathBuf,
    leases_path: PathBuf,
    lock_path: PathBuf,
}

impl PoolStore {
    /// Open the store at `state_dir`, seeding any missing collection file
    /// with its default. Seeding only ever fills gaps; existing files are
    /// never overwritten, so first-run initialization happens exactly once.
    pub fn open(state_dir: &Path, max_id: VmId) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let store = Self {
            free_path: state_dir.join("free.json"),
            leased_path: state_dir.join("leased.json"),
            leases_path: state_dir.join("leases.json"),
            lock_path: state_dir.join("pool.lock"),
        };
        store.with_lock(|view| {
            if !view.store.free_path.exists() {
                // Descending so that popping from the end hands out VM 0 first.
                let seed: Vec<VmId> = (0..=max_id).rev().collect();
                view.save_free(&seed)?;
            }
            if !view.store.leased_path.exists() {
                view.save_leased(&[])?;
            }
            if !view.store.leases_path.exists() {
                view.save_leases(&HashMap::new())?;
            }
            Ok(())
        })?;
        Ok(store)
    }

    /// Run `f` with exclusive cross-process access to the collections.
    /// The flock is released when the guard drops, even if `f` errors.
    pub fn with_lock<T>(&self, f: impl FnOnce(&StoreView<'_>) -> Result<T>) -> Result<T> {
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        let _guard = Flock::lock(lock_file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| PoolError::Io(errno.into()))?;
        f(&StoreView { store: self })
    }

    /// Read all three collections without taking any lock. Display and
    /// debugging only; never an input to allocation decisions.
    pub fn read_unlocked(&self) -> Result<PoolSnapshot> {
        Ok(PoolSnapshot {
            free: read_json(&self.free_path)?,
            leased: read_json(&self.leased_path)?,
            leases: read_json(&self.leases_path)?,
        })
    }
}

/// Access to the collections while the cross-process lock is held.
/// Each write replaces one whole file; the triple is best-effort rather
/// than transactional, which `status` can audit out-of-band.
pub struct StoreView<'a> {
    store: &'a PoolStore,
}

impl StoreView<'_> {
    pub fn load_free(&self) -> Result<Vec<VmId>> {
        read_json(&self.store.free_path)
    }

    pub fn save_free(&self, free: &[VmId]) -> Result<()> {
        write_json(&self.store.free_path, &free)
    }

    pub fn load_leased(&self) -> Result<Vec<VmId>> {
        read_json(&self.store.leased_path)
    }

    pub fn save_leased(&self, leased: &[VmId]) -> Result<()> {
        write_json(&self.store.leased_path, &leased)
    }

    pub fn load_leases(&self) -> Result<HashMap<VmId, LeaseRecord>> {
        read_json(&self.store.leases_path)
    }

    pub fn save_leases(&self, leases: &HashMap<VmId, LeaseRecord>) -> Result<()> {
        write_json(&self.store.leases_path, leases)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, max_id: VmId) -> PoolStore {
        PoolStore::open(&dir.path().join("state"), max_id).unwrap()
    }

    #[test]
    fn first_run_seeds_full_descending_range() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 3);
        let snap = store.read_unlocked().unwrap();
        assert_eq!(snap.free, vec![3, 2, 1, 0]);
        assert!(snap.leased.is_empty());
        assert!(snap.leases.is_empty());
    }

    #[test]
    fn reopen_does_not_reseed() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 3);
        store
            .with_lock(|v| {
                v.save_free(&[3, 2, 1])?;
                v.save_leased(&[0])
            })
            .unwrap();
        drop(store);

        let store = open_store(&dir, 3);
        let snap = store.read_unlocked().unwrap();
        assert_eq!(snap.free, vec![3, 2, 1]);
        assert_eq!(snap.leased, vec![0]);
    }

    #[test]
    fn lease_records_round_trip_by_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 3);
        let mut leases = HashMap::new();
        leases.insert(
            2,
            LeaseRecord {
                timeout: 120,
                lifetime: 60,
                visited: true,
            },
        );
        store.with_lock(|v| v.save_leases(&leases)).unwrap();

        let loaded = store.with_lock(|v| v.load_leases()).unwrap();
        assert_eq!(loaded, leases);
    }

    #[test]
    fn corrupt_collection_is_a_typed_error() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 3);
        fs::write(dir.path().join("state/free.json"), "not json").unwrap();
        let err = store.with_lock(|v| v.load_free()).unwrap_err();
        assert!(matches!(err, PoolError::Corrupt(_)));
    }

    #[test]
    fn missing_collection_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 3);
        fs::remove_file(dir.path().join("state/leased.json")).unwrap();
        let err = store.with_lock(|v| v.load_leased()).unwrap_err();
        assert!(matches!(err, PoolError::Io(_)));
    }

    #[test]
    fn invariant_check_catches_violations() {
        let complete = PoolSnapshot {
            free: vec![2, 0],
            leased: vec![1],
            leases: HashMap::new(),
        };
        assert!(complete.check_invariant(2).is_ok());

        let missing = PoolSnapshot {
            free: vec![2],
            leased: vec![1],
            leases: HashMap::new(),
        };
        assert!(missing.check_invariant(2).is_err());

        let duplicated = PoolSnapshot {
            free: vec![0, 1],
            leased: vec![1, 2],
            leases: HashMap::new(),
        };
        assert!(duplicated.check_invariant(2).is_err());
    }
}
