//! Device registry.
//!
//! Committed device records keyed by account and [`DeviceKey`]. Every mutation
//! builds the account's next state, persists it, and only then swaps it in, so
//! readers see either the prior or the new record set.
//!
//! Writers for one account are serialized by a per-account lock that is held
//! across the file write. Persistence is blocking file I/O on the caller's
//! thread; readers and other accounts are never held up by it.

mod device;
mod store;

pub use device::{DeviceKey, DeviceRecord, ListField, PendingEdits, ScalarField};
pub use store::RegistryStore;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{Error, Result};

type AccountDevices = BTreeMap<DeviceKey, Arc<DeviceRecord>>;

/// Durable store of device records.
pub struct Registry {
    store: Option<RegistryStore>,
    accounts: RwLock<HashMap<String, AccountDevices>>,
    writers: DashMap<String, Arc<Mutex<()>>>,
}

impl Registry {
    /// A registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            store: None,
            accounts: RwLock::new(HashMap::new()),
            writers: DashMap::new(),
        }
    }

    /// Open a file-backed registry, loading every account found in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = RegistryStore::open(dir)?;
        let loaded = store.load_all()?;

        let accounts: HashMap<String, AccountDevices> = loaded
            .into_iter()
            .map(|(account, devices)| {
                let devices = devices
                    .into_iter()
                    .map(|record| (record.key.clone(), Arc::new(record)))
                    .collect();
                (account, devices)
            })
            .collect();

        info!(
            dir = %store.dir().display(),
            accounts = accounts.len(),
            "Device registry opened"
        );

        Ok(Self {
            store: Some(store),
            accounts: RwLock::new(accounts),
            writers: DashMap::new(),
        })
    }

    /// Merge `edits` into the record at `key`, creating it if absent.
    pub fn commit(
        &self,
        account: &str,
        key: &DeviceKey,
        edits: &PendingEdits,
    ) -> Result<Arc<DeviceRecord>> {
        self.mutate(account, |devices| {
            let mut record = devices
                .get(key)
                .map(|r| DeviceRecord::clone(r))
                .unwrap_or_else(|| DeviceRecord::new(key.clone()));
            edits.apply_to(&mut record);
            let record = Arc::new(record);
            devices.insert(key.clone(), Arc::clone(&record));
            record
        })
        .inspect(|_| debug!(account, device = %key, "Committed device registration"))
    }

    /// Fetch a single record.
    pub fn get(&self, account: &str, key: &DeviceKey) -> Option<Arc<DeviceRecord>> {
        self.accounts
            .read()
            .get(account)
            .and_then(|devices| devices.get(key))
            .cloned()
    }

    /// Snapshot of an account's records.
    pub fn devices(&self, account: &str) -> Vec<Arc<DeviceRecord>> {
        self.accounts
            .read()
            .get(account)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all accounts with at least one record.
    pub fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .accounts
            .read()
            .iter()
            .filter(|(_, devices)| !devices.is_empty())
            .map(|(account, _)| account.clone())
            .collect();
        accounts.sort();
        accounts
    }

    /// Total number of records across accounts.
    pub fn device_count(&self) -> usize {
        self.accounts.read().values().map(BTreeMap::len).sum()
    }

    /// Increment the badge of each listed device, returning the updated records.
    ///
    /// Keys that are no longer registered are skipped.
    pub fn bump_badges(&self, account: &str, keys: &[DeviceKey]) -> Result<Vec<Arc<DeviceRecord>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        self.mutate(account, |devices| {
            keys.iter()
                .filter_map(|key| {
                    let current = devices.get(key)?;
                    let mut record = DeviceRecord::clone(current);
                    record.badge = record.badge.saturating_add(1);
                    let record = Arc::new(record);
                    devices.insert(key.clone(), Arc::clone(&record));
                    Some(record)
                })
                .collect()
        })
    }

    /// Reset a device's badge to zero. Returns whether the device exists.
    pub fn reset_badge(&self, account: &str, key: &DeviceKey) -> Result<bool> {
        let needs_reset = self.get(account, key).is_some_and(|r| r.badge > 0);
        if !needs_reset {
            return Ok(self.get(account, key).is_some());
        }

        self.mutate(account, |devices| match devices.get(key) {
            Some(current) => {
                let mut record = DeviceRecord::clone(current);
                record.badge = 0;
                devices.insert(key.clone(), Arc::new(record));
                true
            }
            None => false,
        })
    }

    /// Remove every record of `device_id` under `account`. Returns how many were removed.
    pub fn remove_device(&self, account: &str, device_id: &str) -> Result<usize> {
        let present = self
            .devices(account)
            .iter()
            .any(|r| r.key.device_id == device_id);
        if !present {
            return Err(Error::not_found("device", device_id));
        }

        self.mutate(account, |devices| {
            let before = devices.len();
            devices.retain(|key, _| key.device_id != device_id);
            before - devices.len()
        })
        .inspect(|removed| info!(account, device_id, removed, "Removed device registrations"))
    }

    /// Drop an account and its persisted file.
    pub fn purge_account(&self, account: &str) -> Result<bool> {
        let writer = self.writer(account);
        let _guard = writer.lock();

        let existed_on_disk = match &self.store {
            Some(store) => store.remove(account)?,
            None => false,
        };
        let existed = self.accounts.write().remove(account).is_some() || existed_on_disk;
        if existed {
            info!(account, "Purged account registry");
        }
        Ok(existed)
    }

    /// Apply `f` to a copy of the account's records, persist, then publish.
    fn mutate<T, F>(&self, account: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut AccountDevices) -> T,
    {
        let writer = self.writer(account);
        let _guard = writer.lock();

        let mut next = self
            .accounts
            .read()
            .get(account)
            .cloned()
            .unwrap_or_default();
        let output = f(&mut next);

        if let Some(store) = &self.store {
            store.save(account, next.values().map(|r| r.as_ref()))?;
        }

        self.accounts.write().insert(account.to_string(), next);
        Ok(output)
    }

    fn writer(&self, account: &str) -> Arc<Mutex<()>> {
        self.writers.entry(account.to_string()).or_default().clone()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::in_memory()
    }
}
