// Copyright 2023 Oxide Computer Company
//! The pool context handed to the label subsystem.
//!
//! The subsystem never owns pool state; callers pass a [`Pool`] handle
//! explicitly. Exclusive operations (`label_init`, `config_sync`) take
//! `&mut Pool` and read-side operations take `&Pool`, which is the
//! configuration-lock contract enforced at compile time: whoever shares a
//! pool between tasks owns the runtime lock around it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use slog::Logger;

use crate::uberblock::UberBlock;
use crate::vdev::{VdevId, VdevTree};

/// Current on-disk version.
pub const POOL_VERSION: u64 = 10;

/// First version with double-parity raidz.
pub const POOL_VERSION_RAIDZ2: u64 = 3;

/// Pool state as recorded in a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Active,
    Exported,
    Destroyed,
    Spare,
}

impl PoolState {
    pub fn as_u64(&self) -> u64 {
        match self {
            PoolState::Active => 0,
            PoolState::Exported => 1,
            PoolState::Destroyed => 2,
            PoolState::Spare => 3,
        }
    }

    pub fn from_u64(v: u64) -> Option<PoolState> {
        match v {
            0 => Some(PoolState::Active),
            1 => Some(PoolState::Exported),
            2 => Some(PoolState::Destroyed),
            3 => Some(PoolState::Spare),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Pool GUID to the device GUIDs known to be members.
    pools: HashMap<u64, HashSet<u64>>,
    /// Shared-spare GUID to the GUID of the pool actively using it
    /// (zero while the spare is idle).
    spares: HashMap<u64, u64>,
}

/// Host-wide registries shared by every pool on the system. Labels from
/// foreign devices are judged against these: a label naming a pool this
/// host has never heard of is stale, and a GUID in the spare registry is
/// shared property.
#[derive(Debug, Default)]
pub struct HostRegistry {
    inner: Mutex<RegistryInner>,
}

impl HostRegistry {
    pub fn new() -> Arc<HostRegistry> {
        Arc::new(HostRegistry::default())
    }

    /// Make a pool (and its member devices) visible on this host.
    pub fn register_pool(&self, pool_guid: u64, devices: &[u64]) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.pools.entry(pool_guid).or_default();
        entry.extend(devices.iter().copied());
    }

    /// Does a pool with `pool_guid` exist here, and (unless zero) does it
    /// contain a device with `device_guid`?
    pub fn guid_exists(&self, pool_guid: u64, device_guid: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.pools.get(&pool_guid) {
            Some(devices) => device_guid == 0 || devices.contains(&device_guid),
            None => false,
        }
    }

    /// Register `guid` as a shared spare, initially idle.
    pub fn spare_add(&self, guid: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.spares.entry(guid).or_insert(0);
    }

    /// If `guid` is a registered spare, the GUID of the pool actively
    /// using it (zero if idle).
    pub fn spare_exists(&self, guid: u64) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.spares.get(&guid).copied()
    }

    /// Mark a spare as actively in use by `pool_guid`.
    pub fn spare_activate(&self, guid: u64, pool_guid: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.spares.insert(guid, pool_guid);
    }
}

pub struct Pool {
    pub name: String,
    pub guid: u64,
    pub version: u64,
    pub state: PoolState,
    /// The root record currently in service; [`crate::config_sync`]
    /// stamps and publishes it, everyone else only reads it.
    pub uberblock: UberBlock,
    pub tree: VdevTree,
    pub registry: Arc<HostRegistry>,
    pub log: Logger,

    /// Vdevs whose configuration changed this txg and need relabeling.
    pub(crate) config_dirty: BTreeSet<VdevId>,
    /// Which vdevs had data written in which txg; the sync barrier
    /// flushes these before publishing a new uberblock.
    txg_writes: BTreeMap<u64, BTreeSet<VdevId>>,
    /// GUIDs of spares associated with this pool, including pending adds.
    pub(crate) spares: Vec<u64>,
    /// Test hook: syncs beyond this txg silently do nothing.
    pub(crate) freeze_txg: u64,
}

impl Pool {
    pub fn new(
        name: &str,
        guid: u64,
        tree: VdevTree,
        registry: Arc<HostRegistry>,
        log: Logger,
    ) -> Pool {
        Pool {
            name: name.to_string(),
            guid,
            version: POOL_VERSION,
            state: PoolState::Active,
            uberblock: UberBlock::new(POOL_VERSION),
            tree,
            registry,
            log,
            config_dirty: BTreeSet::new(),
            txg_writes: BTreeMap::new(),
            spares: Vec::new(),
            freeze_txg: u64::MAX,
        }
    }

    /// Is `guid` one of this pool's spares (including pending adds)?
    pub fn has_spare(&self, guid: u64) -> bool {
        self.spares.contains(&guid)
    }

    /// Associate a leaf with this pool as a spare and register its GUID
    /// host-wide.
    pub(crate) fn spare_add(&mut self, vd: VdevId) {
        let guid = self.tree.node(vd).guid;
        self.tree.node_mut(vd).is_spare = true;
        if !self.spares.contains(&guid) {
            self.spares.push(guid);
        }
        if self.registry.spare_exists(guid).is_none() {
            self.registry.spare_add(guid);
        }
    }

    /// Mark a vdev's configuration dirty for the next config sync.
    pub fn dirty_config(&mut self, vd: VdevId) {
        self.config_dirty.insert(vd);
    }

    /// Record that `vd` had data written in `txg`.
    pub fn note_txg_write(&mut self, txg: u64, vd: VdevId) {
        self.txg_writes.entry(txg).or_default().insert(vd);
    }

    pub(crate) fn written_in(&self, txg: u64) -> Vec<VdevId> {
        match self.txg_writes.get(&txg) {
            Some(set) => set.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Syncs with a txg beyond `txg` become no-ops.
    pub fn freeze(&mut self, txg: u64) {
        self.freeze_txg = txg;
    }
}
