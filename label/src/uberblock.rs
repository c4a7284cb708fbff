// Copyright 2023 Oxide Computer Company
//! The uberblock: the pool's root record.
//!
//! Every label slot carries a ring of uberblock cells, rewritten round
//! robin by transaction group. At import the loader scans every cell of
//! every slot of every readable leaf and elects the best candidate.
//!
//! Ordering is lexicographic on `(txg, timestamp)`. The timestamp
//! tie-break matters: if power is lost after the first uberblock for a
//! txg lands on a mirror half that then drops out, the surviving half can
//! sync the same txg again. When the missing half returns, two uberblocks
//! with equal txg coexist, and the one stamped later is the one that was
//! actually in service.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::geometry::{
    uberblock_cell_count, uberblock_cell_offset, uberblock_cell_shift, LABEL_COUNT,
};
use crate::io;
use crate::pool::POOL_VERSION;
use crate::vdev::{VdevId, VdevTree};
use cistern_common::PoolError;

pub const UBERBLOCK_MAGIC: u64 = 0x00bab10c;

/// Pointer to the root of the meta object set. The label subsystem never
/// dereferences it; it only needs the birth txg to tell whether anything
/// was written in a given transaction group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockPtr {
    pub vdev: u64,
    pub offset: u64,
    pub asize: u64,
    pub birth_txg: u64,
    pub fill: u64,
    pub checksum: [u64; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UberBlock {
    pub magic: u64,
    pub version: u64,
    pub txg: u64,
    /// Wrapping sum of all leaf GUIDs at the time of writing; importers
    /// use a mismatch to detect missing devices.
    pub guid_sum: u64,
    /// Seconds since the epoch.
    pub timestamp: u64,
    pub rootbp: BlockPtr,
}

impl UberBlock {
    pub fn new(version: u64) -> Self {
        UberBlock {
            magic: UBERBLOCK_MAGIC,
            version,
            txg: 0,
            guid_sum: 0,
            timestamp: now_secs(),
            rootbp: BlockPtr::default(),
        }
    }

    /// Magic and version sanity; the payload checksum is the I/O
    /// pipeline's business and has already been enforced on the read.
    pub fn verify(&self) -> bool {
        self.magic == UBERBLOCK_MAGIC && self.version >= 1 && self.version <= POOL_VERSION
    }

    /// The crash-reconciliation order: txg first, timestamp breaking ties.
    pub fn compare(&self, other: &UberBlock) -> CmpOrdering {
        (self.txg, self.timestamp).cmp(&(other.txg, other.timestamp))
    }

    /// Stamp this uberblock for `txg` and report whether the root block
    /// pointer was rewritten in this transaction group (i.e. whether the
    /// pool has anything to say).
    pub fn update(&mut self, guid_sum: u64, txg: u64) -> bool {
        self.txg = txg;
        self.guid_sum = guid_sum;
        self.timestamp = now_secs();
        self.rootbp.birth_txg == txg
    }

    /// Encode into a zero-padded cell image sized for a leaf with the
    /// given alignment shift.
    pub fn to_cell(&self, ashift: u64) -> Result<Bytes, PoolError> {
        let mut buf = vec![0u8; 1usize << uberblock_cell_shift(ashift)];
        bincode::serialize_into(&mut buf[..], self)
            .map_err(|e| PoolError::InvalidArgument(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    pub fn from_cell(buf: &[u8]) -> Option<UberBlock> {
        bincode::deserialize(buf).ok()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Scan every uberblock cell on every slot of every live leaf under `vd`
/// and return the best candidate that verifies. Reads run concurrently;
/// a shared mutex guards the best-so-far. Unreadable or garbage cells are
/// simply skipped: the loader never fails, it just may come back with a
/// default (zero-txg, unverifiable) record if nothing at all was found.
pub async fn uberblock_load(tree: &VdevTree, vd: VdevId) -> UberBlock {
    let best = Mutex::new(UberBlock::default());

    let mut cells: Vec<(VdevId, usize, u64)> = Vec::new();
    for leaf in tree.leaves_under(vd) {
        let node = tree.node(leaf);
        if node.is_dead() {
            continue;
        }
        for l in 0..LABEL_COUNT {
            for n in 0..uberblock_cell_count(node.ashift) {
                cells.push((leaf, l, n));
            }
        }
    }

    join_all(cells.into_iter().map(|(leaf, l, n)| {
        let best = &best;
        async move {
            let node = tree.node(leaf);
            let mut buf = vec![0u8; 1usize << uberblock_cell_shift(node.ashift)];
            let within = uberblock_cell_offset(node.ashift, n);
            if io::read_slot(node, l, within, &mut buf).await.is_err() {
                return;
            }
            if let Some(ub) = UberBlock::from_cell(&buf) {
                if ub.verify() {
                    let mut best = best.lock().unwrap();
                    if ub.compare(&best) == CmpOrdering::Greater {
                        *best = ub;
                    }
                }
            }
        }
    }))
    .await;

    best.into_inner().unwrap()
}
