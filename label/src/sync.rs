// Copyright 2023 Oxide Computer Company
//! The ordered commit of a new pool root.
//!
//! `config_sync` is the crash-consistency boundary of the pool. Its
//! phases (flush, even labels, flush, uberblocks, flush, odd labels,
//! flush) are ordered so that an arbitrary power cut leaves a readable
//! pool:
//!
//! * dies during the even pass: those labels carry a txg newer than any
//!   uberblock on disk, so import rejects them and the untouched odd
//!   labels pair with the old uberblock;
//! * dies during the uberblock pass: either no new uberblock landed (old
//!   root, odd labels) or one did (new root wins the election, and the
//!   even labels it needs are already durable);
//! * dies during the odd pass: the new root and even labels are already
//!   safe, odd labels are allowed to lag.
//!
//! Every phase may be rerun: a partial failure is retried by simply
//! calling `config_sync` again with the same txg.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use slog::{debug, info};

use crate::config::label_config_generate;
use crate::device::BlockDevice;
use crate::geometry::{
    uberblock_cell_count, uberblock_cell_offset, LABEL_COUNT, PHYS_OFFSET, PHYS_SIZE,
};
use crate::io::{self, SlotWrite};
use crate::pool::Pool;
use crate::uberblock::UberBlock;
use crate::vdev::VdevId;
use cistern_common::PoolError;

/// Commit the configuration and uberblock for `txg`, syncing uberblocks
/// into the tree under `uvd`. On error the pool is still openable at its
/// previous state; the caller may retry with the same txg.
pub async fn config_sync(pool: &mut Pool, uvd: VdevId, txg: u64) -> Result<(), PoolError> {
    debug_assert!(pool.uberblock.txg <= txg);
    let rvd = pool.tree.root();

    // If this is not a resync after errors, and neither the meta object
    // set nor any vdev configuration changed in this txg, there is
    // nothing to publish. The uberblock still gets stamped for `txg`.
    if pool.uberblock.txg < txg {
        let guid_sum = pool.tree.root_guid_sum();
        let changed = pool.uberblock.update(guid_sum, txg);
        if !changed && pool.config_dirty.is_empty() {
            debug!(pool.log, "nothing to sync in {} for txg {}", pool.name, txg);
            return Ok(());
        }
    }

    if txg > pool.freeze_txg {
        return Ok(());
    }

    info!(pool.log, "syncing {} config for txg {}", pool.name, txg);

    // Flush every disk written in this txg, so that all data blocks are
    // on stable storage before any uberblock that references them.
    io::flush_batch(live_devices(pool, pool.written_in(txg))).await;

    // Even labels (slots 0 and 2) for every dirty vdev. If nothing at
    // all gets written, which includes the "dirty list is empty" case,
    // the whole tree is dirtied and the pass reruns once, so at least
    // one label set is brought up to date before the uberblock moves.
    let mut retry_avail = true;
    loop {
        let mut good_writes = 0u64;
        let mut last_error = None;
        for vd in dirty_list(pool) {
            for l in [0, 2] {
                match sync_labels(pool, vd, l, txg).await {
                    Ok(()) => good_writes += 1,
                    Err(e) => last_error = Some(e),
                }
            }
        }

        if good_writes == 0 && retry_avail {
            debug!(pool.log, "no good label writes in txg {}, retrying", txg);
            pool.dirty_config(rvd);
            retry_avail = false;
            continue;
        }
        if good_writes == 0 {
            return Err(last_error.unwrap_or(PoolError::NoDevice));
        }
        break;
    }

    // Even labels must be durable before the uberblock that matches them.
    io::flush_batch(live_devices(pool, dirty_list(pool))).await;

    // The uberblock, to every slot of every live leaf under `uvd`; if
    // that subtree takes no writes at all, fall back to the whole tree.
    let ub = pool.uberblock;
    let mut result = uberblock_sync_tree(pool, &ub, uvd, txg).await;
    if result.is_err() && uvd != rvd {
        result = uberblock_sync_tree(pool, &ub, rvd, txg).await;
    }
    result?;

    // The new root must be durable before the odd labels are touched;
    // from here on the even labels and new uberblock carry the pool.
    io::flush_batch(live_devices(pool, [uvd])).await;

    // Odd labels (slots 1 and 3).
    let mut good_writes = 0u64;
    let mut last_error = None;
    for vd in dirty_list(pool) {
        for l in [1, 3] {
            match sync_labels(pool, vd, l, txg).await {
                Ok(()) => good_writes += 1,
                Err(e) => last_error = Some(e),
            }
        }
    }
    if good_writes == 0 {
        return Err(last_error.unwrap_or(PoolError::NoDevice));
    }

    // Finally make the odd labels durable before the next txg begins.
    io::flush_batch(live_devices(pool, dirty_list(pool))).await;

    Ok(())
}

fn dirty_list(pool: &Pool) -> Vec<VdevId> {
    pool.config_dirty.iter().copied().collect()
}

/// Open devices of all live leaves under the given subtree roots,
/// deduplicated when subtrees overlap.
fn live_devices(
    pool: &Pool,
    roots: impl IntoIterator<Item = VdevId>,
) -> Vec<Arc<dyn BlockDevice>> {
    let mut seen = std::collections::BTreeSet::new();
    let mut devs = Vec::new();
    for vd in roots {
        for leaf in pool.tree.leaves_under(vd) {
            let node = pool.tree.node(leaf);
            if node.is_dead() || !seen.insert(leaf) {
                continue;
            }
            if let Ok(dev) = node.device() {
                devs.push(dev);
            }
        }
    }
    devs
}

/// Rebuild and write label slot `l` for every live leaf under `vd` in one
/// batch. Partial success is success; zero writes with no recorded error
/// means there was no device to write to. Log tops are opportunistic:
/// losing their labels never fails the sync, the main pool carries on.
async fn sync_labels(pool: &Pool, vd: VdevId, l: usize, txg: u64) -> Result<(), PoolError> {
    let tree = &pool.tree;

    let mut writes = Vec::new();
    for leaf in tree.leaves_under(vd) {
        let node = tree.node(leaf);
        if node.is_dead() {
            continue;
        }

        let label = label_config_generate(pool, leaf, txg);
        let packed = match label.pack(PHYS_SIZE as usize) {
            Ok(packed) => packed,
            Err(e) => {
                debug!(
                    pool.log,
                    "cannot pack label for vdev {:#x}: {}", node.guid, e
                );
                continue;
            }
        };
        let mut phys = vec![0u8; PHYS_SIZE as usize];
        phys[..packed.len()].copy_from_slice(&packed);

        if let Ok(w) = SlotWrite::new(node, l, PHYS_OFFSET, Bytes::from(phys)) {
            writes.push(w);
        }
    }

    let good_writes = AtomicU64::new(0);
    let last_error = io::write_batch(writes, &good_writes).await;
    let good_writes = good_writes.load(Ordering::SeqCst);

    if last_error.is_some() && good_writes > 0 {
        debug!(
            pool.log,
            "partial label sync of slot {} in txg {}: {} good writes",
            l,
            txg,
            good_writes
        );
    }

    let result = match (last_error, good_writes) {
        (Some(e), 0) => Err(e),
        (None, 0) => Err(PoolError::NoDevice),
        _ => Ok(()),
    };

    if tree.node(vd).is_log {
        return Ok(());
    }
    result
}

/// Write `ub` into its txg-selected ring cell on every slot of every live
/// leaf under `vd`. A write only earns credit when the leaf's top-level
/// has a metaslab array, i.e. is visible to the allocator; the batch as a
/// whole succeeds on any credit at all.
async fn uberblock_sync_tree(
    pool: &Pool,
    ub: &UberBlock,
    vd: VdevId,
    txg: u64,
) -> Result<(), PoolError> {
    debug_assert_eq!(ub.txg, txg);
    let tree = &pool.tree;

    let mut writes = Vec::new();
    for leaf in tree.leaves_under(vd) {
        let node = tree.node(leaf);
        if node.is_dead() {
            continue;
        }

        let n = txg & (uberblock_cell_count(node.ashift) - 1);
        let cell = ub.to_cell(node.ashift)?;
        let credit = tree.node(tree.top_of(leaf)).ms_array != 0;

        for l in 0..LABEL_COUNT {
            if let Ok(mut w) =
                SlotWrite::new(node, l, uberblock_cell_offset(node.ashift, n), cell.clone())
            {
                w.credit = credit;
                writes.push(w);
            }
        }
        debug!(pool.log, "uberblock sync to vdev {:#x} txg {}", node.guid, txg);
    }

    let good_writes = AtomicU64::new(0);
    let last_error = io::write_batch(writes, &good_writes).await;
    let good_writes = good_writes.load(Ordering::SeqCst);

    match (last_error, good_writes) {
        (Some(e), 0) => Err(e),
        (Some(_), _) => {
            debug!(
                pool.log,
                "partial uberblock sync in txg {}: {} good writes", txg, good_writes
            );
            Ok(())
        }
        // No errors and no credit: every leaf was unopenable (or not yet
        // visible to the allocator).
        (None, 0) => Err(PoolError::IoError(format!(
            "no uberblock writes in txg {}",
            txg
        ))),
        (None, _) => Ok(()),
    }
}
