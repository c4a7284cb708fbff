// Copyright 2023 Oxide Computer Company
//! Label initialization for new and replaced leaves.
//!
//! Every leaf under the target vdev gets a full set of four labels, a
//! boot header, and a ring of zero-txg uberblock cells. Leaves are
//! processed strictly one at a time so that using the same physical
//! device twice in a single transaction trips over its own fresh label.

use std::sync::atomic::AtomicU64;

use bytes::Bytes;

use crate::config::{self, inuse, LabelReason};
use crate::geometry::{
    uberblock_cell_count, uberblock_cell_offset, BootHeader, BOOT_HEADER_OFFSET,
    LABEL_COUNT, PHYS_OFFSET, PHYS_SIZE,
};
use crate::io::{self, SlotWrite};
use crate::pool::{Pool, PoolState};
use crate::vdev::VdevId;
use cistern_common::{pool_bail, PoolError, PropList};

/// Stamp initial labels on every leaf under `vd`. Fails eagerly on the
/// first leaf that is dead or already in use; a failed init leaves no
/// reachable trace, since a partially written label either does not
/// decode or carries a zero txg that expires with this transaction.
pub async fn label_init(
    pool: &mut Pool,
    vd: VdevId,
    crtxg: u64,
    reason: LabelReason,
) -> Result<(), PoolError> {
    for leaf in pool.tree.leaves_under(vd) {
        init_leaf(pool, leaf, crtxg, reason).await?;
    }
    Ok(())
}

async fn init_leaf(
    pool: &mut Pool,
    vd: VdevId,
    crtxg: u64,
    reason: LabelReason,
) -> Result<(), PoolError> {
    if pool.tree.node(vd).is_dead() {
        pool_bail!(
            IoError,
            "cannot label dead vdev {:#x}",
            pool.tree.node(vd).guid
        );
    }

    let spare_guid = if reason != LabelReason::Remove {
        let (busy, spare_guid) = inuse(pool, vd, crtxg, reason).await;
        if busy {
            return Err(PoolError::DeviceBusy);
        }
        spare_guid
    } else {
        0
    };

    // A spare being added or taken over already has its shared GUID on
    // disk; ours was randomly minted and must give way, with every
    // ancestor's guid_sum adjusted on the way up.
    if spare_guid != 0 {
        pool.tree.adopt_guid(vd, spare_guid);

        if reason == LabelReason::Spare {
            // Already labeled as a shared spare; nothing to write.
            return Ok(());
        }
        debug_assert_eq!(reason, LabelReason::Replace);
    }

    let node = pool.tree.node(vd);

    // Shared spares carry a minimal marker label. Everything else gets
    // the full pool config at txg zero, stamped with the creating
    // transaction so duplicate use within it is detectable; the labels
    // are rewritten with a real txg by the first config sync.
    let label = if reason == LabelReason::Spare
        || (reason == LabelReason::Remove && node.is_spare)
    {
        let mut nv = PropList::new();
        nv.add_u64(config::CONFIG_VERSION, pool.version);
        nv.add_u64(config::CONFIG_STATE, PoolState::Spare.as_u64());
        nv.add_u64(config::CONFIG_GUID, node.guid);
        nv
    } else {
        let mut nv = config::label_config_generate(pool, vd, 0);
        nv.add_u64(config::CONFIG_CREATE_TXG, crtxg);
        nv
    };

    let packed = label.pack(PHYS_SIZE as usize)?;
    let mut phys = vec![0u8; PHYS_SIZE as usize];
    phys[..packed.len()].copy_from_slice(&packed);
    let phys = Bytes::from(phys);

    let boot = BootHeader::default().to_region()?;

    let mut ub = pool.uberblock;
    ub.txg = 0;
    let ub_cell = ub.to_cell(node.ashift)?;

    // One batch: phys region, boot header, and the entire uberblock ring
    // for all four slots, in parallel.
    let mut writes = Vec::new();
    for l in 0..LABEL_COUNT {
        writes.push(SlotWrite::new(node, l, PHYS_OFFSET, phys.clone())?);
        writes.push(SlotWrite::new(node, l, BOOT_HEADER_OFFSET, boot.clone())?);
        for n in 0..uberblock_cell_count(node.ashift) {
            writes.push(SlotWrite::new(
                node,
                l,
                uberblock_cell_offset(node.ashift, n),
                ub_cell.clone(),
            )?);
        }
    }

    let good_writes = AtomicU64::new(0);
    if let Some(e) = io::write_batch(writes, &good_writes).await {
        return Err(e);
    }

    // If the leaf was not already known as a spare, it becomes one when
    // we just labeled it as such, or when its (adopted) GUID is shared
    // spare property elsewhere on the host.
    let node = pool.tree.node(vd);
    if !node.is_spare
        && (reason == LabelReason::Spare
            || pool.registry.spare_exists(node.guid).is_some())
    {
        pool.spare_add(vd);
    }

    Ok(())
}
