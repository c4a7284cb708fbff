// Copyright 2023 Oxide Computer Company
//! Config trees: generation, label read-back, and the in-use probe.
//!
//! A label's phys region holds a packed [`PropList`] describing the pool
//! and the top-level vdev the leaf belongs to. Generation is pure with
//! respect to the disks; reading tries each of the four slots in turn and
//! never faults the pool on garbage.

use cistern_common::PropList;

use crate::geometry::{LABEL_COUNT, PHYS_OFFSET, PHYS_SIZE};
use crate::io;
use crate::pool::{Pool, PoolState, POOL_VERSION_RAIDZ2};
use crate::vdev::{VdevId, VdevTree, VdevType};

pub const CONFIG_VERSION: &str = "version";
pub const CONFIG_NAME: &str = "name";
pub const CONFIG_STATE: &str = "state";
pub const CONFIG_TXG: &str = "txg";
pub const CONFIG_POOL_GUID: &str = "pool_guid";
pub const CONFIG_TOP_GUID: &str = "top_guid";
pub const CONFIG_GUID: &str = "guid";
pub const CONFIG_VDEV_TREE: &str = "vdev_tree";
pub const CONFIG_TYPE: &str = "type";
pub const CONFIG_ID: &str = "id";
pub const CONFIG_PATH: &str = "path";
pub const CONFIG_DEVID: &str = "devid";
pub const CONFIG_PHYS_PATH: &str = "phys_path";
pub const CONFIG_NPARITY: &str = "nparity";
pub const CONFIG_WHOLE_DISK: &str = "whole_disk";
pub const CONFIG_NOT_PRESENT: &str = "not_present";
pub const CONFIG_IS_SPARE: &str = "is_spare";
pub const CONFIG_METASLAB_ARRAY: &str = "metaslab_array";
pub const CONFIG_METASLAB_SHIFT: &str = "metaslab_shift";
pub const CONFIG_ASHIFT: &str = "ashift";
pub const CONFIG_ASIZE: &str = "asize";
pub const CONFIG_IS_LOG: &str = "is_log";
pub const CONFIG_DTL: &str = "dtl";
pub const CONFIG_CREATE_TXG: &str = "create_txg";
pub const CONFIG_CHILDREN: &str = "children";
pub const CONFIG_OFFLINE: &str = "offline";
pub const CONFIG_FAULTED: &str = "faulted";
pub const CONFIG_DEGRADED: &str = "degraded";
pub const CONFIG_REMOVED: &str = "removed";
pub const CONFIG_UNSPARE: &str = "unspare";
pub const CONFIG_STATS: &str = "stats";

/// Why a label is being probed or initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelReason {
    Create,
    Replace,
    Spare,
    Remove,
}

/// Generate the config tree describing `vd`'s subtree.
pub fn vdev_config_generate(
    pool: &Pool,
    vd: VdevId,
    getstats: bool,
    isspare: bool,
) -> PropList {
    let tree = &pool.tree;
    let node = tree.node(vd);
    let mut nv = PropList::new();

    nv.add_str(CONFIG_TYPE, node.vtype.as_str());
    if !isspare {
        nv.add_u64(CONFIG_ID, node.id);
    }
    nv.add_u64(CONFIG_GUID, node.guid);

    if let Some(path) = &node.path {
        nv.add_str(CONFIG_PATH, path);
    }
    if let Some(devid) = &node.devid {
        nv.add_str(CONFIG_DEVID, devid);
    }
    if let Some(phys_path) = &node.phys_path {
        nv.add_str(CONFIG_PHYS_PATH, phys_path);
    }

    if node.nparity != 0 {
        debug_assert_eq!(node.vtype, VdevType::RaidZ);
        // Double parity must never leak into a pool too old to read it.
        debug_assert!(
            node.nparity == 1
                || (node.nparity == 2 && pool.version >= POOL_VERSION_RAIDZ2)
        );
        nv.add_u64(CONFIG_NPARITY, node.nparity);
    }

    if let Some(whole_disk) = node.whole_disk {
        nv.add_u64(CONFIG_WHOLE_DISK, whole_disk as u64);
    }
    if node.not_present {
        nv.add_u64(CONFIG_NOT_PRESENT, 1);
    }
    if node.is_spare {
        nv.add_u64(CONFIG_IS_SPARE, 1);
    }

    if !isspare && tree.is_top(vd) {
        nv.add_u64(CONFIG_METASLAB_ARRAY, node.ms_array);
        nv.add_u64(CONFIG_METASLAB_SHIFT, node.ms_shift);
        nv.add_u64(CONFIG_ASHIFT, node.ashift);
        nv.add_u64(CONFIG_ASIZE, node.asize);
        nv.add_u64(CONFIG_IS_LOG, node.is_log as u64);
    }

    if node.dtl_object != 0 {
        nv.add_u64(CONFIG_DTL, node.dtl_object);
    }

    if getstats {
        nv.add_list(CONFIG_STATS, node.stats.to_props());
    }

    if !node.is_leaf() {
        let children = tree
            .children(vd)
            .iter()
            .map(|&c| vdev_config_generate(pool, c, getstats, isspare))
            .collect();
        nv.add_list_array(CONFIG_CHILDREN, children);
    } else {
        if node.offline && !node.tmp_offline {
            nv.add_u64(CONFIG_OFFLINE, 1);
        }
        if node.faulted {
            nv.add_u64(CONFIG_FAULTED, 1);
        }
        if node.degraded {
            nv.add_u64(CONFIG_DEGRADED, 1);
        }
        if node.removed {
            nv.add_u64(CONFIG_REMOVED, 1);
        }
        if node.unspare {
            nv.add_u64(CONFIG_UNSPARE, 1);
        }
    }

    nv
}

/// Generate the pool-level tree a label carries: pool identity and state,
/// the txg being written, and the config of the top-level vdev this leaf
/// belongs to.
pub fn label_config_generate(pool: &Pool, vd: VdevId, txg: u64) -> PropList {
    let tree = &pool.tree;
    let mut nv = PropList::new();

    nv.add_u64(CONFIG_VERSION, pool.version);
    nv.add_str(CONFIG_NAME, &pool.name);
    nv.add_u64(CONFIG_STATE, pool.state.as_u64());
    nv.add_u64(CONFIG_TXG, txg);
    nv.add_u64(CONFIG_POOL_GUID, pool.guid);
    if vd != tree.root() {
        nv.add_u64(CONFIG_TOP_GUID, tree.node(tree.top_of(vd)).guid);
        nv.add_u64(CONFIG_GUID, tree.node(vd).guid);
    }
    nv.add_list(
        CONFIG_VDEV_TREE,
        vdev_config_generate(pool, tree.top_of(vd), false, false),
    );
    nv
}

/// Read the config tree from a leaf's labels. Each slot is tried in turn
/// and the first one whose phys region decodes wins; an unreadable or
/// unlabeled leaf is simply `None`.
pub async fn read_config(tree: &VdevTree, vd: VdevId) -> Option<PropList> {
    let node = tree.node(vd);
    if node.is_dead() {
        return None;
    }

    let mut buf = vec![0u8; PHYS_SIZE as usize];
    for l in 0..LABEL_COUNT {
        if io::read_slot(node, l, PHYS_OFFSET, &mut buf).await.is_err() {
            continue;
        }
        if let Ok(nv) = PropList::unpack(&buf) {
            return Some(nv);
        }
    }
    None
}

/// Decide whether a candidate leaf is already in use, by this pool or any
/// other on the host. Returns `(busy, spare_guid)`: `spare_guid` is the
/// on-disk device GUID when the device turns out to be a registered
/// shared spare, so the caller can adopt it.
pub(crate) async fn inuse(
    pool: &Pool,
    vd: VdevId,
    crtxg: u64,
    reason: LabelReason,
) -> (bool, u64) {
    let label = match read_config(&pool.tree, vd).await {
        Some(label) => label,
        None => return (false, 0),
    };

    let vdtxg = label.get_u64(CONFIG_CREATE_TXG).unwrap_or(0);

    let (state, device_guid) = match (
        label.get_u64(CONFIG_STATE),
        label.get_u64(CONFIG_GUID),
    ) {
        (Some(state), Some(guid)) => (PoolState::from_u64(state), guid),
        _ => return (false, 0),
    };

    let is_spare_state = state == Some(PoolState::Spare);

    let (pool_guid, txg) = if !is_spare_state {
        match (
            label.get_u64(CONFIG_POOL_GUID),
            label.get_u64(CONFIG_TXG),
        ) {
            (Some(pool_guid), Some(txg)) => (pool_guid, txg),
            _ => return (false, 0),
        }
    } else {
        (0, 0)
    };

    // A label naming a pool this host has never heard of belongs to
    // nobody, unless the device itself is a registered shared spare.
    if !is_spare_state
        && !pool.registry.guid_exists(pool_guid, device_guid)
        && pool.registry.spare_exists(device_guid).is_none()
    {
        return (false, 0);
    }

    // txg zero means the label was initialized but never synced into an
    // active pool. That is only a conflict when the creation stamp shows
    // it was put there by the very transaction we are running: the user
    // is using one device twice in a single create or add.
    if !is_spare_state && txg == 0 && vdtxg == crtxg {
        return (true, 0);
    }

    // Shared spares get decided by the reason. The pool's own pending
    // list counts too; a spare can be on its way in before the registry
    // hears about it.
    let spare_pool = pool.registry.spare_exists(device_guid);
    if spare_pool.is_some() || pool.has_spare(device_guid) {
        let found = device_guid;
        match reason {
            LabelReason::Create => return (true, found),
            LabelReason::Replace => {
                let active_elsewhere = spare_pool.map_or(false, |p| p != 0);
                return (!pool.has_spare(device_guid) || active_elsewhere, found);
            }
            LabelReason::Spare => return (pool.has_spare(device_guid), found),
            LabelReason::Remove => return (state == Some(PoolState::Active), found),
        }
    }

    (state == Some(PoolState::Active), 0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::MemDevice;
    use crate::geometry::{label_offset, LABEL_SIZE};
    use crate::pool::HostRegistry;
    use crate::vdev::{Vdev, VdevHealth, VdevStats};
    use bytes::Bytes;
    use slog::{o, Drain, Logger};

    fn csl() -> Logger {
        let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
        Logger::root(slog_term::FullFormat::new(plain).build().fuse(), o!())
    }

    const PSIZE: u64 = 16 * LABEL_SIZE;

    fn mem_leaf(guid: u64) -> Vdev {
        let mut vd = Vdev::with_guid(VdevType::Disk, guid);
        vd.psize = PSIZE;
        vd.ashift = 9;
        vd.health = VdevHealth::Healthy;
        vd.path = Some(format!("/dev/dsk/c0t{}d0", guid));
        vd.attach(MemDevice::new(PSIZE as usize));
        vd
    }

    /// A pool with one mirror of two leaves.
    fn mirror_pool() -> (Pool, VdevId, VdevId, VdevId) {
        let mut tree = VdevTree::new(Vdev::with_guid(VdevType::Root, 1));
        let m = tree.add(tree.root(), Vdev::with_guid(VdevType::Mirror, 300));
        let a = tree.add(m, mem_leaf(100));
        let b = tree.add(m, mem_leaf(200));
        let pool = Pool::new("tank", 1000, tree, HostRegistry::new(), csl());
        (pool, m, a, b)
    }

    async fn seed_label(tree: &VdevTree, vd: VdevId, slot: usize, nv: &PropList) {
        let node = tree.node(vd);
        let packed = nv.pack(PHYS_SIZE as usize).unwrap();
        let mut phys = vec![0u8; PHYS_SIZE as usize];
        phys[..packed.len()].copy_from_slice(&packed);
        node.device()
            .unwrap()
            .write_at(label_offset(node.psize, slot, PHYS_OFFSET), Bytes::from(phys))
            .await
            .unwrap();
    }

    fn active_label(pool_guid: u64, device_guid: u64, txg: u64) -> PropList {
        let mut nv = PropList::new();
        nv.add_u64(CONFIG_VERSION, 10);
        nv.add_u64(CONFIG_STATE, PoolState::Active.as_u64());
        nv.add_u64(CONFIG_TXG, txg);
        nv.add_u64(CONFIG_POOL_GUID, pool_guid);
        nv.add_u64(CONFIG_GUID, device_guid);
        nv
    }

    fn spare_label(device_guid: u64) -> PropList {
        let mut nv = PropList::new();
        nv.add_u64(CONFIG_VERSION, 10);
        nv.add_u64(CONFIG_STATE, PoolState::Spare.as_u64());
        nv.add_u64(CONFIG_GUID, device_guid);
        nv
    }

    #[test]
    fn generate_leaf_and_top() {
        let (mut pool, m, a, _b) = mirror_pool();
        pool.tree.node_mut(m).ms_array = 17;
        pool.tree.node_mut(m).ms_shift = 30;
        pool.tree.node_mut(m).asize = PSIZE - 4 * LABEL_SIZE;
        pool.tree.node_mut(a).dtl_object = 55;

        let nv = vdev_config_generate(&pool, m, false, false);
        assert_eq!(nv.get_str(CONFIG_TYPE), Some("mirror"));
        assert_eq!(nv.get_u64(CONFIG_ID), Some(0));
        assert_eq!(nv.get_u64(CONFIG_GUID), Some(300));
        assert_eq!(nv.get_u64(CONFIG_METASLAB_ARRAY), Some(17));
        assert_eq!(nv.get_u64(CONFIG_METASLAB_SHIFT), Some(30));
        assert_eq!(nv.get_u64(CONFIG_IS_LOG), Some(0));
        assert!(!nv.contains(CONFIG_STATS));

        let children = nv.get_list_array(CONFIG_CHILDREN).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].get_u64(CONFIG_GUID), Some(100));
        assert_eq!(children[0].get_u64(CONFIG_DTL), Some(55));
        assert!(children[0].get_str(CONFIG_PATH).is_some());
        // Leaves under a top never carry allocation bookkeeping.
        assert!(!children[0].contains(CONFIG_METASLAB_ARRAY));
        assert!(!children[1].contains(CONFIG_DTL));
    }

    #[test]
    fn generate_leaf_state_flags() {
        let (mut pool, _m, a, b) = mirror_pool();
        {
            let node = pool.tree.node_mut(a);
            node.offline = true;
            node.faulted = true;
            node.degraded = true;
            node.removed = true;
            node.unspare = true;
        }
        // Temporary offline never persists.
        pool.tree.node_mut(b).offline = true;
        pool.tree.node_mut(b).tmp_offline = true;

        let nv = vdev_config_generate(&pool, a, false, false);
        for key in [
            CONFIG_OFFLINE,
            CONFIG_FAULTED,
            CONFIG_DEGRADED,
            CONFIG_REMOVED,
            CONFIG_UNSPARE,
        ] {
            assert_eq!(nv.get_u64(key), Some(1), "missing {}", key);
        }

        let nv = vdev_config_generate(&pool, b, false, false);
        assert!(!nv.contains(CONFIG_OFFLINE));
    }

    #[test]
    fn generate_spare_omits_id() {
        let (mut pool, _m, a, _b) = mirror_pool();
        pool.tree.node_mut(a).is_spare = true;

        let nv = vdev_config_generate(&pool, a, false, true);
        assert!(!nv.contains(CONFIG_ID));
        assert_eq!(nv.get_u64(CONFIG_IS_SPARE), Some(1));

        let nv = vdev_config_generate(&pool, a, false, false);
        assert!(nv.contains(CONFIG_ID));
    }

    #[test]
    fn generate_raidz_parity_and_stats() {
        let mut tree = VdevTree::new(Vdev::with_guid(VdevType::Root, 1));
        let mut rz = Vdev::with_guid(VdevType::RaidZ, 400);
        rz.nparity = 2;
        let rz = tree.add(tree.root(), rz);
        let leaf = tree.add(rz, mem_leaf(100));
        let mut pool = Pool::new("tank", 1000, tree, HostRegistry::new(), csl());
        pool.tree.node_mut(leaf).stats = VdevStats {
            read_ops: 3,
            write_ops: 9,
            ..Default::default()
        };

        let nv = vdev_config_generate(&pool, rz, true, false);
        assert_eq!(nv.get_u64(CONFIG_NPARITY), Some(2));

        let children = nv.get_list_array(CONFIG_CHILDREN).unwrap();
        let stats = children[0].get_list(CONFIG_STATS).unwrap();
        assert_eq!(stats.get_u64("write_ops"), Some(9));
    }

    #[test]
    fn label_config_wraps_pool_identity() {
        let (mut pool, m, a, _b) = mirror_pool();
        pool.tree.node_mut(m).ms_array = 17;

        let nv = label_config_generate(&pool, a, 7);
        assert_eq!(nv.get_u64(CONFIG_VERSION), Some(pool.version));
        assert_eq!(nv.get_str(CONFIG_NAME), Some("tank"));
        assert_eq!(nv.get_u64(CONFIG_STATE), Some(PoolState::Active.as_u64()));
        assert_eq!(nv.get_u64(CONFIG_TXG), Some(7));
        assert_eq!(nv.get_u64(CONFIG_POOL_GUID), Some(1000));
        assert_eq!(nv.get_u64(CONFIG_TOP_GUID), Some(300));
        assert_eq!(nv.get_u64(CONFIG_GUID), Some(100));

        // The embedded tree describes the whole top-level, not the leaf.
        let tree = nv.get_list(CONFIG_VDEV_TREE).unwrap();
        assert_eq!(tree.get_u64(CONFIG_GUID), Some(300));
        assert_eq!(tree.get_list_array(CONFIG_CHILDREN).unwrap().len(), 2);
        assert_eq!(tree.get_u64(CONFIG_METASLAB_ARRAY), Some(17));
    }

    #[tokio::test]
    async fn read_config_first_good_slot_wins() {
        let (pool, _m, a, _b) = mirror_pool();

        assert_eq!(read_config(&pool.tree, a).await, None);

        let nv = active_label(1000, 100, 5);
        seed_label(&pool.tree, a, 2, &nv).await;

        // Slot 0 holds garbage; the reader quietly falls through to 2.
        let node = pool.tree.node(a);
        node.device()
            .unwrap()
            .write_at(
                label_offset(node.psize, 0, PHYS_OFFSET),
                Bytes::from_static(b"\xff\xffnot a label"),
            )
            .await
            .unwrap();

        assert_eq!(read_config(&pool.tree, a).await, Some(nv));
    }

    #[tokio::test]
    async fn read_config_dead_leaf() {
        let (mut pool, _m, a, _b) = mirror_pool();
        seed_label(&pool.tree, a, 0, &active_label(1000, 100, 5)).await;
        pool.tree.node_mut(a).health = VdevHealth::Offline;
        assert_eq!(read_config(&pool.tree, a).await, None);
    }

    #[tokio::test]
    async fn inuse_blank_and_partial_labels() {
        let (pool, _m, a, b) = mirror_pool();
        assert_eq!(inuse(&pool, a, 1, LabelReason::Create).await, (false, 0));

        // State but no guid.
        let mut nv = PropList::new();
        nv.add_u64(CONFIG_STATE, PoolState::Active.as_u64());
        seed_label(&pool.tree, a, 0, &nv).await;
        assert_eq!(inuse(&pool, a, 1, LabelReason::Create).await, (false, 0));

        // Active state but no pool_guid/txg.
        let mut nv = PropList::new();
        nv.add_u64(CONFIG_STATE, PoolState::Active.as_u64());
        nv.add_u64(CONFIG_GUID, 200);
        seed_label(&pool.tree, b, 0, &nv).await;
        assert_eq!(inuse(&pool, b, 1, LabelReason::Create).await, (false, 0));
    }

    // S3: a label naming a pool unknown to this host is stale.
    #[tokio::test]
    async fn inuse_stale_foreign_label() {
        let (pool, _m, a, _b) = mirror_pool();
        seed_label(&pool.tree, a, 0, &active_label(0xdead, 100, 5)).await;
        assert_eq!(inuse(&pool, a, 1, LabelReason::Create).await, (false, 0));
    }

    #[tokio::test]
    async fn inuse_active_member_of_known_pool() {
        let (pool, _m, a, _b) = mirror_pool();
        pool.registry.register_pool(2000, &[100]);
        seed_label(&pool.tree, a, 0, &active_label(2000, 100, 5)).await;

        for reason in [
            LabelReason::Create,
            LabelReason::Replace,
            LabelReason::Spare,
            LabelReason::Remove,
        ] {
            assert_eq!(inuse(&pool, a, 1, reason).await, (true, 0), "{:?}", reason);
        }
    }

    #[tokio::test]
    async fn inuse_exported_member_is_free() {
        let (pool, _m, a, _b) = mirror_pool();
        pool.registry.register_pool(2000, &[100]);
        let mut nv = active_label(2000, 100, 5);
        nv.add_u64(CONFIG_STATE, PoolState::Exported.as_u64());
        seed_label(&pool.tree, a, 0, &nv).await;
        assert_eq!(inuse(&pool, a, 1, LabelReason::Create).await, (false, 0));
    }

    // S2's core: a zero-txg label whose create_txg matches ours means the
    // same device shows up twice in one transaction.
    #[tokio::test]
    async fn inuse_duplicate_within_transaction() {
        let (pool, _m, a, _b) = mirror_pool();
        pool.registry.register_pool(1000, &[100]);

        let mut nv = active_label(1000, 100, 0);
        nv.add_u64(CONFIG_CREATE_TXG, 4);
        seed_label(&pool.tree, a, 0, &nv).await;

        assert_eq!(inuse(&pool, a, 4, LabelReason::Create).await, (true, 0));
        // A different transaction is not a conflict, but the device is
        // still an active member of a known pool.
        assert_eq!(inuse(&pool, a, 5, LabelReason::Create).await, (true, 0));
    }

    #[tokio::test]
    async fn inuse_spare_truth_table() {
        let (pool, _m, a, _b) = mirror_pool();
        pool.registry.spare_add(777);
        seed_label(&pool.tree, a, 0, &spare_label(777)).await;

        // CREATE may never swallow a shared spare.
        assert_eq!(inuse(&pool, a, 1, LabelReason::Create).await, (true, 777));
        // REPLACE: not our spare, so busy.
        assert_eq!(inuse(&pool, a, 1, LabelReason::Replace).await, (true, 777));
        // SPARE: not in this pool yet, so free to add.
        assert_eq!(inuse(&pool, a, 1, LabelReason::Spare).await, (false, 777));
        // REMOVE of a spare is tearing it down: never busy.
        assert_eq!(inuse(&pool, a, 1, LabelReason::Remove).await, (false, 777));
    }

    #[tokio::test]
    async fn inuse_spare_owned_by_this_pool() {
        let (mut pool, _m, a, _b) = mirror_pool();
        pool.registry.spare_add(777);
        pool.spares.push(777);
        seed_label(&pool.tree, a, 0, &spare_label(777)).await;

        // REPLACE with our own idle spare is the one allowed takeover.
        assert_eq!(inuse(&pool, a, 1, LabelReason::Replace).await, (false, 777));
        // Unless some pool is actively using it.
        pool.registry.spare_activate(777, 555);
        assert_eq!(inuse(&pool, a, 1, LabelReason::Replace).await, (true, 777));

        // SPARE: already in this pool, adding it again is a conflict.
        assert_eq!(inuse(&pool, a, 1, LabelReason::Spare).await, (true, 777));
    }

    #[tokio::test]
    async fn inuse_pending_spare_without_registry() {
        let (mut pool, _m, a, _b) = mirror_pool();
        pool.spares.push(777);
        seed_label(&pool.tree, a, 0, &spare_label(777)).await;

        assert_eq!(inuse(&pool, a, 1, LabelReason::Create).await, (true, 777));
        assert_eq!(inuse(&pool, a, 1, LabelReason::Replace).await, (false, 777));
    }
}
