// Copyright 2023 Oxide Computer Company
//! In-core model of the virtual device tree.
//!
//! The pool owns a single rooted tree: interior nodes aggregate (mirror,
//! raidz, ...) and leaves are physical devices, the only level at which
//! labels and uberblocks live. Nodes are arena-allocated inside
//! [`VdevTree`]; parent and top pointers are plain indices, so they are
//! lookup-only back-references and never own anything.
//!
//! Every node maintains `guid_sum`, the wrapping sum of all leaf GUIDs in
//! its subtree. Importers compare the sum recorded in the uberblock against
//! the devices they actually found to detect missing vdevs.

use std::sync::Arc;

use rand::Rng;

use crate::device::BlockDevice;
use cistern_common::{PoolError, PropList};

/// Arena index of a node in a [`VdevTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VdevId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdevType {
    Root,
    Mirror,
    RaidZ,
    Disk,
    File,
    Missing,
    Spare,
}

impl VdevType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VdevType::Root => "root",
            VdevType::Mirror => "mirror",
            VdevType::RaidZ => "raidz",
            VdevType::Disk => "disk",
            VdevType::File => "file",
            VdevType::Missing => "missing",
            VdevType::Spare => "spare",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            VdevType::Disk | VdevType::File | VdevType::Missing | VdevType::Spare
        )
    }
}

/// Runtime health, ordered sickest first. Anything below `Degraded` is
/// dead: it can neither be read nor written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum VdevHealth {
    #[default]
    Closed,
    Offline,
    Removed,
    Faulted,
    Degraded,
    Healthy,
}

impl VdevHealth {
    pub fn is_dead(&self) -> bool {
        *self < VdevHealth::Degraded
    }
}

/// Fixed-shape runtime statistics attached to a config when the caller
/// asks for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VdevStats {
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub checksum_errors: u64,
    pub alloc: u64,
    pub space: u64,
}

impl VdevStats {
    pub fn to_props(&self) -> PropList {
        let mut nv = PropList::new();
        nv.add_u64("read_ops", self.read_ops);
        nv.add_u64("write_ops", self.write_ops);
        nv.add_u64("read_bytes", self.read_bytes);
        nv.add_u64("write_bytes", self.write_bytes);
        nv.add_u64("read_errors", self.read_errors);
        nv.add_u64("write_errors", self.write_errors);
        nv.add_u64("checksum_errors", self.checksum_errors);
        nv.add_u64("alloc", self.alloc);
        nv.add_u64("space", self.space);
        nv
    }
}

/// Mint a fresh nonzero vdev GUID.
pub fn alloc_guid() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let guid: u64 = rng.gen();
        if guid != 0 {
            return guid;
        }
    }
}

#[derive(Debug)]
pub struct Vdev {
    pub vtype: VdevType,
    /// Position among siblings; recorded in the config tree.
    pub id: u64,
    pub guid: u64,
    /// Wrapping sum of all leaf GUIDs in this subtree.
    pub guid_sum: u64,

    parent: Option<VdevId>,
    top: Option<VdevId>,
    children: Vec<VdevId>,

    pub health: VdevHealth,
    pub path: Option<String>,
    pub devid: Option<String>,
    pub phys_path: Option<String>,
    pub whole_disk: Option<bool>,
    pub not_present: bool,
    pub is_spare: bool,
    pub offline: bool,
    /// Offline only for this import; not persisted to the label.
    pub tmp_offline: bool,
    pub faulted: bool,
    pub degraded: bool,
    pub removed: bool,
    pub unspare: bool,
    pub nparity: u64,
    /// Object id of the dirty-time log, zero if none.
    pub dtl_object: u64,
    pub stats: VdevStats,

    // Leaf only.
    pub psize: u64,
    pub ashift: u64,
    pub device: Option<Arc<dyn BlockDevice>>,

    // Top-level only.
    pub ms_array: u64,
    pub ms_shift: u64,
    pub asize: u64,
    pub is_log: bool,
}

impl Vdev {
    /// A fresh node with a randomly minted GUID.
    pub fn new(vtype: VdevType) -> Self {
        Vdev::with_guid(vtype, alloc_guid())
    }

    pub fn with_guid(vtype: VdevType, guid: u64) -> Self {
        Vdev {
            vtype,
            id: 0,
            guid,
            guid_sum: 0,
            parent: None,
            top: None,
            children: Vec::new(),
            health: VdevHealth::default(),
            path: None,
            devid: None,
            phys_path: None,
            whole_disk: None,
            not_present: false,
            is_spare: false,
            offline: false,
            tmp_offline: false,
            faulted: false,
            degraded: false,
            removed: false,
            unspare: false,
            nparity: 0,
            dtl_object: 0,
            stats: VdevStats::default(),
            psize: 0,
            ashift: 0,
            device: None,
            ms_array: 0,
            ms_shift: 0,
            asize: 0,
            is_log: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.vtype.is_leaf()
    }

    pub fn is_dead(&self) -> bool {
        self.health.is_dead()
    }

    /// Hand this leaf its open device.
    pub fn attach(&mut self, device: Arc<dyn BlockDevice>) {
        debug_assert!(self.is_leaf());
        self.device = Some(device);
    }

    pub(crate) fn device(&self) -> Result<Arc<dyn BlockDevice>, PoolError> {
        match &self.device {
            Some(dev) => Ok(Arc::clone(dev)),
            None => Err(PoolError::IoError(format!(
                "vdev guid {:#x} has no open device",
                self.guid
            ))),
        }
    }
}

#[derive(Debug)]
pub struct VdevTree {
    nodes: Vec<Vdev>,
    root: VdevId,
}

impl VdevTree {
    pub fn new(mut root: Vdev) -> Self {
        debug_assert_eq!(root.vtype, VdevType::Root);
        root.guid_sum = 0;
        VdevTree {
            nodes: vec![root],
            root: VdevId(0),
        }
    }

    pub fn root(&self) -> VdevId {
        self.root
    }

    /// Attach `node` under `parent`. Trees are built top down; attaching a
    /// leaf credits its GUID to every ancestor's `guid_sum`.
    pub fn add(&mut self, parent: VdevId, mut node: Vdev) -> VdevId {
        let nid = VdevId(self.nodes.len());
        node.id = self.nodes[parent.0].children.len() as u64;
        node.parent = Some(parent);
        node.top = if parent == self.root {
            Some(nid)
        } else {
            self.nodes[parent.0].top
        };
        node.guid_sum = if node.is_leaf() { node.guid } else { 0 };

        let delta = node.guid_sum;
        self.nodes.push(node);
        self.nodes[parent.0].children.push(nid);

        if delta != 0 {
            let mut up = Some(parent);
            while let Some(pid) = up {
                let p = &mut self.nodes[pid.0];
                p.guid_sum = p.guid_sum.wrapping_add(delta);
                up = p.parent;
            }
        }
        nid
    }

    pub fn node(&self, id: VdevId) -> &Vdev {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: VdevId) -> &mut Vdev {
        &mut self.nodes[id.0]
    }

    pub fn children(&self, id: VdevId) -> &[VdevId] {
        &self.nodes[id.0].children
    }

    /// The top-level vdev of `id`'s subtree; the root maps to itself.
    pub fn top_of(&self, id: VdevId) -> VdevId {
        self.nodes[id.0].top.unwrap_or(id)
    }

    /// Is `id` a top-level vdev (a direct child of the root)?
    pub fn is_top(&self, id: VdevId) -> bool {
        self.nodes[id.0].parent == Some(self.root)
    }

    /// All leaves under `id`, in post-order child order.
    pub fn leaves_under(&self, id: VdevId) -> Vec<VdevId> {
        let mut out = Vec::new();
        self.walk_leaves(id, &mut out);
        out
    }

    fn walk_leaves(&self, id: VdevId, out: &mut Vec<VdevId>) {
        let node = &self.nodes[id.0];
        for &c in &node.children {
            self.walk_leaves(c, out);
        }
        if node.is_leaf() {
            out.push(id);
        }
    }

    pub fn root_guid_sum(&self) -> u64 {
        self.nodes[self.root.0].guid_sum
    }

    /// Rewrite a leaf's GUID in place (spare adoption), fixing up the
    /// `guid_sum` of every ancestor with a single upward walk.
    pub fn adopt_guid(&mut self, leaf: VdevId, new_guid: u64) {
        debug_assert!(self.nodes[leaf.0].is_leaf());
        let old_guid = self.nodes[leaf.0].guid;

        let mut up = self.nodes[leaf.0].parent;
        while let Some(pid) = up {
            let p = &mut self.nodes[pid.0];
            p.guid_sum = p.guid_sum.wrapping_sub(old_guid).wrapping_add(new_guid);
            up = p.parent;
        }

        let node = &mut self.nodes[leaf.0];
        node.guid = new_guid;
        node.guid_sum = new_guid;
    }
}
