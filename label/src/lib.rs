// Copyright 2023 Oxide Computer Company

//! Vdev labels and uberblocks: the crash-consistency core of a cistern
//! storage pool.
//!
//! Each physical leaf device carries four copies of a label identifying
//! the device, its pool, and the topology of the top-level vdev it
//! belongs to, plus a ring of uberblocks, the pool's root records. At any
//! instant some combination of labels and uberblocks on disk forms a
//! recoverable snapshot of the pool; this crate is responsible for
//! keeping that true across arbitrary power loss.
//!
//! The trick is in the write order. With four label slots split into an
//! even and an odd pair, a configuration change for transaction group `t`
//! commits as: flush data, write even labels, flush, write uberblock `t`,
//! flush, write odd labels, flush. Whichever write the machine dies on,
//! import can elect the best uberblock on disk and find, on every leaf,
//! at least one label pair that is no newer than that root: a label whose
//! txg is ahead of the elected uberblock is stale by definition and is
//! ignored.
//!
//! The pieces:
//!
//! * [`geometry`] computes slot offsets and owns the on-disk layout
//!   constants;
//! * [`vdev`] models the in-core device tree the pool hands us;
//! * [`device`] is the seam to the I/O pipeline, with file and in-memory
//!   backends;
//! * [`config`] generates and reads back the packed config trees and
//!   decides whether a candidate device already belongs to somebody;
//! * [`init`] stamps fresh labels onto new or replaced leaves;
//! * [`uberblock`] defines the root record and elects the best one at
//!   import;
//! * [`sync`] runs the phased commit described above.

pub mod config;
pub mod device;
pub mod geometry;
pub mod init;
mod io;
pub mod pool;
pub mod sync;
pub mod uberblock;
pub mod vdev;

pub use cistern_common::{PoolError, PropList};

pub use config::{read_config, LabelReason};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use geometry::label_offset;
pub use init::label_init;
pub use pool::{HostRegistry, Pool, PoolState};
pub use sync::config_sync;
pub use uberblock::{uberblock_load, BlockPtr, UberBlock};
pub use vdev::{Vdev, VdevHealth, VdevId, VdevTree, VdevType};
