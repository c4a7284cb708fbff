// Copyright 2023 Oxide Computer Company
//! On-disk geometry of the vdev label.
//!
//! Every leaf device carries four copies of its label: two at the front of
//! the device and two at the back, so the pool identity survives both a
//! clobbered partition table at offset zero and truncation artifacts at the
//! device end. A label slot is a fixed 256 KiB region laid out as:
//!
//! ```text
//! +----------------+-------------+-------------+--------------------+
//! | legacy padding | boot header | phys region | uberblock ring     |
//! |          8 KiB |       8 KiB |     112 KiB |            128 KiB |
//! +----------------+-------------+-------------+--------------------+
//! ```
//!
//! The phys region holds the packed configuration tree; the ring holds a
//! rotating set of uberblock cells addressed by transaction group number.
//! Slot offsets are pure functions of the device size, which must be a
//! whole multiple of the label size.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cistern_common::PoolError;

/// Byte size of one label slot.
pub const LABEL_SIZE: u64 = 256 * 1024;

/// Label slots per leaf device.
pub const LABEL_COUNT: usize = 4;

/// Legacy partition-table padding at the head of each slot.
pub const LABEL_PAD_SIZE: u64 = 8 * 1024;

/// In-slot offset and size of the boot header region.
pub const BOOT_HEADER_OFFSET: u64 = LABEL_PAD_SIZE;
pub const BOOT_HEADER_SIZE: u64 = 8 * 1024;

/// In-slot offset and size of the phys region (the packed config tree).
pub const PHYS_OFFSET: u64 = BOOT_HEADER_OFFSET + BOOT_HEADER_SIZE;
pub const PHYS_SIZE: u64 = 112 * 1024;

/// In-slot offset and size of the uberblock ring.
pub const UBERBLOCK_RING_OFFSET: u64 = PHYS_OFFSET + PHYS_SIZE;
pub const UBERBLOCK_RING_SIZE: u64 = 128 * 1024;

/// Minimum shift of one uberblock cell (1 KiB).
pub const UBERBLOCK_SHIFT: u32 = 10;

pub const BOOT_MAGIC: u64 = 0x2f5b007b10c;
pub const BOOT_VERSION: u64 = 1;

/// The dedicated boot area sits immediately after the two leading labels.
pub const BOOT_AREA_OFFSET: u64 = 2 * LABEL_SIZE;
pub const BOOT_AREA_SIZE: u64 = 7 << 19;

/// Physical byte offset of `within` inside label slot `slot` on a device of
/// `psize` bytes. Slots 0 and 1 sit at the device start, slots 2 and 3 at
/// the device end.
pub fn label_offset(psize: u64, slot: usize, within: u64) -> u64 {
    debug_assert!(slot < LABEL_COUNT);
    debug_assert!(within < LABEL_SIZE);
    debug_assert_eq!(psize % LABEL_SIZE, 0);

    within
        + slot as u64 * LABEL_SIZE
        + if slot < LABEL_COUNT / 2 {
            0
        } else {
            psize - LABEL_COUNT as u64 * LABEL_SIZE
        }
}

/// Shift of one uberblock cell on a leaf with the given alignment shift.
/// Cells are never smaller than the leaf's physical block.
pub fn uberblock_cell_shift(ashift: u64) -> u32 {
    std::cmp::max(UBERBLOCK_SHIFT, ashift as u32)
}

/// Number of uberblock cells in the ring; always a power of two, so the
/// active cell for txg `t` is `t & (count - 1)`.
pub fn uberblock_cell_count(ashift: u64) -> u64 {
    UBERBLOCK_RING_SIZE >> uberblock_cell_shift(ashift)
}

/// In-slot offset of uberblock cell `n`.
pub fn uberblock_cell_offset(ashift: u64, n: u64) -> u64 {
    debug_assert!(n < uberblock_cell_count(ashift));
    UBERBLOCK_RING_OFFSET + (n << uberblock_cell_shift(ashift))
}

/// Boot header, stamped into every label when a leaf is first initialized.
/// It locates the dedicated boot area on the device; nothing in the pool
/// reads it back, but boot loaders do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootHeader {
    pub magic: u64,
    pub version: u64,
    pub offset: u64,
    pub size: u64,
}

impl Default for BootHeader {
    fn default() -> Self {
        BootHeader {
            magic: BOOT_MAGIC,
            version: BOOT_VERSION,
            offset: BOOT_AREA_OFFSET,
            size: BOOT_AREA_SIZE,
        }
    }
}

impl BootHeader {
    /// Encode into a zero-padded image of the boot header region.
    pub fn to_region(&self) -> Result<Bytes, PoolError> {
        let mut buf = vec![0u8; BOOT_HEADER_SIZE as usize];
        bincode::serialize_into(&mut buf[..], self)
            .map_err(|e| PoolError::InvalidArgument(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    pub fn from_region(buf: &[u8]) -> Result<Self, PoolError> {
        let hdr: BootHeader = bincode::deserialize(buf)
            .map_err(|e| PoolError::InvalidArgument(e.to_string()))?;
        if hdr.magic != BOOT_MAGIC {
            return Err(PoolError::InvalidArgument(format!(
                "bad boot header magic {:#x}",
                hdr.magic
            )));
        }
        Ok(hdr)
    }
}
