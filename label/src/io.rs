// Copyright 2023 Oxide Computer Company
//! Label slot I/O primitives.
//!
//! All label traffic goes through here: a read or write targets one region
//! inside one of the four slots of one leaf, and writes are submitted in
//! batches that run concurrently and drain together. Label I/O is never
//! allowed to fault the pool on its own; a failed write only costs credit
//! in the batch's shared good-writes counter, and the caller decides what
//! zero credit means.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;

use crate::device::BlockDevice;
use crate::geometry::label_offset;
use crate::vdev::Vdev;
use cistern_common::PoolError;

/// Read `data.len()` bytes at `within` inside label slot `slot` of a leaf.
pub(crate) async fn read_slot(
    vd: &Vdev,
    slot: usize,
    within: u64,
    data: &mut [u8],
) -> Result<(), PoolError> {
    debug_assert!(vd.is_leaf());
    let dev = vd.device()?;
    dev.read_at(label_offset(vd.psize, slot, within), data).await
}

/// One write in a batch, resolved to an absolute device offset at build
/// time so the batch itself borrows nothing from the tree.
pub(crate) struct SlotWrite {
    dev: Arc<dyn BlockDevice>,
    offset: u64,
    data: Bytes,
    /// Whether success earns good-writes credit.
    pub credit: bool,
}

impl SlotWrite {
    pub fn new(
        vd: &Vdev,
        slot: usize,
        within: u64,
        data: Bytes,
    ) -> Result<SlotWrite, PoolError> {
        debug_assert!(vd.is_leaf());
        Ok(SlotWrite {
            dev: vd.device()?,
            offset: label_offset(vd.psize, slot, within),
            data,
            credit: true,
        })
    }
}

/// Submit every write concurrently and wait for the batch to drain.
/// Successful credited writes bump `good_writes`; the last failure, if
/// any, is handed back for the caller's bookkeeping.
pub(crate) async fn write_batch(
    writes: Vec<SlotWrite>,
    good_writes: &AtomicU64,
) -> Option<PoolError> {
    let results = join_all(writes.into_iter().map(|w| async move {
        let credit = w.credit;
        (w.dev.write_at(w.offset, w.data).await, credit)
    }))
    .await;

    let mut last_error = None;
    for (result, credit) in results {
        match result {
            Ok(()) => {
                if credit {
                    good_writes.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(e) => last_error = Some(e),
        }
    }
    last_error
}

/// Flush the write caches of a set of devices and wait. Flush failures
/// are not actionable here; the following writes find out the hard way.
pub(crate) async fn flush_batch(devs: Vec<Arc<dyn BlockDevice>>) {
    join_all(devs.into_iter().map(|d| async move {
        let _ = d.flush_cache().await;
    }))
    .await;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::{FaultInjector, MemDevice};
    use crate::geometry::{LABEL_SIZE, PHYS_OFFSET};
    use crate::vdev::{VdevHealth, VdevType};

    fn mem_leaf(psize: u64) -> (Vdev, Arc<MemDevice>) {
        let dev = MemDevice::new(psize as usize);
        let mut vd = Vdev::with_guid(VdevType::Disk, 100);
        vd.psize = psize;
        vd.ashift = 9;
        vd.health = VdevHealth::Healthy;
        vd.attach(dev.clone());
        (vd, dev)
    }

    #[tokio::test]
    async fn slot_writes_land_at_slot_offsets() {
        let psize = 8 * LABEL_SIZE;
        let (vd, dev) = mem_leaf(psize);

        let good = AtomicU64::new(0);
        let writes = vec![
            SlotWrite::new(&vd, 0, PHYS_OFFSET, Bytes::from_static(b"even")).unwrap(),
            SlotWrite::new(&vd, 3, PHYS_OFFSET, Bytes::from_static(b"odd!")).unwrap(),
        ];
        assert!(write_batch(writes, &good).await.is_none());
        assert_eq!(good.load(Ordering::SeqCst), 2);

        let image = dev.snapshot().await;
        let lo = PHYS_OFFSET as usize;
        let hi = (psize - LABEL_SIZE + PHYS_OFFSET) as usize;
        assert_eq!(&image[lo..lo + 4], b"even");
        assert_eq!(&image[hi..hi + 4], b"odd!");
    }

    #[tokio::test]
    async fn read_slot_reads_back() {
        let psize = 8 * LABEL_SIZE;
        let (vd, _dev) = mem_leaf(psize);

        let good = AtomicU64::new(0);
        let w =
            SlotWrite::new(&vd, 2, 0, Bytes::from_static(b"marker")).unwrap();
        assert!(write_batch(vec![w], &good).await.is_none());

        let mut buf = [0u8; 6];
        read_slot(&vd, 2, 0, &mut buf).await.unwrap();
        assert_eq!(&buf, b"marker");
    }

    #[tokio::test]
    async fn batch_counts_credit_and_last_error() {
        let psize = 8 * LABEL_SIZE;
        let faults = FaultInjector::new();
        let dev = MemDevice::with_faults(psize as usize, Arc::clone(&faults));
        let mut vd = Vdev::with_guid(VdevType::Disk, 100);
        vd.psize = psize;
        vd.health = VdevHealth::Healthy;
        vd.attach(dev);

        faults.fail_after_writes(1);
        let good = AtomicU64::new(0);
        let writes = vec![
            SlotWrite::new(&vd, 0, 0, Bytes::from_static(b"a")).unwrap(),
            SlotWrite::new(&vd, 1, 0, Bytes::from_static(b"b")).unwrap(),
        ];
        let err = write_batch(writes, &good).await;
        assert!(err.is_some());
        assert_eq!(good.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uncredited_success_earns_nothing() {
        let psize = 8 * LABEL_SIZE;
        let (vd, _dev) = mem_leaf(psize);

        let good = AtomicU64::new(0);
        let mut w = SlotWrite::new(&vd, 0, 0, Bytes::from_static(b"a")).unwrap();
        w.credit = false;
        assert!(write_batch(vec![w], &good).await.is_none());
        assert_eq!(good.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_device_is_an_error() {
        let mut vd = Vdev::with_guid(VdevType::Disk, 100);
        vd.psize = 4 * LABEL_SIZE;
        let mut buf = [0u8; 1];
        assert!(read_slot(&vd, 0, 0, &mut buf).await.is_err());
        assert!(SlotWrite::new(&vd, 0, 0, Bytes::new()).is_err());
    }
}
