// Copyright 2023 Oxide Computer Company
//! The block device seam between the label subsystem and the I/O pipeline.

use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use cistern_common::PoolError;

/// A leaf's physical device as the label subsystem sees it: flat bytes
/// with a write cache that must be flushed explicitly. Checksumming,
/// priorities and retry policy live below this seam in the I/O pipeline,
/// and like a real disk, nothing is ordered between flushes.
#[async_trait]
pub trait BlockDevice: Send + Sync + Debug {
    async fn total_size(&self) -> Result<u64, PoolError>;

    async fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<(), PoolError>;

    async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), PoolError>;

    /// Write-cache flush barrier.
    async fn flush_cache(&self) -> Result<(), PoolError>;
}

/// Shared write-fault clock for crash simulation: the first `n` writes
/// across every device wearing this injector succeed, all later ones
/// fail. Reads and flushes are unaffected.
#[derive(Debug)]
pub struct FaultInjector {
    writes_left: AtomicI64,
}

impl FaultInjector {
    pub fn new() -> Arc<Self> {
        Arc::new(FaultInjector {
            writes_left: AtomicI64::new(i64::MAX),
        })
    }

    pub fn fail_after_writes(&self, n: u64) {
        self.writes_left.store(n as i64, Ordering::SeqCst);
    }

    fn take_write(&self) -> bool {
        self.writes_left.fetch_sub(1, Ordering::SeqCst) > 0
    }
}

/// RAM-backed device.
#[derive(Debug)]
pub struct MemDevice {
    bytes: Mutex<Vec<u8>>,
    writes: AtomicU64,
    faults: Option<Arc<FaultInjector>>,
}

impl MemDevice {
    pub fn new(total_size: usize) -> Arc<Self> {
        Arc::new(MemDevice {
            bytes: Mutex::new(vec![0; total_size]),
            writes: AtomicU64::new(0),
            faults: None,
        })
    }

    pub fn with_faults(total_size: usize, faults: Arc<FaultInjector>) -> Arc<Self> {
        Arc::new(MemDevice {
            bytes: Mutex::new(vec![0; total_size]),
            writes: AtomicU64::new(0),
            faults: Some(faults),
        })
    }

    /// Writes attempted so far, including failed ones.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().await.clone()
    }
}

#[async_trait]
impl BlockDevice for MemDevice {
    async fn total_size(&self) -> Result<u64, PoolError> {
        Ok(self.bytes.lock().await.len() as u64)
    }

    async fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<(), PoolError> {
        let bytes = self.bytes.lock().await;
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            return Err(PoolError::IoError(format!(
                "read of {} bytes at {} past device end {}",
                data.len(),
                offset,
                bytes.len()
            )));
        }
        data.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), PoolError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(faults) = &self.faults {
            if !faults.take_write() {
                return Err(PoolError::IoError("injected write failure".to_string()));
            }
        }
        let mut bytes = self.bytes.lock().await;
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            return Err(PoolError::IoError(format!(
                "write of {} bytes at {} past device end {}",
                data.len(),
                offset,
                bytes.len()
            )));
        }
        bytes[start..end].copy_from_slice(&data);
        Ok(())
    }

    async fn flush_cache(&self) -> Result<(), PoolError> {
        Ok(())
    }
}

/// A device backed by a regular file (or a raw device node).
#[derive(Debug)]
pub struct FileDevice {
    file: Mutex<File>,
    total_size: u64,
}

impl FileDevice {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Err(e) => {
                bail!("open of {:?} failed: {}", path, e);
            }
            Ok(f) => f,
        };
        let total_size = file.metadata()?.len();
        Ok(Arc::new(FileDevice {
            file: Mutex::new(file),
            total_size,
        }))
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    async fn total_size(&self) -> Result<u64, PoolError> {
        Ok(self.total_size)
    }

    async fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<(), PoolError> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(data)?;
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), PoolError> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data)?;
        Ok(())
    }

    async fn flush_cache(&self) -> Result<(), PoolError> {
        let file = self.file.lock().await;
        file.sync_all()?;
        Ok(())
    }
}
