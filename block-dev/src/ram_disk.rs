use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{BLOCK_SIZE, BlockDevice, DeviceError};

/// 内存里的块设备，读写次数可查
#[derive(Debug)]
pub struct RamDisk {
    blocks: Mutex<Vec<[u8; BLOCK_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BLOCK_SIZE]; num_blocks]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过驱动计数，直接取出某块在“盘上”的内容
    pub fn snapshot(&self, block_id: usize) -> [u8; BLOCK_SIZE] {
        self.blocks()[block_id]
    }

    fn blocks(&self) -> MutexGuard<'_, Vec<[u8; BLOCK_SIZE]>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, block_id: usize, len: usize) -> Result<(), DeviceError> {
        let blocks = self.num_blocks();
        if block_id >= blocks {
            return Err(DeviceError::OutOfRange {
                block: block_id,
                blocks,
            });
        }
        if len != BLOCK_SIZE {
            return Err(DeviceError::ShortTransfer {
                block: block_id,
                len,
            });
        }
        Ok(())
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.check(block_id, buf.len())?;
        buf.copy_from_slice(&self.blocks()[block_id]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        self.check(block_id, buf.len())?;
        self.blocks()[block_id].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[inline]
    fn num_blocks(&self) -> usize {
        self.blocks().len()
    }
}
