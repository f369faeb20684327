use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, PoisonError};

use block_dev::{BLOCK_SIZE, BlockDevice, DeviceError};

/// 以宿主文件充当块设备
#[derive(Debug)]
pub struct BlockFile {
    inner: Mutex<File>,
    blocks: usize,
}

impl BlockFile {
    /// 块数取自文件长度，末尾不足一块的部分不用
    pub fn new(fd: File) -> io::Result<Self> {
        let blocks = fd.metadata()?.len() as usize / BLOCK_SIZE;
        Ok(Self {
            inner: Mutex::new(fd),
            blocks,
        })
    }

    fn seek_to(&self, file: &mut File, block_id: usize, len: usize) -> Result<(), DeviceError> {
        if block_id >= self.blocks {
            return Err(DeviceError::OutOfRange {
                block: block_id,
                blocks: self.blocks,
            });
        }
        if len != BLOCK_SIZE {
            return Err(DeviceError::ShortTransfer {
                block: block_id,
                len,
            });
        }

        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .map(drop)
            .map_err(|source| DeviceError::Io {
                block: block_id,
                source,
            })
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let mut file = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.seek_to(&mut file, block_id, buf.len())?;
        file.read_exact(buf).map_err(|source| DeviceError::Io {
            block: block_id,
            source,
        })
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        let mut file = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.seek_to(&mut file, block_id, buf.len())?;
        file.write_all(buf).map_err(|source| DeviceError::Io {
            block: block_id,
            source,
        })
    }

    #[inline]
    fn num_blocks(&self) -> usize {
        self.blocks
    }
}
