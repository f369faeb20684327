//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，例如磁盘、光盘、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 读写都是同步的，每次恰好传输 [`BLOCK_SIZE`] 字节。

mod ram_disk;

use core::any::Any;
use core::fmt::Debug;
use std::io;

pub use self::ram_disk::RamDisk;

pub const BLOCK_SIZE: usize = 512;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any + Debug {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError>;

    /// 设备的总块数
    fn num_blocks(&self) -> usize;
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("block {block} out of range (device has {blocks} blocks)")]
    OutOfRange { block: usize, blocks: usize },
    #[error("short transfer on block {block}: {len} bytes")]
    ShortTransfer { block: usize, len: usize },
    #[error("I/O error on block {block}: {source}")]
    Io {
        block: usize,
        #[source]
        source: io::Error,
    },
}
