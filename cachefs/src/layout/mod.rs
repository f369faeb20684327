//! # 磁盘数据结构层
//!
//! 描述符、索引表、位图块都恰好占用一个块，
//! 经由块缓存按类型映射到帧上读写。

mod inode;

use core::ops::Add;

use block_dev::BLOCK_SIZE;
use derive_more::{Display, From, Into};

pub use self::inode::{
    DIRECT_COUNT, DiskInode, INDIRECT_COUNT, INODE_MAGIC, IndexTable, InodeFlag, MAX_LENGTH,
    TABLE_LEN,
};

pub type DataBlock = [u8; BLOCK_SIZE];

/// 能直接映射到缓存帧上的磁盘结构
///
/// # Safety
///
/// 实现者必须是 `#[repr(C)]`（或基本类型数组）、`Copy`，
/// 且任意字节序列都是它的合法值，对齐不超过 8。
pub unsafe trait OnDisk: Copy {}

unsafe impl OnDisk for DataBlock {}

/// 扇区号，磁盘上以 `u32` 存储
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[repr(transparent)]
pub struct SectorId(u32);

impl SectorId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// 交给块设备驱动的块号
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Add<usize> for SectorId {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        let sector = u32::try_from(rhs)
            .ok()
            .and_then(|rhs| self.0.checked_add(rhs))
            .expect("sector number exceeds the u32 on-disk range");
        Self(sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_offset() {
        assert_eq!(SectorId::new(12), SectorId::new(4) + 8);
        assert_eq!(SectorId::new(u32::MAX), SectorId::new(u32::MAX - 1) + 1);
    }

    #[test]
    #[should_panic(expected = "exceeds the u32")]
    fn sector_overflow() {
        let _ = SectorId::new(u32::MAX) + 1;
    }

    #[test]
    #[should_panic(expected = "exceeds the u32")]
    fn sector_offset_truncation() {
        let _ = SectorId::new(0) + (u32::MAX as usize + 1);
    }
}
