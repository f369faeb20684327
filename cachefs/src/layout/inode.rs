//! 磁盘上的索引节点（描述符）
//!
//! 描述符恰好占一个块：长度、魔数、标志，随后是直接索引与一级索引。
//!
//! - 直接索引：每个编号指向一个**数据块**
//! - 一级索引：每个编号指向一个**索引表**，索引表整块连续存储**块编号**，
//!   每个编号都指向一个数据块
//!
//! 长度以内的字节都有扇区落脚；长度之外的扇区可以尚未分配。

use core::mem;

use block_dev::{BLOCK_SIZE, DeviceError};
use enumflags2::{BitFlags, bitflags};

use super::{OnDisk, SectorId};
use crate::bitmap::Allocator;
use crate::block_cache::BlockCache;
use crate::error::FsError;

/// 直接索引的个数
pub const DIRECT_COUNT: usize = 8;
/// 索引表的编号容量
pub const TABLE_LEN: usize = BLOCK_SIZE / mem::size_of::<SectorId>();
/// 一级索引的个数：把描述符余下的空间占满
pub const INDIRECT_COUNT: usize = BLOCK_SIZE / 4 - 3 - DIRECT_COUNT;

/// 一个文件最多能有的数据块数
const MAX_SECTORS: usize = DIRECT_COUNT + INDIRECT_COUNT * TABLE_LEN;
/// 文件的最大长度（字节）
pub const MAX_LENGTH: usize = MAX_SECTORS * BLOCK_SIZE;

pub const INODE_MAGIC: u32 = 0x494e4f44;

/// 索引表
pub type IndexTable = [SectorId; TABLE_LEN];

unsafe impl OnDisk for IndexTable {}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DiskInode {
    // 不用usize是为了严控布局
    length: u32,
    magic: u32,
    flags: u32,
    direct: [SectorId; DIRECT_COUNT],
    indirect: [SectorId; INDIRECT_COUNT],
}

unsafe impl OnDisk for DiskInode {}

const _: () = assert!(mem::size_of::<DiskInode>() == BLOCK_SIZE);

#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeFlag {
    Directory = 0b1,
}

/// 数据块的逻辑索引在描述符中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Direct(usize),
    Indirect { table: usize, entry: usize },
}

impl Position {
    fn of(block_index: usize) -> Option<Self> {
        if block_index < DIRECT_COUNT {
            return Some(Self::Direct(block_index));
        }

        // 剔去直接索引的部分
        let index = block_index - DIRECT_COUNT;
        let table = index / TABLE_LEN;
        (table < INDIRECT_COUNT).then_some(Self::Indirect {
            table,
            entry: index % TABLE_LEN,
        })
    }
}

impl DiskInode {
    pub fn new(flags: BitFlags<InodeFlag>) -> Self {
        Self {
            length: 0,
            magic: INODE_MAGIC,
            flags: flags.bits(),
            direct: [SectorId::default(); DIRECT_COUNT],
            indirect: [SectorId::default(); INDIRECT_COUNT],
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[inline]
    pub fn magic(&self) -> u32 {
        self.magic
    }

    #[inline]
    pub fn flags(&self) -> BitFlags<InodeFlag> {
        BitFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.flags().contains(InodeFlag::Directory)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// 字节偏移所在的扇区；偏移不在长度以内时返回空
    pub fn translate(
        &self,
        offset: usize,
        cache: &BlockCache,
    ) -> Result<Option<SectorId>, DeviceError> {
        if offset >= self.len() {
            return Ok(None);
        }

        match Position::of(offset / BLOCK_SIZE) {
            Some(Position::Direct(index)) => Ok(Some(self.direct[index])),
            Some(Position::Indirect { table, entry }) => cache
                .map(self.indirect[table], |table: &IndexTable| table[entry])
                .map(Some),
            None => Ok(None),
        }
    }

    /// 把分配范围扩展到能覆盖 `new_len` 字节，新扇区全部清零。
    ///
    /// 先补直接索引，再逐个补索引表。直接索引补完后、每张索引表写回后，
    /// 都把长度推进到已覆盖的范围并调用 `commit` 持久化描述符。
    /// 分配失败时释放这一步新分配的扇区，长度停在上一次提交的值，
    /// 返回 [`FsError::AllocationExhausted`]。
    pub fn expand_to(
        &mut self,
        new_len: usize,
        allocator: &dyn Allocator,
        cache: &BlockCache,
        mut commit: impl FnMut(&Self) -> Result<(), FsError>,
    ) -> Result<(), FsError> {
        assert!(new_len <= MAX_LENGTH);
        if new_len <= self.len() {
            return Ok(());
        }

        let mut sectors = Self::data_sectors(self.len());
        let target = Self::data_sectors(new_len);

        /******************** 直接索引 ********************/
        if sectors < DIRECT_COUNT && sectors < target {
            let end = target.min(DIRECT_COUNT);
            let fresh = allocate_zeroed(end - sectors, allocator, cache)?;
            self.direct[sectors..end].copy_from_slice(&fresh);

            sectors = end;
            self.cover(sectors, new_len);
            commit(self)?;
            log::debug!("direct pointers now cover {} bytes", self.length);
        }
        /******************** END ********************/

        /******************** 一级索引 ********************/
        while sectors < target {
            let index = sectors - DIRECT_COUNT;
            let table_index = index / TABLE_LEN;
            let lo = index % TABLE_LEN;
            let hi = (target - DIRECT_COUNT - table_index * TABLE_LEN).min(TABLE_LEN);

            // 索引表内一项都没有时，这张表也尚未分配
            let (table_sector, mut table) = if lo == 0 {
                (allocator.allocate(1)?, [SectorId::default(); TABLE_LEN])
            } else {
                let sector = self.indirect[table_index];
                (sector, cache.map(sector, |table: &IndexTable| *table)?)
            };

            let fresh = match allocate_zeroed(hi - lo, allocator, cache) {
                Ok(fresh) => fresh,
                Err(e) => {
                    if lo == 0 {
                        release_all(allocator, &[table_sector]);
                    }
                    return Err(e);
                }
            };
            table[lo..hi].copy_from_slice(&fresh);
            cache.put(table_sector, &table)?;
            self.indirect[table_index] = table_sector;

            sectors = DIRECT_COUNT + table_index * TABLE_LEN + hi;
            self.cover(sectors, new_len);
            commit(self)?;
            log::debug!(
                "index table {table_index} at sector {table_sector} now covers {} bytes",
                self.length
            );
        }
        /******************** END ********************/

        // 没有新扇区，长度仍落在最后一个扇区内
        if self.len() != new_len {
            self.length = new_len as u32;
            commit(self)?;
        }

        Ok(())
    }

    /// 描述符占用的全部扇区：先是数据块（直接索引，再逐张索引表），最后是索引表本身
    pub fn release_list(&self, cache: &BlockCache) -> Result<Vec<SectorId>, DeviceError> {
        let data_sectors = Self::data_sectors(self.len());
        let mut sectors = Vec::with_capacity(Self::total_sectors(self.len()));

        sectors.extend_from_slice(&self.direct[..data_sectors.min(DIRECT_COUNT)]);

        let tables = &self.indirect[..Self::table_count(data_sectors)];
        let mut remaining = data_sectors.saturating_sub(DIRECT_COUNT);
        for &table in tables {
            let take = remaining.min(TABLE_LEN);
            cache.map(table, |table: &IndexTable| {
                sectors.extend_from_slice(&table[..take]);
            })?;
            remaining -= take;
        }
        sectors.extend_from_slice(tables);

        Ok(sectors)
    }

    /// 计算容纳指定数据量需要多少个**数据块**
    #[inline]
    pub fn data_sectors(len: usize) -> usize {
        len.div_ceil(BLOCK_SIZE)
    }

    /// 计算容纳指定数据量需要多少个 **数据块** 和 **索引表**
    #[inline]
    pub fn total_sectors(len: usize) -> usize {
        let data_sectors = Self::data_sectors(len);
        data_sectors + Self::table_count(data_sectors)
    }

    #[inline]
    fn table_count(data_sectors: usize) -> usize {
        data_sectors.saturating_sub(DIRECT_COUNT).div_ceil(TABLE_LEN)
    }

    /// 长度推进到前 `sectors` 个扇区，但不超过目标
    #[inline]
    fn cover(&mut self, sectors: usize, new_len: usize) {
        self.length = (sectors * BLOCK_SIZE).min(new_len) as u32;
    }
}

/// 逐个分配并清零；中途失败则把本次分配的全部退还
fn allocate_zeroed(
    count: usize,
    allocator: &dyn Allocator,
    cache: &BlockCache,
) -> Result<Vec<SectorId>, FsError> {
    let mut fresh = Vec::with_capacity(count);

    for _ in 0..count {
        let result = allocator.allocate(1).and_then(|sector| {
            fresh.push(sector);
            cache.zero(sector).map_err(FsError::from)
        });
        if let Err(e) = result {
            log::warn!("allocation stopped after {} of {count} sectors: {e}", fresh.len());
            release_all(allocator, &fresh);
            return Err(e);
        }
    }

    Ok(fresh)
}

fn release_all(allocator: &dyn Allocator, sectors: &[SectorId]) {
    for &sector in sectors {
        if let Err(e) = allocator.release(sector) {
            log::error!("failed to release sector {sector}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(BLOCK_SIZE, mem::size_of::<DiskInode>());
        assert_eq!(BLOCK_SIZE, mem::size_of::<IndexTable>());
        assert_eq!(128, TABLE_LEN);
        assert_eq!(117, INDIRECT_COUNT);
    }

    #[test]
    fn position() {
        assert_eq!(Some(Position::Direct(7)), Position::of(7));
        assert_eq!(
            Some(Position::Indirect { table: 0, entry: 0 }),
            Position::of(DIRECT_COUNT)
        );
        assert_eq!(
            Some(Position::Indirect { table: 1, entry: 2 }),
            Position::of(DIRECT_COUNT + TABLE_LEN + 2)
        );
        assert_eq!(
            Some(Position::Indirect {
                table: INDIRECT_COUNT - 1,
                entry: TABLE_LEN - 1
            }),
            Position::of(MAX_SECTORS - 1)
        );
        assert_eq!(None, Position::of(MAX_SECTORS));
    }

    #[test]
    fn sector_counts() {
        assert_eq!(0, DiskInode::total_sectors(0));
        assert_eq!(1, DiskInode::total_sectors(1));
        assert_eq!(8, DiskInode::total_sectors(DIRECT_COUNT * BLOCK_SIZE));
        // 跨入一级索引，多一张索引表
        assert_eq!(10, DiskInode::total_sectors(DIRECT_COUNT * BLOCK_SIZE + 1));
        assert_eq!(
            DIRECT_COUNT + TABLE_LEN + 1 + 2,
            DiskInode::total_sectors((DIRECT_COUNT + TABLE_LEN + 1) * BLOCK_SIZE)
        );
    }

    #[test]
    fn flags() {
        let file = DiskInode::new(BitFlags::empty());
        let dir = DiskInode::new(InodeFlag::Directory.into());
        assert!(file.is_valid() && !file.is_dir() && file.is_empty());
        assert!(dir.is_dir());
    }
}
