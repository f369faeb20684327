//! # 空闲扇区管理
//!
//! [`Allocator`] 是索引节点层所依赖的分配器接口；
//! [`FreeMap`] 是它的位图实现，位图本身存放在设备上，经由块缓存读写。

use std::sync::Arc;

use block_dev::BLOCK_SIZE;
use spin::Mutex;

use crate::block_cache::BlockCache;
use crate::error::FsError;
use crate::layout::{OnDisk, SectorId};

/// 一个位图块能指示的扇区数
const BLOCK_BITS: usize = BLOCK_SIZE * 8;

/// 位图区域内块的结构
type BitmapBlock = [u64; BLOCK_BITS / 64];

unsafe impl OnDisk for BitmapBlock {}

pub trait Allocator: Send + Sync {
    /// 分配 `count` 个连续扇区，返回第一个
    fn allocate(&self, count: usize) -> Result<SectorId, FsError>;

    fn release(&self, sector: SectorId) -> Result<(), FsError>;
}

/// 位图：一位对应设备上的一个扇区，置位表示已占用
#[derive(Debug)]
pub struct FreeMap {
    cache: Arc<BlockCache>,
    /// 位图的起始块
    start: SectorId,
    /// 所指示的扇区总数
    sectors: usize,
    /// 串行化“查找-置位”
    lock: Mutex<()>,
}

/// 位图内的坐标：块索引、组索引、组内索引
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BitPos {
    block: usize,
    group: usize,
    bit: usize,
}

impl BitPos {
    /// 线性映射解码
    #[inline]
    fn of(id: usize) -> Self {
        Self {
            block: id / BLOCK_BITS,
            group: id % BLOCK_BITS / 64,
            bit: id % 64,
        }
    }

    #[inline]
    fn mask(self) -> u64 {
        1 << self.bit
    }
}

impl FreeMap {
    /// 位图占用的块数
    #[inline]
    pub fn blocks_for(sectors: usize) -> usize {
        sectors.div_ceil(BLOCK_BITS)
    }

    /// 在 `start` 处建立新位图。
    ///
    /// 位图之前的扇区与位图自身都记为已占用，超出 `sectors` 的位也记为已占用。
    pub fn format(
        cache: Arc<BlockCache>,
        start: SectorId,
        sectors: usize,
    ) -> Result<Self, FsError> {
        let blocks = Self::blocks_for(sectors);
        assert!(
            start.index() + blocks <= sectors,
            "free map does not fit in {sectors} sectors"
        );

        for block in 0..blocks {
            cache.zero(start + block)?;
        }

        let map = Self {
            cache,
            start,
            sectors,
            lock: Mutex::new(()),
        };
        for id in (0..start.index() + blocks).chain(sectors..blocks * BLOCK_BITS) {
            map.set(id, true)?;
        }

        log::debug!(
            "formatted free map at sector {start}: {blocks} blocks for {sectors} sectors"
        );
        Ok(map)
    }

    /// 挂上已经存在的位图
    #[inline]
    pub fn open(cache: Arc<BlockCache>, start: SectorId, sectors: usize) -> Self {
        Self {
            cache,
            start,
            sectors,
            lock: Mutex::new(()),
        }
    }

    /// 位图所指示区域的总扇区数
    #[inline]
    pub fn capacity(&self) -> usize {
        self.sectors
    }

    pub fn free_count(&self) -> Result<usize, FsError> {
        let _guard = self.lock.lock();
        let mut free = 0;
        for block in 0..Self::blocks_for(self.sectors) {
            free += self.cache.map(self.start + block, |bitmap: &BitmapBlock| {
                bitmap
                    .iter()
                    .map(|bits| bits.count_zeros() as usize)
                    .sum::<usize>()
            })?;
        }
        Ok(free)
    }

    /// 寻找 `count` 个连续的空闲位，返回第一个的编号
    fn find_run(&self, count: usize) -> Result<Option<usize>, FsError> {
        let mut run_start = 0;
        let mut run_len = 0;

        for block in 0..Self::blocks_for(self.sectors) {
            let base = block * BLOCK_BITS;
            let found = self.cache.map(self.start + block, |bitmap: &BitmapBlock| {
                for (group, &bits) in bitmap.iter().enumerate() {
                    // 整组已满
                    if bits == u64::MAX {
                        run_len = 0;
                        continue;
                    }
                    for bit in 0..64 {
                        if bits & (1 << bit) != 0 {
                            run_len = 0;
                            continue;
                        }
                        if run_len == 0 {
                            run_start = base + group * 64 + bit;
                        }
                        run_len += 1;
                        if run_len == count {
                            return Some(run_start);
                        }
                    }
                }
                None
            })?;

            if found.is_some() {
                return Ok(found);
            }
        }

        Ok(None)
    }

    /// 置位或清位，返回原来的值
    fn set(&self, id: usize, used: bool) -> Result<bool, FsError> {
        let pos = BitPos::of(id);
        let was_used = self
            .cache
            .map_mut(self.start + pos.block, |bitmap: &mut BitmapBlock| {
                let group = &mut bitmap[pos.group];
                let was_used = *group & pos.mask() != 0;
                if used {
                    *group |= pos.mask();
                } else {
                    *group &= !pos.mask();
                }
                was_used
            })?;
        Ok(was_used)
    }
}

impl Allocator for FreeMap {
    fn allocate(&self, count: usize) -> Result<SectorId, FsError> {
        assert!(count > 0);
        let _guard = self.lock.lock();

        let Some(first) = self.find_run(count)? else {
            log::warn!("free map exhausted: no run of {count} free sectors");
            return Err(FsError::AllocationExhausted);
        };
        for id in first..first + count {
            self.set(id, true)?;
        }

        Ok(SectorId::new(first as u32))
    }

    fn release(&self, sector: SectorId) -> Result<(), FsError> {
        let _guard = self.lock.lock();
        assert!(sector.index() < self.sectors, "sector {sector} out of range");

        let was_used = self.set(sector.index(), false)?;
        // 编号一定得有对应的位
        assert!(was_used, "double free of sector {sector}");
        Ok(())
    }
}
