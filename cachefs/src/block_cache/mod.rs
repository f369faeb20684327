//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟固定数量的帧，
//! 把即将操作的块复制到帧中，提高对块设备的操作效率。
//!
//! - 帧表由一把锁保护：槽位元数据、扇区到槽位的索引、时钟指针；
//! - 每个帧的数据另有一把锁，装载与写回时不必占着帧表锁；
//! - 写入只落在帧上（脏块），持久化只发生在置换写回或 [`BlockCache::flush_all`]；
//! - 置换采用时钟（二次机会）算法，`pin_count > 0` 的帧永远不会被选中。

mod daemon;

pub use self::daemon::Daemons;

use core::fmt;
use core::mem;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::thread;

use block_dev::{BLOCK_SIZE, BlockDevice, DeviceError};
use spin::Mutex;

use crate::config::CacheConfig;
use crate::layout::{DataBlock, OnDisk, SectorId};

pub struct BlockCache {
    /// 底层块设备的引用
    device: Arc<dyn BlockDevice>,
    config: CacheConfig,
    table: Mutex<FrameTable>,
    frames: Box<[Mutex<Frame>]>,
    /// 预读请求的发送端，预读任务未运行时为空
    prefetch: Mutex<Option<Sender<SectorId>>>,
    stats: Stats,
}

/// 块缓存的计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    /// 写回设备的脏帧数，含置换与同步
    pub write_backs: usize,
}

#[derive(Debug, Default)]
struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    write_backs: AtomicUsize,
}

#[derive(Debug)]
struct FrameTable {
    slots: Vec<Slot>,
    /// 扇区 -> 槽位
    index: HashMap<SectorId, usize>,
    /// 时钟指针
    hand: usize,
}

/// 槽位元数据
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// 该槽位分配给了哪个扇区
    sector: Option<SectorId>,
    /// 最近被访问过，置换时给一次机会
    referenced: bool,
    /// 正在进行中的访问数，非零时不可置换
    pin_count: usize,
}

#[derive(Debug)]
#[repr(C, align(8))]
struct Buffer([u8; BLOCK_SIZE]);

/// 内存中的帧
#[derive(Debug)]
struct Frame {
    data: Buffer,
    /// `data` 中实际装着的扇区
    sector: Option<SectorId>,
    /// 是否为脏块
    dirty: bool,
}

/// 未命中时帧内容的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// 从设备读入
    Load,
    /// 调用者会整块覆盖，无需读设备
    Overwrite,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>, config: &CacheConfig) -> Arc<Self> {
        assert!(config.capacity > 0, "block cache needs at least one frame");

        let capacity = config.capacity;
        Arc::new(Self {
            device,
            config: config.clone(),
            table: Mutex::new(FrameTable {
                slots: vec![Slot::default(); capacity],
                index: HashMap::with_capacity(capacity),
                hand: 0,
            }),
            frames: (0..capacity).map(|_| Mutex::new(Frame::new())).collect(),
            prefetch: Mutex::new(None),
            stats: Stats::default(),
        })
    }

    #[inline]
    pub fn with_capacity(device: Arc<dyn BlockDevice>, capacity: usize) -> Arc<Self> {
        Self::new(
            device,
            &CacheConfig {
                capacity,
                ..Default::default()
            },
        )
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 读出扇区的当前内容，未命中时从设备装载
    pub fn read(&self, sector: SectorId, buf: &mut DataBlock) -> Result<(), DeviceError> {
        self.access(sector, Fill::Load, |frame| buf.copy_from_slice(&frame.data.0))
    }

    /// 整块写入，只标记为脏块，不触碰设备
    #[inline]
    pub fn write(&self, sector: SectorId, buf: &DataBlock) -> Result<(), DeviceError> {
        self.put(sector, buf)
    }

    /// 装入全零的脏块，用于新分配的扇区
    pub fn zero(&self, sector: SectorId) -> Result<(), DeviceError> {
        self.access(sector, Fill::Overwrite, |frame| {
            frame.data.0.fill(0);
            frame.dirty = true;
        })
    }

    /// 以整块结构覆盖扇区内容
    pub fn put<T: OnDisk>(&self, sector: SectorId, value: &T) -> Result<(), DeviceError> {
        assert_eq!(mem::size_of::<T>(), BLOCK_SIZE);
        self.access(sector, Fill::Overwrite, |frame| *frame.get_mut() = *value)
    }

    #[inline]
    pub fn map<T: OnDisk, V>(
        &self,
        sector: SectorId,
        f: impl FnOnce(&T) -> V,
    ) -> Result<V, DeviceError> {
        self.access(sector, Fill::Load, |frame| f(frame.get()))
    }

    /// 就地修改，在帧锁内完成“读-改-写”
    #[inline]
    pub fn map_mut<T: OnDisk, V>(
        &self,
        sector: SectorId,
        f: impl FnOnce(&mut T) -> V,
    ) -> Result<V, DeviceError> {
        self.access(sector, Fill::Load, |frame| f(frame.get_mut()))
    }

    /// 把所有脏帧写回设备，帧仍留在缓存中。
    ///
    /// 每一帧都会尝试，返回遇到的第一个错误。
    pub fn flush_all(&self) -> Result<(), DeviceError> {
        let mut flushed = 0;
        let mut first_error = None;

        for slot in 0..self.capacity() {
            // 同步不算访问，不置 referenced
            {
                let mut table = self.table.lock();
                let meta = &mut table.slots[slot];
                if meta.sector.is_none() {
                    continue;
                }
                meta.pin_count += 1;
            }

            let result = self.frames[slot].lock().sync(self.device.as_ref());
            self.unpin(slot, false);

            match result {
                Ok(true) => {
                    flushed += 1;
                    self.stats.write_backs.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!("flush of frame {slot} failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        log::debug!("flushed {flushed} dirty frames");
        first_error.map_or(Ok(()), Err)
    }

    /// 请求预读扇区；预读任务未运行时什么也不做
    pub fn prefetch(&self, sector: SectorId) {
        if let Some(requests) = self.prefetch.lock().as_ref() {
            // 预读任务已退出，请求丢了也无妨
            let _ = requests.send(sector);
        }
    }

    #[inline]
    pub fn read_ahead_enabled(&self) -> bool {
        self.prefetch.lock().is_some()
    }

    /// 当前驻留的扇区数
    pub fn resident(&self) -> usize {
        self.table.lock().index.len()
    }

    pub fn contains(&self, sector: SectorId) -> bool {
        self.table.lock().index.contains_key(&sector)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            write_backs: self.stats.write_backs.load(Ordering::Relaxed),
        }
    }
}

impl BlockCache {
    /// 钉住扇区所在的帧，在帧锁内操作，再解除钉住
    fn access<V>(
        &self,
        sector: SectorId,
        fill: Fill,
        f: impl FnOnce(&mut Frame) -> V,
    ) -> Result<V, DeviceError> {
        let slot = self.pin(sector)?;

        let result = {
            let mut frame = self.frames[slot].lock();
            frame
                .install(sector, fill, self.device.as_ref())
                .map(|()| f(&mut frame))
        };

        self.unpin(slot, result.is_err());
        result
    }

    /// 找到或腾出一个帧给 `sector`，并钉住它
    fn pin(&self, sector: SectorId) -> Result<usize, DeviceError> {
        loop {
            let mut guard = self.table.lock();
            let table = &mut *guard;

            // 命中
            if let Some(&slot) = table.index.get(&sector) {
                let meta = &mut table.slots[slot];
                meta.pin_count += 1;
                meta.referenced = true;
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                log::trace!("cache hit: sector {sector} in frame {slot}");
                return Ok(slot);
            }

            // 未命中，腾出一帧；帧内容由持帧锁的第一位访问者装载
            if let Some(slot) = self.evict(table)? {
                table.slots[slot] = Slot {
                    sector: Some(sector),
                    referenced: true,
                    pin_count: 1,
                };
                table.index.insert(sector, slot);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                log::trace!("cache miss: sector {sector} -> frame {slot}");
                return Ok(slot);
            }

            // 所有帧都被钉住了，让出帧表稍后再试
            drop(guard);
            log::trace!("all {} frames pinned, retrying", self.capacity());
            thread::yield_now();
        }
    }

    fn unpin(&self, slot: usize, failed: bool) {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        let meta = &mut table.slots[slot];

        meta.pin_count -= 1;

        // 装载失败且再无访问者：帧里不是该扇区的内容，解除映射
        if failed && meta.pin_count == 0 {
            let loaded = self.frames[slot].lock().sector;
            if loaded != meta.sector {
                if let Some(sector) = meta.sector.take() {
                    table.index.remove(&sector);
                }
                meta.referenced = false;
            }
        }
    }

    /// 时钟算法：从指针处循环扫描，选出可回收的帧。
    ///
    /// 被钉住的帧跳过；空帧直接回收；未被引用的帧写回后回收；
    /// 被引用的帧清掉引用位，给它第二次机会。
    /// 只要存在未钉住的帧，两圈之内必有结果；返回 `None` 表示全部被钉住。
    fn evict(&self, table: &mut FrameTable) -> Result<Option<usize>, DeviceError> {
        let capacity = table.slots.len();

        for _ in 0..2 * capacity {
            let slot = table.hand;
            table.hand = (table.hand + 1) % capacity;

            let meta = &mut table.slots[slot];
            if meta.pin_count > 0 {
                continue;
            }
            let Some(victim) = meta.sector else {
                return Ok(Some(slot));
            };
            if meta.referenced {
                meta.referenced = false;
                continue;
            }

            // 占着帧表锁写回，保证旧扇区在写回完成前不会被别人从设备读到旧值
            if self.frames[slot].lock().evict(self.device.as_ref())? {
                self.stats.write_backs.fetch_add(1, Ordering::Relaxed);
            }
            table.index.remove(&victim);
            table.slots[slot] = Slot::default();
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            log::debug!("evicted sector {victim} from frame {slot}");

            return Ok(Some(slot));
        }

        Ok(None)
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("device", &self.device)
            .field("capacity", &self.capacity())
            .field("resident", &self.resident())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Buffer([0; BLOCK_SIZE]),
            sector: None,
            dirty: false,
        }
    }

    /// 保证帧里装的是 `sector`
    fn install(
        &mut self,
        sector: SectorId,
        fill: Fill,
        device: &dyn BlockDevice,
    ) -> Result<(), DeviceError> {
        if self.sector == Some(sector) {
            return Ok(());
        }
        // 置换时已写回
        debug_assert!(!self.dirty);

        if fill == Fill::Load {
            device.read_block(sector.index(), &mut self.data.0)?;
        }
        self.sector = Some(sector);
        self.dirty = false;

        Ok(())
    }

    /// 脏块写回设备，返回是否真的写了
    fn sync(&mut self, device: &dyn BlockDevice) -> Result<bool, DeviceError> {
        match self.sector {
            Some(sector) if self.dirty => {
                device.write_block(sector.index(), &self.data.0)?;
                self.dirty = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// 写回失败时帧保持原样：仍然驻留、仍然是脏的
    fn evict(&mut self, device: &dyn BlockDevice) -> Result<bool, DeviceError> {
        let written = self.sync(device)?;
        self.sector = None;
        Ok(written)
    }

    fn get<T: OnDisk>(&self) -> &T {
        assert!(mem::size_of::<T>() <= BLOCK_SIZE);
        assert!(mem::align_of::<T>() <= mem::align_of::<Buffer>());
        unsafe { &*self.data.0.as_ptr().cast::<T>() }
    }

    fn get_mut<T: OnDisk>(&mut self) -> &mut T {
        assert!(mem::size_of::<T>() <= BLOCK_SIZE);
        assert!(mem::align_of::<T>() <= mem::align_of::<Buffer>());
        self.dirty = true;
        unsafe { &mut *self.data.0.as_mut_ptr().cast::<T>() }
    }
}
