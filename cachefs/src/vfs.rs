//! # 索引节点层
//!
//! [`InodeTable`] 登记所有已打开的 [`Inode`]：同一个描述符扇区只会有一个句柄，
//! 重复打开共享同一份引用计数。句柄的生命周期由 `open`/`close` 驱动，
//! 登记表只保存弱引用。
//!
//! 每个句柄带一把读写锁：读之间互不阻塞，“翻译 + 增长 + 写入”整体独占。

use core::fmt;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use block_dev::BLOCK_SIZE;
use enumflags2::BitFlags;
use spin::{Mutex, RwLock};

use crate::bitmap::Allocator;
use crate::block_cache::BlockCache;
use crate::error::FsError;
use crate::layout::{DataBlock, DiskInode, InodeFlag, MAX_LENGTH, SectorId};

/// 已打开索引节点的登记表
pub struct InodeTable {
    cache: Arc<BlockCache>,
    allocator: Arc<dyn Allocator>,
    open_inodes: Mutex<HashMap<SectorId, Weak<Inode>>>,
}

/// 内存中的索引节点句柄
///
/// 每次 [`InodeTable::open`] 或 [`InodeTable::reopen`] 对应一次
/// [`InodeTable::close`]；`Arc::clone` 出来的副本不算打开，不能再关闭一次。
pub struct Inode {
    /// 描述符所在扇区
    sector: SectorId,
    cache: Arc<BlockCache>,
    allocator: Arc<dyn Allocator>,
    refs: Mutex<Refs>,
    /// 描述符的内存副本，每次修改后都写回缓存
    disk: RwLock<DiskInode>,
}

#[derive(Debug)]
struct Refs {
    open_count: usize,
    deny_write_count: usize,
    /// 已删除，最后一次关闭时释放扇区
    removed: bool,
}

impl InodeTable {
    pub fn new(cache: Arc<BlockCache>, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            cache,
            allocator,
            open_inodes: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    #[inline]
    pub fn create(&self, sector: SectorId, length: usize) -> Result<(), FsError> {
        self.create_with(sector, length, BitFlags::empty())
    }

    /// 在 `sector` 上建立长为 `length` 的描述符，数据扇区全部清零。
    ///
    /// 失败时本次分配的扇区全部退还。
    pub fn create_with(
        &self,
        sector: SectorId,
        length: usize,
        flags: BitFlags<InodeFlag>,
    ) -> Result<(), FsError> {
        if length > MAX_LENGTH {
            return Err(FsError::InvalidOffset {
                offset: 0,
                len: length,
            });
        }

        let mut disk = DiskInode::new(flags);
        if let Err(e) = disk.expand_to(length, self.allocator.as_ref(), &self.cache, |_| Ok(()))
        {
            // 已提交的部分也不要了
            for data_sector in disk.release_list(&self.cache)? {
                self.allocator.release(data_sector)?;
            }
            log::warn!("create inode at sector {sector} with {length} bytes failed: {e}");
            return Err(e);
        }
        self.cache.put(sector, &disk)?;

        log::debug!("created inode at sector {sector}: {length} bytes, flags {flags:?}");
        Ok(())
    }

    /// 打开描述符，已打开的直接共享
    pub fn open(&self, sector: SectorId) -> Result<Arc<Inode>, FsError> {
        let mut open_inodes = self.open_inodes.lock();

        if let Some(inode) = open_inodes.get(&sector).and_then(Weak::upgrade) {
            inode.refs.lock().open_count += 1;
            return Ok(inode);
        }

        let disk = self.cache.map(sector, |disk: &DiskInode| *disk)?;
        if !disk.is_valid() {
            log::error!("inode at sector {sector} has bad magic {:#010x}", disk.magic());
            return Err(FsError::CorruptDescriptor {
                sector,
                magic: disk.magic(),
            });
        }

        let inode = Arc::new(Inode {
            sector,
            cache: self.cache.clone(),
            allocator: self.allocator.clone(),
            refs: Mutex::new(Refs {
                open_count: 1,
                deny_write_count: 0,
                removed: false,
            }),
            disk: RwLock::new(disk),
        });
        // 没有经过 close 就丢掉的句柄
        open_inodes.retain(|_, weak| weak.strong_count() > 0);
        open_inodes.insert(sector, Arc::downgrade(&inode));

        Ok(inode)
    }

    /// 再打开一次已持有的句柄。
    ///
    /// 每个要单独 `close` 的持有者都必须经由这里取得句柄，
    /// 直接 `Arc::clone` 不计入打开次数。
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        inode.refs.lock().open_count += 1;
        Arc::clone(inode)
    }

    /// 关闭句柄；最后一次关闭已删除的索引节点时释放它的全部扇区。
    ///
    /// 释放期间一直占着登记表，同一扇区上的 `open` 要等释放完成，
    /// 随后只会看到已作废的描述符。
    pub fn close(&self, inode: Arc<Inode>) -> Result<(), FsError> {
        let mut open_inodes = self.open_inodes.lock();
        {
            let mut refs = inode.refs.lock();

            assert!(refs.open_count > 0, "inode {} closed too often", inode.sector);
            refs.open_count -= 1;
            if refs.open_count > 0 {
                return Ok(());
            }
            debug_assert_eq!(refs.deny_write_count, 0);

            open_inodes.remove(&inode.sector);
            if !refs.removed {
                return Ok(());
            }
        }

        let released = inode.release();
        drop(open_inodes);
        released
    }

    /// 已打开的句柄数（按描述符计）
    pub fn open_inodes(&self) -> usize {
        self.open_inodes.lock().len()
    }
}

impl fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeTable")
            .field("cache", &self.cache)
            .field("open_inodes", &self.open_inodes())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("sector", &self.sector)
            .field("refs", &*self.refs.lock())
            .field("disk", &*self.disk.read())
            .finish_non_exhaustive()
    }
}

impl Inode {
    /// 描述符扇区即索引节点号
    #[inline]
    pub fn inumber(&self) -> SectorId {
        self.sector
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.disk.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.disk.read().is_dir()
    }

    #[inline]
    pub fn flags(&self) -> BitFlags<InodeFlag> {
        self.disk.read().flags()
    }

    #[inline]
    pub fn open_count(&self) -> usize {
        self.refs.lock().open_count
    }

    /// 标记删除；扇区在最后一次关闭时才真正释放
    pub fn remove(&self) {
        self.refs.lock().removed = true;
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.refs.lock().removed
    }

    /// 禁止写入，每个打开者至多调用一次
    pub fn deny_write(&self) {
        let mut refs = self.refs.lock();
        refs.deny_write_count += 1;
        assert!(refs.deny_write_count <= refs.open_count);
    }

    /// 重新允许写入，须在关闭前与 [`Inode::deny_write`] 配对
    pub fn allow_write(&self) {
        let mut refs = self.refs.lock();
        assert!(refs.deny_write_count > 0);
        assert!(refs.deny_write_count <= refs.open_count);
        refs.deny_write_count -= 1;
    }

    /// 字节偏移所在的扇区
    pub fn translate(&self, offset: usize) -> Result<Option<SectorId>, FsError> {
        Ok(self.disk.read().translate(offset, &self.cache)?)
    }

    /// 从指定位置(字节偏移)读出数据填充`buf`，返回实际读到的字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let disk = self.disk.read();

        let end = offset.saturating_add(buf.len()).min(disk.len());
        if offset >= end {
            return Ok(0);
        }

        let mut start = offset;
        // 已读取多少字节
        let mut read_size = 0;
        loop {
            // 当前块的末地址(字节)
            let current_block_end = (start / BLOCK_SIZE + 1) * BLOCK_SIZE;
            let current_block_end = current_block_end.min(end);
            let block_read_size = current_block_end - start;

            let Some(sector) = disk.translate(start, &self.cache)? else {
                break;
            };
            let dest = &mut buf[read_size..read_size + block_read_size];
            match <&mut DataBlock>::try_from(dest) {
                // 整块直接读进调用者的缓冲区
                Ok(block) => self.cache.read(sector, block)?,
                Err(_) => {
                    // 绝对地址 % 块大小 = 块内偏移
                    let inner = start % BLOCK_SIZE;
                    let dest = &mut buf[read_size..read_size + block_read_size];
                    self.cache.map(sector, |data: &DataBlock| {
                        dest.copy_from_slice(&data[inner..inner + block_read_size]);
                    })?;
                }
            }

            read_size += block_read_size;
            if current_block_end == end {
                break;
            }
            start = current_block_end;
        }

        // 预读紧随其后的扇区
        let next = end.next_multiple_of(BLOCK_SIZE);
        if next < disk.len() && self.cache.read_ahead_enabled() {
            if let Some(sector) = disk.translate(next, &self.cache)? {
                self.cache.prefetch(sector);
            }
        }

        Ok(read_size)
    }

    /// 把 `buf` 写到指定位置，越过文件末尾时先增长。
    ///
    /// 返回实际写入的字节数；磁盘空间耗尽时可能少于 `buf.len()`，
    /// 禁止写入期间返回 0。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        if self.refs.lock().deny_write_count > 0 {
            return Ok(0);
        }

        let requested_end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= MAX_LENGTH)
            .ok_or(FsError::InvalidOffset {
                offset,
                len: buf.len(),
            })?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut disk = self.disk.write();

        if requested_end > disk.len() {
            let (sector, cache) = (self.sector, &self.cache);
            let grown = disk.expand_to(requested_end, self.allocator.as_ref(), cache, |disk| {
                Ok(cache.put(sector, disk)?)
            });
            match grown {
                Ok(()) => {}
                Err(FsError::AllocationExhausted) => log::warn!(
                    "inode {sector}: disk full, length stays at {} bytes",
                    disk.len()
                ),
                Err(e) => return Err(e),
            }
        }

        let end = requested_end.min(disk.len());
        if offset >= end {
            return Ok(0);
        }

        let mut start = offset;
        let mut written_size = 0;
        loop {
            let current_block_end = ((start / BLOCK_SIZE + 1) * BLOCK_SIZE).min(end);
            let block_write_size = current_block_end - start;

            // 增长之后长度以内必有扇区
            let Some(sector) = disk.translate(start, &self.cache)? else {
                break;
            };
            let src = &buf[written_size..written_size + block_write_size];
            match <&DataBlock>::try_from(src) {
                Ok(block) => self.cache.write(sector, block)?,
                Err(_) => {
                    // 块内其余字节保持不变
                    let inner = start % BLOCK_SIZE;
                    self.cache.map_mut(sector, |data: &mut DataBlock| {
                        data[inner..inner + block_write_size].copy_from_slice(src);
                    })?;
                }
            }

            written_size += block_write_size;
            if current_block_end == end {
                break;
            }
            start = current_block_end;
        }

        Ok(written_size)
    }

    fn release(&self) -> Result<(), FsError> {
        let disk = self.disk.read();
        let sectors = disk.release_list(&self.cache)?;

        log::debug!(
            "releasing inode {}: {} bytes in {} sectors",
            self.sector,
            disk.len(),
            sectors.len()
        );
        for sector in sectors {
            self.allocator.release(sector)?;
        }
        // 作废描述符，已释放的扇区不能再被打开
        self.cache.zero(self.sector)?;
        self.allocator.release(self.sector)
    }
}
