//! # cachefs
//!
//! 教学操作系统的存储核心：块缓存 + 可增长的索引节点。
//!
//! 整体架构，自下而上：
//!
//! - 块设备接口层（外部，`block-dev`）
//! - 块缓存层：固定帧表、时钟置换、脏块写回、后台写回与预读
//! - 磁盘数据结构层：描述符与一级索引表
//! - 空闲扇区管理：位图分配器
//! - 索引节点层：偏移到扇区的翻译、写时增长、已打开句柄的登记

/* 块缓存层：内存上的磁盘块数据缓存 */
mod block_cache;

/* 磁盘数据结构层 */
mod layout;

/* 空闲扇区管理 */
mod bitmap;

/* 索引节点层 */
mod vfs;

pub mod config;
mod error;

pub use block_dev::{BLOCK_SIZE, BlockDevice, DeviceError};

pub use self::{
    bitmap::{Allocator, FreeMap},
    block_cache::{BlockCache, CacheStats, Daemons},
    config::CacheConfig,
    error::FsError,
    layout::{
        DIRECT_COUNT, DataBlock, DiskInode, INDIRECT_COUNT, INODE_MAGIC, IndexTable, InodeFlag,
        MAX_LENGTH, OnDisk, SectorId, TABLE_LEN,
    },
    vfs::{Inode, InodeTable},
};
