#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use block_dev::RamDisk;
use cachefs::{BlockCache, CacheConfig, FreeMap, InodeTable, SectorId};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 空闲位图放在 0 号扇区的一套文件系统
pub struct Fixture {
    pub disk: Arc<RamDisk>,
    pub free_map: Arc<FreeMap>,
    pub table: InodeTable,
}

impl Fixture {
    pub fn new(sectors: usize, capacity: usize) -> Self {
        init();
        let disk = Arc::new(RamDisk::new(sectors));
        let cache = BlockCache::with_capacity(disk.clone(), capacity);
        let free_map = Arc::new(FreeMap::format(cache.clone(), SectorId::new(0), sectors).unwrap());
        let table = InodeTable::new(cache, free_map.clone());

        Self {
            disk,
            free_map,
            table,
        }
    }

    /// 在同一块盘上重新挂载：新的缓存、新的登记表
    pub fn remount(&self, config: &CacheConfig) -> Self {
        let sectors = self.free_map.capacity();
        let cache = BlockCache::new(self.disk.clone(), config);
        let free_map = Arc::new(FreeMap::open(cache.clone(), SectorId::new(0), sectors));
        let table = InodeTable::new(cache, free_map.clone());

        Self {
            disk: self.disk.clone(),
            free_map,
            table,
        }
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        self.table.cache()
    }

    pub fn free(&self) -> usize {
        self.free_map.free_count().unwrap()
    }
}

/// 轮询直到条件成立，最多等一秒
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
