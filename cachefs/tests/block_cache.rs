mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use block_dev::RamDisk;
use cachefs::{BLOCK_SIZE, BlockCache, BlockDevice, CacheConfig, DataBlock, DeviceError, SectorId};
use rand::Rng;

use common::{init, wait_for};

fn sector(raw: u32) -> SectorId {
    SectorId::new(raw)
}

fn setup(sectors: usize, capacity: usize) -> (Arc<RamDisk>, Arc<BlockCache>) {
    init();
    let disk = Arc::new(RamDisk::new(sectors));
    let cache = BlockCache::with_capacity(disk.clone(), capacity);
    (disk, cache)
}

#[test]
fn read_after_write_across_eviction() {
    let (disk, cache) = setup(64, 4);
    for raw in 0..32u8 {
        cache.write(sector(raw.into()), &[raw; BLOCK_SIZE]).unwrap();
    }
    // 只有 4 帧，其余都被置换写回了
    assert!(disk.writes() >= 28);

    let mut buf = [0; BLOCK_SIZE];
    for raw in 0..32u8 {
        cache.read(sector(raw.into()), &mut buf).unwrap();
        assert_eq!([raw; BLOCK_SIZE], buf);
    }
}

#[test]
fn capacity_invariant() {
    let (_disk, cache) = setup(256, 16);
    let mut rng = rand::thread_rng();
    let mut buf = [0; BLOCK_SIZE];

    for _ in 0..2000 {
        let target = sector(rng.gen_range(0..256));
        if rng.gen_bool(0.5) {
            cache.read(target, &mut buf).unwrap();
        } else {
            cache.write(target, &[rng.r#gen(); BLOCK_SIZE]).unwrap();
        }
        assert!(cache.resident() <= cache.capacity());
    }

    let stats = cache.stats();
    assert_eq!(2000, stats.hits + stats.misses);
    assert!(stats.evictions > 0);
}

#[test]
fn dirty_frame_written_before_reuse() {
    let (disk, cache) = setup(16, 2);
    cache.write(sector(1), &[7; BLOCK_SIZE]).unwrap();
    assert_eq!([0; BLOCK_SIZE], disk.snapshot(1));

    let mut buf = [0; BLOCK_SIZE];
    for raw in 2..6 {
        cache.read(sector(raw), &mut buf).unwrap();
    }
    assert!(!cache.contains(sector(1)));
    assert_eq!([7; BLOCK_SIZE], disk.snapshot(1));
}

#[test]
fn write_is_write_back() {
    let (disk, cache) = setup(64, 16);
    for raw in 0..16u8 {
        cache.write(sector(raw.into()), &[raw; BLOCK_SIZE]).unwrap();
    }
    cache.zero(sector(3)).unwrap();
    // 全部装得下：没有置换，也就没有任何设备写
    assert_eq!(0, disk.writes());
    // 整块写入不需要先读
    assert_eq!(0, disk.reads());

    cache.flush_all().unwrap();
    assert_eq!(16, disk.writes());
    assert_eq!([0; BLOCK_SIZE], disk.snapshot(3));
    assert_eq!([15; BLOCK_SIZE], disk.snapshot(15));
}

#[test]
fn durable_after_flush() {
    let (disk, cache) = setup(64, 8);
    let mut data: DataBlock = [0; BLOCK_SIZE];
    rand::thread_rng().fill(&mut data[..]);
    cache.write(sector(42), &data).unwrap();
    cache.flush_all().unwrap();
    drop(cache);

    let fresh = BlockCache::with_capacity(disk.clone(), 8);
    let mut buf = [0; BLOCK_SIZE];
    fresh.read(sector(42), &mut buf).unwrap();
    assert_eq!(data, buf);
    assert_eq!(1, disk.reads());
}

#[test]
fn partial_update_keeps_rest() {
    let (disk, cache) = setup(16, 2);
    disk.write_block(5, &[1; BLOCK_SIZE]).unwrap();

    cache
        .map_mut(sector(5), |block: &mut DataBlock| block[10..20].fill(9))
        .unwrap();
    let mut buf = [0; BLOCK_SIZE];
    cache.read(sector(5), &mut buf).unwrap();
    assert_eq!([1; 10], buf[..10]);
    assert_eq!([9; 10], buf[10..20]);
    assert!(buf[20..].iter().all(|&b| b == 1));
}

#[test]
fn concurrent_sectors() {
    let (disk, cache) = setup(128, 8);

    thread::scope(|s| {
        for worker in 0..8u8 {
            let cache = &cache;
            s.spawn(move || {
                let mut buf = [0; BLOCK_SIZE];
                for round in 0..50u8 {
                    for i in 0..16u32 {
                        let target = sector(u32::from(worker) * 16 + i);
                        let fill = worker.wrapping_mul(31).wrapping_add(round);
                        cache.write(target, &[fill; BLOCK_SIZE]).unwrap();
                        cache.read(target, &mut buf).unwrap();
                        assert_eq!([fill; BLOCK_SIZE], buf);
                    }
                }
            });
        }
    });

    cache.flush_all().unwrap();
    for worker in 0..8u8 {
        let fill = worker.wrapping_mul(31).wrapping_add(49);
        assert_eq!([fill; BLOCK_SIZE], disk.snapshot(usize::from(worker) * 16));
    }
}

#[test]
fn write_behind_flushes_periodically() {
    init();
    let disk = Arc::new(RamDisk::new(16));
    let config = CacheConfig {
        capacity: 4,
        flush_interval: Duration::from_millis(20),
        read_ahead: false,
    };
    let cache = BlockCache::new(disk.clone(), &config);
    let daemons = cache.start().unwrap();

    cache.write(sector(2), &[5; BLOCK_SIZE]).unwrap();
    assert!(wait_for(|| disk.snapshot(2) == [5; BLOCK_SIZE]));
    assert!(!cache.read_ahead_enabled());

    daemons.shutdown().unwrap();
}

#[test]
fn shutdown_flushes() {
    let (disk, cache) = setup(16, 4);
    // 默认十秒一次，关机时不必等到下一轮
    let daemons = cache.start().unwrap();
    cache.write(sector(7), &[3; BLOCK_SIZE]).unwrap();
    assert_eq!(0, disk.writes());

    daemons.shutdown().unwrap();
    assert_eq!([3; BLOCK_SIZE], disk.snapshot(7));
    assert!(!cache.read_ahead_enabled());
}

#[test]
fn read_ahead_warms_cache() {
    let (_disk, cache) = setup(16, 4);
    let daemons = cache.start().unwrap();
    assert!(cache.read_ahead_enabled());

    cache.prefetch(sector(9));
    assert!(wait_for(|| cache.contains(sector(9))));

    daemons.shutdown().unwrap();
    // 任务停了，再请求也只是空操作
    cache.prefetch(sector(10));
    assert!(!cache.contains(sector(10)));
}

/// 可以让写入失败的设备
#[derive(Debug)]
struct Faulty {
    inner: RamDisk,
    fail_writes: AtomicBool,
}

impl BlockDevice for Faulty {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.inner.read_block(block_id, buf)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DeviceError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(DeviceError::Io {
                block: block_id,
                source: std::io::Error::other("injected"),
            });
        }
        self.inner.write_block(block_id, buf)
    }

    fn num_blocks(&self) -> usize {
        self.inner.num_blocks()
    }
}

#[test]
fn failed_write_back_keeps_frame() {
    init();
    let device = Arc::new(Faulty {
        inner: RamDisk::new(16),
        fail_writes: AtomicBool::new(true),
    });
    let cache = BlockCache::with_capacity(device.clone(), 1);
    cache.write(sector(1), &[8; BLOCK_SIZE]).unwrap();

    // 唯一的帧是脏的，写回失败，新扇区进不来
    let mut buf = [0; BLOCK_SIZE];
    assert!(matches!(
        cache.read(sector(2), &mut buf),
        Err(DeviceError::Io { block: 1, .. })
    ));
    assert!(cache.contains(sector(1)));
    assert!(cache.flush_all().is_err());

    device.fail_writes.store(false, Ordering::Relaxed);
    cache.read(sector(1), &mut buf).unwrap();
    assert_eq!([8; BLOCK_SIZE], buf);
    cache.flush_all().unwrap();
    assert_eq!([8; BLOCK_SIZE], device.inner.snapshot(1));
}

#[test]
fn failed_write_back_ends_write_behind() {
    init();
    let device = Arc::new(Faulty {
        inner: RamDisk::new(16),
        fail_writes: AtomicBool::new(true),
    });
    let config = CacheConfig {
        capacity: 4,
        flush_interval: Duration::from_millis(10),
        read_ahead: false,
    };
    let cache = BlockCache::new(device.clone(), &config);
    let daemons = cache.start().unwrap();
    cache.write(sector(4), &[1; BLOCK_SIZE]).unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(daemons.shutdown().is_err());
}
