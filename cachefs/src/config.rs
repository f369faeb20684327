use core::time::Duration;

/// 块缓存的帧数
pub const CACHE_CAPACITY: usize = 64;

/// 后台写回的间隔
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// 块缓存的运行时配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// 帧表容量
    pub capacity: usize,
    /// 两次后台写回之间的间隔
    pub flush_interval: Duration,
    /// 是否启动预读任务
    pub read_ahead: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: CACHE_CAPACITY,
            flush_interval: FLUSH_INTERVAL,
            read_ahead: true,
        }
    }
}
