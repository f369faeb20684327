//! 后台任务：定时写回与预读。
//!
//! 两个任务都伴随进程运行，只能通过 [`Daemons::shutdown`] 停下；
//! 停下之后再同步写回一次。

use core::time::Duration;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};

use block_dev::{BLOCK_SIZE, DeviceError};

use super::BlockCache;
use crate::layout::{DataBlock, SectorId};

/// 正在运行的后台任务
#[derive(Debug)]
pub struct Daemons {
    cache: Arc<BlockCache>,
    stop: Option<Sender<()>>,
    write_behind: Option<JoinHandle<Result<(), DeviceError>>>,
    read_ahead: Option<JoinHandle<()>>,
}

impl BlockCache {
    /// 启动写回任务，按配置启动预读任务
    pub fn start(self: &Arc<Self>) -> io::Result<Daemons> {
        let (stop, stopped) = mpsc::channel();
        let interval = self.config.flush_interval;
        let cache = Arc::clone(self);
        let write_behind = thread::Builder::new()
            .name("write-behind".into())
            .spawn(move || write_behind(&cache, interval, stopped))?;

        let read_ahead = if self.config.read_ahead {
            let (requests, pending) = mpsc::channel();
            let cache = Arc::clone(self);
            let handle = thread::Builder::new()
                .name("read-ahead".into())
                .spawn(move || read_ahead(&cache, pending))?;
            *self.prefetch.lock() = Some(requests);
            Some(handle)
        } else {
            None
        };

        Ok(Daemons {
            cache: Arc::clone(self),
            stop: Some(stop),
            write_behind: Some(write_behind),
            read_ahead,
        })
    }
}

impl Daemons {
    /// 停下后台任务并做最后一次同步写回，返回遇到的第一个错误
    pub fn shutdown(mut self) -> Result<(), DeviceError> {
        self.teardown()
    }

    #[inline]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    fn teardown(&mut self) -> Result<(), DeviceError> {
        // 丢掉发送端，预读任务取完队列后自行退出
        self.cache.prefetch.lock().take();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        let mut result = Ok(());
        if let Some(handle) = self.read_ahead.take() {
            if handle.join().is_err() {
                log::error!("read-ahead task panicked");
            }
        }
        if let Some(handle) = self.write_behind.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(_) => log::error!("write-behind task panicked"),
            }
        }

        // 关机前最后一次同步写回
        let flushed = self.cache.flush_all();
        log::info!("block cache daemons stopped");
        result.and(flushed)
    }
}

impl Drop for Daemons {
    fn drop(&mut self) {
        if self.write_behind.is_none() {
            return;
        }
        if let Err(e) = self.teardown() {
            log::error!("block cache teardown failed: {e}");
        }
    }
}

fn write_behind(
    cache: &BlockCache,
    interval: Duration,
    stopped: Receiver<()>,
) -> Result<(), DeviceError> {
    log::info!("write-behind started, interval {interval:?}");

    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                // 设备故障不可恢复，不重试，带着错误退出
                if let Err(e) = cache.flush_all() {
                    log::error!("write-behind flush failed: {e}");
                    return Err(e);
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("write-behind stopped");
    Ok(())
}

fn read_ahead(cache: &BlockCache, pending: Receiver<SectorId>) {
    log::info!("read-ahead started");

    let mut scratch: DataBlock = [0; BLOCK_SIZE];
    for sector in pending {
        // 只为暖缓存，结果丢弃
        if let Err(e) = cache.read(sector, &mut scratch) {
            log::warn!("read-ahead of sector {sector} failed: {e}");
        }
    }

    log::info!("read-ahead stopped");
}
