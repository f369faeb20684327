mod block_file;
mod cli;

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use cachefs::{
    Allocator, BLOCK_SIZE, BlockCache, BlockDevice, CacheConfig, Daemons, DeviceError, DiskInode,
    FreeMap, FsError, InodeTable, SectorId,
};
use clap::Parser;

pub use self::{
    block_file::BlockFile,
    cli::{Cli, Command},
};

/// 空闲位图的起始扇区
const FREE_MAP_START: SectorId = SectorId::new(0);

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("image too small: {0} sectors")]
    TooSmall(usize),
}

/// 打开的镜像：缓存、后台任务、位图、登记表
struct Image {
    daemons: Daemons,
    free_map: Arc<FreeMap>,
    table: InodeTable,
}

impl Image {
    fn open(path: &Path, config: &CacheConfig) -> Result<Self, Error> {
        let fd = OpenOptions::new().read(true).write(true).open(path)?;
        let device = Arc::new(BlockFile::new(fd)?);
        let sectors = device.num_blocks();
        log::info!("image={path:?} sectors={sectors}");

        let cache = BlockCache::new(device, config);
        let free_map = Arc::new(FreeMap::open(cache.clone(), FREE_MAP_START, sectors));
        Ok(Self::mount(cache, free_map)?)
    }

    fn mount(cache: Arc<BlockCache>, free_map: Arc<FreeMap>) -> io::Result<Self> {
        let daemons = cache.start()?;
        let table = InodeTable::new(cache, free_map.clone());
        Ok(Self {
            daemons,
            free_map,
            table,
        })
    }

    /// 停下后台任务，把脏块全部写回
    fn unmount(self) -> Result<(), Error> {
        let Self {
            daemons, table, ..
        } = self;
        debug_assert_eq!(0, table.open_inodes());
        daemons.shutdown()?;
        Ok(())
    }
}

fn format(path: &Path, sectors: usize, config: &CacheConfig) -> Result<(), Error> {
    // 至少放得下位图和一个描述符
    if sectors < FreeMap::blocks_for(sectors) + 1 {
        return Err(Error::TooSmall(sectors));
    }

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    fd.set_len((sectors * BLOCK_SIZE) as u64)?;

    let device = Arc::new(BlockFile::new(fd)?);
    let cache = BlockCache::new(device, config);
    let free_map = Arc::new(FreeMap::format(cache.clone(), FREE_MAP_START, sectors)?);
    let free = free_map.free_count()?;
    Image::mount(cache, free_map)?.unmount()?;

    println!("formatted {path:?}: {sectors} sectors, {free} free");
    Ok(())
}

fn put(image: &Image, source: &Path) -> Result<SectorId, Error> {
    let data = fs::read(source)?;

    let sector = image.free_map.allocate(1)?;
    if let Err(e) = image.table.create(sector, 0) {
        image.free_map.release(sector)?;
        return Err(e.into());
    }

    let inode = image.table.open(sector)?;
    let written = inode.write_at(0, &data)?;
    if written < data.len() {
        log::error!("{source:?}: only {written} of {} bytes fit", data.len());
        inode.remove();
        image.table.close(inode)?;
        return Err(FsError::AllocationExhausted.into());
    }
    image.table.close(inode)?;

    log::info!("{source:?} -> inode {sector}, {written} bytes");
    Ok(sector)
}

fn get(image: &Image, sector: SectorId, out: &Path) -> Result<(), Error> {
    let inode = image.table.open(sector)?;
    let mut data = vec![0; inode.len()];
    let read = inode.read_at(0, &mut data);
    image.table.close(inode)?;

    data.truncate(read?);
    fs::write(out, &data)?;
    Ok(())
}

fn stat(image: &Image, sector: SectorId) -> Result<(), Error> {
    let inode = image.table.open(sector)?;
    let (len, is_dir) = (inode.len(), inode.is_dir());
    image.table.close(inode)?;

    println!("inode:   {sector}");
    println!("kind:    {}", if is_dir { "directory" } else { "file" });
    println!("length:  {len}");
    // 数据块、索引表，外加描述符本身
    println!("sectors: {}", DiskInode::total_sectors(len) + 1);
    println!("free:    {}", image.free_map.free_count()?);
    Ok(())
}

fn rm(image: &Image, sector: SectorId) -> Result<(), Error> {
    let inode = image.table.open(sector)?;
    inode.remove();
    image.table.close(inode)?;
    Ok(())
}

/// 挂上镜像执行 `action`，无论成败都卸载
fn with_image(
    path: &Path,
    config: &CacheConfig,
    action: impl FnOnce(&Image) -> Result<(), Error>,
) -> Result<(), Error> {
    let image = Image::open(path, config)?;
    // 命令失败也要把已经写进缓存的内容落盘
    let result = action(&image);
    let unmounted = image.unmount();
    result.and(unmounted)
}

fn run(cli: Cli) -> Result<(), Error> {
    let config = cli.cache.config();

    match cli.command {
        Command::Format { image, sectors } => format(&image, sectors, &config),
        Command::Put { image, source } => with_image(&image, &config, |image| {
            println!("{}", put(image, &source)?);
            Ok(())
        }),
        Command::Get { image, inode, out } => with_image(&image, &config, |image| {
            get(image, SectorId::new(inode), &out)
        }),
        Command::Stat { image, inode } => {
            with_image(&image, &config, |image| stat(image, SectorId::new(inode)))
        }
        Command::Rm { image, inode } => {
            with_image(&image, &config, |image| rm(image, SectorId::new(inode)))
        }
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
