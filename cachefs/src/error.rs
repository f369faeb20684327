use block_dev::DeviceError;

use crate::SectorId;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// 没有空闲扇区了
    #[error("no free sectors left")]
    AllocationExhausted,
    /// 描述符的魔数不对
    #[error("corrupt inode descriptor at sector {sector} (magic {magic:#010x})")]
    CorruptDescriptor { sector: SectorId, magic: u32 },
    /// 偏移越过了文件能达到的最大长度
    #[error("range at offset {offset} with {len} bytes exceeds the maximum file length")]
    InvalidOffset { offset: usize, len: usize },
    #[error(transparent)]
    Device(#[from] DeviceError),
}
