//! 存储核心的错误类型
//!
//! 分配失败与长度越界属于可恢复错误, 交由上层 (目录层) 处理;
//! 设备错误与结构损坏会终止当前操作链.

use std::io;

use thiserror::Error;

use super::SectorId;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("free-space allocator cannot supply {requested} sector(s)")]
    AllocationExhausted { requested: usize },
    #[error("length {requested} exceeds the maximum file size {max}")]
    SizeLimitExceeded { requested: usize, max: usize },
    #[error("block device I/O failed: {0}")]
    Device(#[from] io::Error),
    #[error("inode record at sector {sector} is corrupted (magic {magic:#x})")]
    Corrupted { sector: SectorId, magic: u32 },
    #[error("inode at sector {sector} is being released")]
    Released { sector: SectorId },
    #[error("superblock magic mismatch, not a sector-fs volume")]
    BadSuperBlock,
    #[error("sector {sector} is outside the device ({total} sectors)")]
    OutOfRange { sector: SectorId, total: u32 },
}

impl FsError {
    /// 分配器耗尽或长度越界: 上层可以当作普通失败处理
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FsError::AllocationExhausted { .. } | FsError::SizeLimitExceeded { .. }
        )
    }
}
