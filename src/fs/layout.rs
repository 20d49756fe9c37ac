//! 磁盘数据结构层的代码在 layout.rs 和 free_map.rs 中
//!
//! 三个数据结构 [`SuperBlock`], [`DiskInode`], [`IndexBlock`]
//!
//! 卷的磁盘布局:
//!
//! - 扇区 0 是超级块 ([`SuperBlock`]), 以魔数的形式提供合法性检查, 同时记录空闲位图的位置
//! - 紧随其后的若干扇区是空闲扇区位图, 每个 bit 对应设备上的一个扇区
//! - 其余扇区由分配器按需分配, 用作 inode 记录, 索引块或数据块

use std::fmt::{Debug, Formatter, Result};

use super::{
    SectorId, DIRECT_COUNT, INDIRECT_COUNT, INODE_MAGIC, SECTOR_SIZE, SUPER_MAGIC,
};

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SuperBlock {
    magic: u32, // 用于文件系统合法性验证的魔数
    pub total_sectors: u32,
    pub free_map_start: u32,
    pub free_map_sectors: u32,
    /// 格式化时间 (unix 秒)
    pub formatted_at: i64,
}

impl Debug for SuperBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("SuperBlock")
            .field("magic", &self.magic)
            .field("total_sectors", &self.total_sectors)
            .field("free_map_start", &self.free_map_start)
            .field("free_map_sectors", &self.free_map_sectors)
            .field("formatted_at", &self.formatted_at)
            .finish()
    }
}

/// SuperBlock 是一个磁盘上数据结构, 它就存放在磁盘上编号为 0 的扇区的起始处
impl SuperBlock {
    pub fn initialize(
        &mut self,
        total_sectors: u32,
        free_map_start: u32,
        free_map_sectors: u32,
        formatted_at: i64,
    ) {
        *self = Self {
            magic: SUPER_MAGIC,
            total_sectors,
            free_map_start,
            free_map_sectors,
            formatted_at,
        };
    }

    /// is_valid 可以通过魔数判断超级块所在的卷是否合法
    pub fn is_valid(&self) -> bool {
        self.magic == SUPER_MAGIC
    }
}

/// 索引块 IndexBlock 实质上是一个 u32 数组, 每个都指向一个下一级索引块或者数据块; 0 表示未分配
pub type IndexBlock = [u32; INDIRECT_COUNT]; // size = 512B / 4B(u32) = 128

/// 数据块只是一个字节数组
pub type DataBlock = [u8; SECTOR_SIZE];

/// 每个文件/目录在磁盘上以一个 DiskInode 的形式存储, 恰好占据一个扇区
///
/// (12 + 1 + 1 + 1 + 1 + 1 + 111) * 4 = 512 B
#[repr(C)]
#[derive(Clone)]
pub struct DiskInode {
    /// 直接索引: 文件的前 12 个扇区, 覆盖 [0, 6KB)
    pub direct: [u32; DIRECT_COUNT],
    /// 一级间接索引块, 128 项, 覆盖 [6KB, 70KB)
    pub indirect: u32,
    /// 二级间接索引块, 每一项指向一个一级索引块, 再覆盖 128 * 64KB = 8MB
    pub double_indirect: u32,
    /// 文件内容的字节数
    pub length: u32,
    /// 非 0 表示目录
    pub is_dir: u32,
    pub magic: u32,
    unused: [u32; 111],
}

const _: () = assert!(std::mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    pub fn new(length: u32, is_dir: bool) -> Self {
        Self {
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            double_indirect: 0,
            length,
            is_dir: is_dir as u32,
            magic: INODE_MAGIC,
            unused: [0; 111],
        }
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }
}

impl Debug for DiskInode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("DiskInode")
            .field("direct", &self.direct)
            .field("indirect", &self.indirect)
            .field("double_indirect", &self.double_indirect)
            .field("length", &self.length)
            .field("is_dir", &self.is_dir())
            .field("magic", &self.magic)
            .finish()
    }
}

/// 容纳 size 字节的内容需要多少个数据扇区 (向上取整)
pub fn bytes_to_sectors(size: usize) -> usize {
    (size + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// 全 0 的扇区
pub(crate) const ZERO_SECTOR: DataBlock = [0; SECTOR_SIZE];

/// 一个空的 (全 0) 索引块
pub(crate) fn empty_index() -> IndexBlock {
    [0 as SectorId; INDIRECT_COUNT]
}
