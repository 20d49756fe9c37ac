mod block_cache;
mod block_dev;
pub mod block_map;
mod error;
mod free_map;
#[allow(clippy::module_inception)]
mod fs;
mod layout;
mod vfs;

extern crate log;

/// 扇区 id; 0 同时充当 "未分配" 的索引项
pub type SectorId = u32;

/// Use a sector size of 512 bytes
pub const SECTOR_SIZE: usize = 512;
/// 块缓存的默认容量 (以扇区计)
pub const DEFAULT_CACHE_CAPACITY: usize = 64;
/// Magic number for inode record sanity check
pub const INODE_MAGIC: u32 = 0x494e_4f44;
/// Magic number for the superblock
pub const SUPER_MAGIC: u32 = 0x3b80_0001;
/// The number of direct pointers
pub const DIRECT_COUNT: usize = 12;
/// 一个索引块中可以存放的扇区 id 数量
pub const INDIRECT_COUNT: usize = SECTOR_SIZE / 4;
/// 二级间接索引能够覆盖的扇区数
pub const DOUBLE_INDIRECT_COUNT: usize = INDIRECT_COUNT * INDIRECT_COUNT;
/// The upper bound of direct sector index
pub const DIRECT_BOUND: usize = DIRECT_COUNT;
/// The upper bound of indirect sector index
pub const INDIRECT_BOUND: usize = DIRECT_BOUND + INDIRECT_COUNT;
/// The upper bound of double-indirect sector index
pub const DOUBLE_INDIRECT_BOUND: usize = INDIRECT_BOUND + DOUBLE_INDIRECT_COUNT;
/// 直接索引覆盖的字节范围 [0, 6KB)
pub const DIRECT_LIMIT: usize = DIRECT_BOUND * SECTOR_SIZE;
/// 一级间接索引覆盖到的字节上界 (70KB)
pub const INDIRECT_LIMIT: usize = INDIRECT_BOUND * SECTOR_SIZE;
/// 单个文件的最大长度
pub const MAX_FILE_SIZE: usize = DOUBLE_INDIRECT_BOUND * SECTOR_SIZE;
/// 每个扇区的 bit 数量
pub const SECTOR_BITS: usize = SECTOR_SIZE * 8;

pub use block_cache::{BufferCache, SlotRef};
pub use block_dev::BlockDevice;
pub use block_map::{BlockMap, MappedSectors, Position};
pub use error::{FsError, FsResult};
pub use free_map::{Allocator, FreeMap};
pub use fs::{mount, mounted, unmount, FileSystem};
pub use layout::{bytes_to_sectors, DiskInode, IndexBlock, SuperBlock};
pub use vfs::Inode;
