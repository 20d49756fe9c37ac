//! 教学操作系统的存储核心: 定长扇区之上的块缓存与多级索引 inode.
//!
//! - [`fs::BufferCache`]: 固定容量的扇区缓存, 时钟 (second-chance) 替换
//! - [`fs::block_map`]: 直接 / 一级间接 / 二级间接 三级地址翻译
//! - [`fs::Inode`]: 打开文件句柄, 同一扇区的多次打开共享同一个实例
//! - [`fs::FileSystem`]: 卷的格式化, 挂载与卸载

pub mod device;
pub mod fs;

#[cfg(test)]
mod test;
