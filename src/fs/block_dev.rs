//! 块设备仅支持以扇区为单位进行随机读写, 需要由具体的块设备驱动来实现这两个方法.
//! 块缓存层会调用这两个方法, 进行块缓存的管理.
//! 泛用性: 可以访问实现了 BlockDevice Trait 的块设备驱动程序.

use std::{any::Any, io};

// 块设备接口层
// 定义设备驱动需要实现的扇区读写接口 BlockDevice trait.
// 本层不做重试: 设备错误原样交给调用者.

pub trait BlockDevice: Send + Sync + Any {
    /// 将编号为 block_id 的扇区从磁盘读入内存中的缓冲区 buf
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()>;

    /// 将内存中的缓冲区 buf 中的数据写入磁盘编号为 block_id 的扇区
    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()>;
}
