use crate::fs::{BlockDevice, SECTOR_SIZE};
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

pub struct BlockFile(pub Mutex<File>);

// std::file::File 由 Rust 标准库 std 提供，可以访问 Linux 上的一个文件。
// 我们将它包装成 BlockFile 类型来模拟一块磁盘，为它实现 BlockDevice 接口。
// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的，
// 在访问一个特定的扇区的时候，我们必须先 seek 到这个扇区的开头位置

impl BlockFile {
    pub fn new(file: File) -> Self {
        Self(Mutex::new(file))
    }
}

impl BlockDevice for BlockFile {
    /// 从文件读取一个扇区
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))?;
        // 不足一个扇区视为设备错误
        file.read_exact(&mut buf[..SECTOR_SIZE])
    }

    /// 写一个扇区到文件
    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))?;
        file.write_all(&buf[..SECTOR_SIZE])
    }
}

/// 内存中的虚拟磁盘, 记录真实发生的设备读写次数
pub struct RamDisk {
    sectors: spin::Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(total_sectors: usize) -> Self {
        Self {
            sectors: spin::Mutex::new(vec![[0u8; SECTOR_SIZE]; total_sectors]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 设备读次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// 设备写次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 绕过缓存直接查看磁盘上的扇区内容
    pub fn peek(&self, block_id: usize) -> [u8; SECTOR_SIZE] {
        self.sectors.lock()[block_id]
    }

    fn out_of_range(block_id: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("sector {} out of range", block_id),
        )
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        let sectors = self.sectors.lock();
        let sector = sectors
            .get(block_id)
            .ok_or_else(|| Self::out_of_range(block_id))?;
        buf[..SECTOR_SIZE].copy_from_slice(sector);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        let mut sectors = self.sectors.lock();
        let sector = sectors
            .get_mut(block_id)
            .ok_or_else(|| Self::out_of_range(block_id))?;
        sector.copy_from_slice(&buf[..SECTOR_SIZE]);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
