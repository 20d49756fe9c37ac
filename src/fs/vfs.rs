//! FileSystem 负责扇区的分配与登记, 但对于使用者 (目录层) 而言,
//! 他们更希望直接对一个个文件进行读写.
//! 为此设计索引节点 Inode 暴露给使用者.
//!
//! DiskInode 放在磁盘上 inode 所在的扇区中, 而 Inode 是放在内存中的记录 inode 信息的数据结构.
//! 同一扇区的 inode 在内存中只有一个实例, 由所有打开者共享, 最后一个关闭者负责收尾.

use std::sync::Arc;

use log::{debug, warn};
use spin::{Mutex, RwLock};

use super::{
    block_map::MappedSectors, layout::ZERO_SECTOR, DiskInode, FileSystem, FsError, FsResult,
    SectorId, MAX_FILE_SIZE, SECTOR_SIZE,
};

/// 受元数据锁保护的字段, 持锁时间很短, 不会等待内容读写
struct InodeMeta {
    /// 文件内容的字节数
    length: usize,
    /// 打开计数
    open_count: usize,
    /// 已被删除, 最后一次关闭时归还扇区
    removed: bool,
    /// 大于 0 时拒绝写入
    deny_write_count: usize,
}

pub struct Inode {
    /// inode 记录所在的扇区
    sector: SectorId,
    is_dir: bool,
    fs: Arc<FileSystem>,
    /// 内存中的 inode 记录. 读者之间可以并发, 写者 (包括扩展文件的写者) 独占
    content: RwLock<DiskInode>,
    meta: Mutex<InodeMeta>,
}

impl Inode {
    pub(crate) fn new(sector: SectorId, fs: Arc<FileSystem>, record: DiskInode) -> Self {
        Self {
            sector,
            is_dir: record.is_dir(),
            fs,
            meta: Mutex::new(InodeMeta {
                length: record.length as usize,
                open_count: 1,
                removed: false,
                deny_write_count: 0,
            }),
            content: RwLock::new(record),
        }
    }

    /// 打开计数加一, 由打开表在持有表锁时调用.
    ///
    /// 计数已经归零的实例是正在归还扇区的墓碑, 不能再被打开, 返回 false.
    pub(crate) fn pin_open(&self) -> bool {
        let mut meta = self.meta.lock();
        if meta.open_count == 0 {
            return false;
        }
        meta.open_count += 1;
        true
    }

    /// inode 编号, 即记录所在的扇区
    pub fn inumber(&self) -> SectorId {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn length(&self) -> usize {
        self.meta.lock().length
    }

    pub fn open_count(&self) -> usize {
        self.meta.lock().open_count
    }

    pub fn is_removed(&self) -> bool {
        self.meta.lock().removed
    }

    /// 内存中 inode 记录的拷贝
    pub fn record(&self) -> DiskInode {
        let mut record = self.content.read().clone();
        record.length = self.length() as u32;
        record
    }

    /// 文件占用的全部数据扇区与索引块
    pub fn mapped(&self) -> FsResult<MappedSectors> {
        let record = self.content.read();
        self.fs.block_map().mapped(&record)
    }

    /// 再次打开, 返回共享的句柄
    pub fn reopen(self: &Arc<Self>) -> Arc<Self> {
        assert!(self.pin_open(), "inode {} reopened after close", self.sector);
        Arc::clone(self)
    }

    /// 从 offset 开始读取最多 buf.len() 字节, 返回实际读到的字节数. 读到文件末尾时停止.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> FsResult<usize> {
        let record = self.content.read();
        let length = self.length();
        let map = self.fs.block_map();
        let cache = self.fs.cache();

        let mut pos = offset;
        let mut read_size = 0usize;
        while read_size < buf.len() && pos < length {
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - read_size)
                .min(length - pos)
                .min(SECTOR_SIZE - sector_ofs);
            let dst = &mut buf[read_size..read_size + chunk];
            match map.lookup(&record, pos)? {
                Some(sector) => cache.read(sector, sector_ofs, dst)?,
                // 长度之内但尚未分配的扇区读作 0
                None => dst.fill(0),
            }
            pos += chunk;
            read_size += chunk;
        }
        Ok(read_size)
    }

    /// 从 offset 开始写入 buf, 写到当前长度之外时扩展文件. 返回实际写入的字节数.
    ///
    /// 拒绝写入时返回 0. 分配器耗尽或到达最大文件长度时停止, 返回已写入的字节数 (短写).
    pub fn write_at(&self, buf: &[u8], offset: usize) -> FsResult<usize> {
        // 持有内容写锁之后再检查, 等锁期间到来的 deny_write 同样生效
        let mut record = self.content.write();
        if self.meta.lock().deny_write_count > 0 {
            debug!("write: inode {} is write-denied", self.sector);
            return Ok(0);
        }
        let before = (record.direct, record.indirect, record.double_indirect);

        let mut pos = offset;
        let mut write_size = 0usize;
        let result = self.write_chunks(&mut record, buf, &mut pos, &mut write_size);
        if write_size < buf.len() && result.is_ok() {
            warn!(
                "write: inode {} short write {} of {} byte(s) at {}",
                self.sector,
                write_size,
                buf.len(),
                offset
            );
        }

        // 即使中途出错, 已经写入的部分和已经挂上的扇区也要记下来
        let grown = {
            let mut meta = self.meta.lock();
            if write_size > 0 && pos > meta.length {
                meta.length = pos;
                true
            } else {
                false
            }
        };
        if grown || before != (record.direct, record.indirect, record.double_indirect) {
            self.persist(&mut record)?;
        }
        result.map(|_| write_size)
    }

    fn write_chunks(
        &self,
        record: &mut DiskInode,
        buf: &[u8],
        pos: &mut usize,
        write_size: &mut usize,
    ) -> FsResult<()> {
        let map = self.fs.block_map();
        let cache = self.fs.cache();
        while *write_size < buf.len() && *pos < MAX_FILE_SIZE {
            let sector_ofs = *pos % SECTOR_SIZE;
            let chunk = (buf.len() - *write_size).min(SECTOR_SIZE - sector_ofs);
            let sector = match map.translate(record, *pos, true) {
                Ok(Some(sector)) => sector,
                Ok(None) => break,
                Err(FsError::AllocationExhausted { requested }) => {
                    debug!(
                        "write: inode {} growth needs {} more sector(s), allocator exhausted",
                        self.sector, requested
                    );
                    break;
                }
                Err(err) => return Err(err),
            };
            cache.write(sector, sector_ofs, &buf[*write_size..*write_size + chunk])?;
            *pos += chunk;
            *write_size += chunk;
        }
        Ok(())
    }

    /// 修改逻辑长度, 只能在已分配的扇区范围之内.
    ///
    /// 缩短时把 [length, 原长度) 清零, 之后越过末尾的写入只会让这段读出 0.
    pub fn set_length(&self, length: usize) -> FsResult<()> {
        let mut record = self.content.write();
        let capacity = self.fs.block_map().mapped(&record)?.data.len() * SECTOR_SIZE;
        if length > capacity {
            return Err(FsError::SizeLimitExceeded {
                requested: length,
                max: capacity,
            });
        }
        let old_length = self.length();
        if length < old_length {
            self.zero_range(&record, length, old_length.min(capacity))?;
        }
        self.meta.lock().length = length;
        self.persist(&mut record)
    }

    fn zero_range(&self, record: &DiskInode, start: usize, end: usize) -> FsResult<()> {
        let map = self.fs.block_map();
        let cache = self.fs.cache();
        let mut pos = start;
        while pos < end {
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (end - pos).min(SECTOR_SIZE - sector_ofs);
            if let Some(sector) = map.lookup(record, pos)? {
                cache.write(sector, sector_ofs, &ZERO_SECTOR[..chunk])?;
            }
            pos += chunk;
        }
        Ok(())
    }

    /// 将内存中的记录 (连同最新长度) 经缓存写回 inode 扇区
    fn persist(&self, record: &mut DiskInode) -> FsResult<()> {
        record.length = self.length() as u32;
        self.fs.write_record(self.sector, record)
    }

    /// 标记删除, 扇区在最后一次关闭时归还
    pub fn remove(&self) {
        self.meta.lock().removed = true;
        debug!("remove: inode {}", self.sector);
    }

    /// 禁止写入, 每个打开者至多调用一次
    pub fn deny_write(&self) {
        let mut meta = self.meta.lock();
        meta.deny_write_count += 1;
        assert!(meta.deny_write_count <= meta.open_count);
    }

    /// 撤销一次 deny_write, 必须与之前的 deny_write 配对
    pub fn allow_write(&self) {
        let mut meta = self.meta.lock();
        assert!(meta.deny_write_count > 0, "allow_write without deny_write");
        assert!(meta.deny_write_count <= meta.open_count);
        meta.deny_write_count -= 1;
    }

    /// 关闭一个句柄.
    ///
    /// 先把记录写回缓存, 再减少打开计数. 最后一个关闭者负责收尾:
    /// 未删除的 inode 从打开表中摘下, 只写回 inode 自己的扇区;
    /// 被删除的 inode 作为墓碑 (打开计数为 0) 留在打开表中, 直到记录清零, 扇区全部归还.
    /// 在此期间打开这个扇区会失败, 不会读到仍然有效的旧记录.
    pub fn close(self: Arc<Self>) -> FsResult<()> {
        {
            let mut record = self.content.write();
            self.persist(&mut record)?;
        }

        let (last, removed) = {
            let mut open_inodes = self.fs.open_inodes();
            let mut meta = self.meta.lock();
            assert!(meta.open_count > 0, "inode {} closed too often", self.sector);
            meta.open_count -= 1;
            let last = meta.open_count == 0;
            if last && !meta.removed {
                open_inodes.remove(&self.sector);
            }
            (last, meta.removed)
        };
        if !last {
            return Ok(());
        }

        if removed {
            // 归还失败时墓碑保留, 这个扇区不会再被打开
            self.release()?;
            self.fs.open_inodes().remove(&self.sector);
            Ok(())
        } else {
            self.fs.cache().flush_sector(self.sector)?;
            debug!("close: inode {}", self.sector);
            Ok(())
        }
    }

    /// 归还数据扇区, 索引块以及 inode 自己的扇区
    fn release(&self) -> FsResult<()> {
        let mut record = self.content.write();
        let freed = self.fs.block_map().release(&mut record)?;
        // 清掉魔数, 之后再打开这个扇区会被拒绝
        self.fs.cache().write(self.sector, 0, &ZERO_SECTOR)?;
        self.fs.allocator().release(self.sector, 1)?;
        debug!(
            "close: inode {} removed, released {} sector(s)",
            self.sector,
            freed + 1
        );
        Ok(())
    }
}
