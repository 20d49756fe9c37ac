//! 卷: 将块缓存, 空闲扇区分配器和打开的 inode 表整合在一起
//!
//! [`FileSystem`] 知道超级块和空闲位图所在的位置, 扇区的分配和回收都要经过它才能完成.
//!
//! 磁盘布局: Super Block(0) -> Free Map Sectors -> Inode Records / Index Blocks / Data Blocks
//!
//! 从这一层开始, 打开的 inode 以 [`Inode`] 的形式放在内存上, 按 inode 所在扇区登记,
//! 同一扇区的多次打开共享同一个实例.

use std::{collections::BTreeMap, sync::Arc};

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use spin::{Mutex, MutexGuard};

use super::{
    block_map::BlockMap, layout::ZERO_SECTOR, Allocator, BlockDevice, BufferCache, DiskInode,
    FreeMap, FsError, FsResult, Inode, SectorId, SuperBlock, MAX_FILE_SIZE,
};

/// 文件系统 (扇区管理器)
pub struct FileSystem {
    /// 所有扇区访问都经过的块缓存
    cache: Arc<BufferCache>,
    /// 空闲扇区分配器
    allocator: Arc<dyn Allocator>,
    /// 打开的 inode 表: inode 扇区 -> 共享实例
    open_inodes: Mutex<BTreeMap<SectorId, Arc<Inode>>>,
    /// 从扇区 0 读到的超级块, 通过 with_allocator 构造的卷没有超级块
    super_block: Option<SuperBlock>,
}

impl FileSystem {
    /// 在块设备上创建并初始化一个卷
    pub fn format(
        device: Arc<dyn BlockDevice>,
        total_sectors: u32,
        cache_capacity: usize,
    ) -> FsResult<Arc<Self>> {
        let free_map_sectors = FreeMap::sectors_for(total_sectors as usize);
        // 超级块 + 位图
        let reserved = 1 + free_map_sectors;
        if reserved >= total_sectors as usize {
            return Err(FsError::OutOfRange {
                sector: reserved as SectorId,
                total: total_sectors,
            });
        }

        let cache = Arc::new(BufferCache::new(device, cache_capacity));

        // 元数据区域清零, 整扇区写入不会读盘
        for sector in 0..reserved {
            cache.write(sector as SectorId, 0, &ZERO_SECTOR)?;
        }

        let formatted_at = chrono::Utc::now().timestamp();
        let mut super_block = None;
        cache
            .get(0, true)?
            .modify(0, |sb: &mut SuperBlock| {
                sb.initialize(total_sectors, 1, free_map_sectors as u32, formatted_at);
                super_block = Some(*sb);
            });

        let free_map = FreeMap::new(cache.clone(), 1, free_map_sectors, total_sectors as usize);
        free_map.format(reserved)?;

        cache.flush_all()?;
        info!(
            "format: {} sector(s), free map {} sector(s), {} free",
            total_sectors,
            free_map_sectors,
            free_map.free_count()?
        );

        Ok(Arc::new(Self {
            cache,
            allocator: Arc::new(free_map),
            open_inodes: Mutex::new(BTreeMap::new()),
            super_block,
        }))
    }

    /// 从一个已经格式化过的块设备上打开卷
    pub fn open(device: Arc<dyn BlockDevice>, cache_capacity: usize) -> FsResult<Arc<Self>> {
        let cache = Arc::new(BufferCache::new(device, cache_capacity));
        // 读超级块: 超级块的扇区 id 为 0
        let super_block = cache.read_as(0, 0, |sb: &SuperBlock| *sb)?;
        if !super_block.is_valid() {
            error!("open: bad superblock {:?}", super_block);
            return Err(FsError::BadSuperBlock);
        }
        debug!("open: {:?}", super_block);

        let free_map = FreeMap::new(
            cache.clone(),
            super_block.free_map_start,
            super_block.free_map_sectors as usize,
            super_block.total_sectors as usize,
        );
        Ok(Arc::new(Self {
            cache,
            allocator: Arc::new(free_map),
            open_inodes: Mutex::new(BTreeMap::new()),
            super_block: Some(super_block),
        }))
    }

    /// 在任意的缓存与分配器之上构造卷, 不读写超级块
    pub fn with_allocator(cache: Arc<BufferCache>, allocator: Arc<dyn Allocator>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            allocator,
            open_inodes: Mutex::new(BTreeMap::new()),
            super_block: None,
        })
    }

    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn super_block(&self) -> Option<SuperBlock> {
        self.super_block
    }

    pub fn free_count(&self) -> FsResult<usize> {
        self.allocator.free_count()
    }

    pub(crate) fn block_map(&self) -> BlockMap<'_> {
        BlockMap::new(&self.cache, self.allocator.as_ref())
    }

    /// 为新的 inode 记录分配一个扇区
    pub fn alloc_inode_sector(&self) -> FsResult<SectorId> {
        let sectors = self.allocator.allocate(1)?;
        Ok(sectors[0])
    }

    /// 在 sector 处创建一个长度为 length 的 inode, 数据扇区一次性分配并清零.
    ///
    /// 超出最大文件长度或分配失败时返回错误, 分配器状态保持不变.
    pub fn create_inode(&self, sector: SectorId, length: usize, is_dir: bool) -> FsResult<()> {
        if length > MAX_FILE_SIZE {
            warn!(
                "create: inode {} length {} exceeds {}",
                sector, length, MAX_FILE_SIZE
            );
            return Err(FsError::SizeLimitExceeded {
                requested: length,
                max: MAX_FILE_SIZE,
            });
        }
        let mut record = DiskInode::new(length as u32, is_dir);
        self.block_map().populate(&mut record, length)?;
        if let Err(err) = self.write_record(sector, &record) {
            self.block_map().release(&mut record)?;
            return Err(err);
        }
        debug!("create: inode {} length {} dir {}", sector, length, is_dir);
        Ok(())
    }

    /// 打开 sector 处的 inode. 已经打开的 inode 直接共享, 打开计数加一.
    pub fn open_inode(self: &Arc<Self>, sector: SectorId) -> FsResult<Arc<Inode>> {
        if let Some(sb) = &self.super_block {
            if sector >= sb.total_sectors {
                return Err(FsError::OutOfRange {
                    sector,
                    total: sb.total_sectors,
                });
            }
        }
        // 读记录时持有打开表的锁: 被删除的 inode 在记录清零之前一直以墓碑的形式留在表中,
        // 所以这里读到的有效记录不可能属于一个正在归还的 inode
        let mut open_inodes = self.open_inodes.lock();
        if let Some(inode) = open_inodes.get(&sector) {
            if !inode.pin_open() {
                debug!("open: inode {} is being released", sector);
                return Err(FsError::Released { sector });
            }
            return Ok(inode.clone());
        }

        let record = self.cache.read_as(sector, 0, |d: &DiskInode| d.clone())?;
        if !record.is_valid() {
            error!(
                "open: inode {} has bad magic {:#x}",
                sector, record.magic
            );
            return Err(FsError::Corrupted {
                sector,
                magic: record.magic,
            });
        }
        let inode = Arc::new(Inode::new(sector, Arc::clone(self), record));
        open_inodes.insert(sector, inode.clone());
        debug!("open: inode {}", sector);
        Ok(inode)
    }

    /// 打开表. 锁顺序: 先打开表, 再 inode 的元数据锁, 再缓存槽位.
    pub(crate) fn open_inodes(&self) -> MutexGuard<'_, BTreeMap<SectorId, Arc<Inode>>> {
        self.open_inodes.lock()
    }

    /// 当前打开的 inode 数量
    pub fn open_inode_count(&self) -> usize {
        self.open_inodes.lock().len()
    }

    /// 通过缓存把 inode 记录写到 sector, 整扇区覆盖
    pub(crate) fn write_record(&self, sector: SectorId, record: &DiskInode) -> FsResult<()> {
        self.cache
            .get(sector, true)?
            .modify(0, |d: &mut DiskInode| *d = record.clone());
        Ok(())
    }

    /// 写回缓存中所有的脏扇区
    pub fn flush_all(&self) -> FsResult<usize> {
        self.cache.flush_all()
    }

    /// 卸载前的最后一次写回
    pub fn close(&self) -> FsResult<()> {
        let still_open: Vec<SectorId> = self.open_inodes.lock().keys().copied().collect();
        if !still_open.is_empty() {
            warn!("close: inode(s) {:?} are still open", still_open);
        }
        let flushed = self.flush_all()?;
        info!("close: flushed {} sector(s)", flushed);
        Ok(())
    }
}

lazy_static! {
    /// 进程内唯一的挂载点
    static ref MOUNT_POINT: Mutex<Option<Arc<FileSystem>>> = Mutex::new(None);
}

/// 挂载卷, 返回之前挂载的卷 (如果有)
pub fn mount(fs: Arc<FileSystem>) -> Option<Arc<FileSystem>> {
    MOUNT_POINT.lock().replace(fs)
}

/// 当前挂载的卷
pub fn mounted() -> Option<Arc<FileSystem>> {
    MOUNT_POINT.lock().clone()
}

/// 卸载当前的卷, 并执行最后一次写回
pub fn unmount() -> FsResult<()> {
    let fs = MOUNT_POINT.lock().take();
    match fs {
        Some(fs) => fs.close(),
        None => Ok(()),
    }
}
