//! 地址翻译: 文件内字节偏移 -> 设备扇区
//!
//! 三级索引:
//! - 直接索引 `direct[12]`, 覆盖 [0, 6KB)
//! - 一级间接索引 `indirect`, 覆盖 [6KB, 70KB)
//! - 二级间接索引 `double_indirect`, 覆盖 [70KB, 70KB + 8MB)
//!
//! 在任意一级已分配的索引中, 0 (未分配) 项不会出现在非 0 项之前.
//! 写路径扩展文件时, 从目标项向前回溯, 把目标之前所有缺失的项一起分配 (backfill),
//! 于是已分配的扇区总是文件开头的一段连续前缀.
//!
//! 索引块的读写都经过块缓存. 写路径要求调用者持有 inode 的内容写锁.

use log::{debug, error};

use super::{
    bytes_to_sectors,
    layout::{empty_index, ZERO_SECTOR},
    Allocator, BufferCache, DiskInode, FsError, FsResult, IndexBlock, SectorId, DIRECT_BOUND,
    DIRECT_COUNT, INDIRECT_BOUND, INDIRECT_COUNT, MAX_FILE_SIZE, SECTOR_SIZE,
};

/// 字节偏移在三级索引中的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    /// direct[i]
    Direct(usize),
    /// indirect 索引块的第 i 项
    Indirect(usize),
    /// double_indirect 索引块的第 outer 项所指一级索引块的第 inner 项
    DoubleIndirect(usize, usize),
}

/// 计算 offset 所在的索引位置; 超出最大文件长度时返回 None
pub fn locate(offset: usize) -> Option<Position> {
    if offset >= MAX_FILE_SIZE {
        return None;
    }
    let index = offset / SECTOR_SIZE;
    Some(if index < DIRECT_BOUND {
        Position::Direct(index)
    } else if index < INDIRECT_BOUND {
        Position::Indirect(index - DIRECT_BOUND)
    } else {
        let last = index - INDIRECT_BOUND;
        Position::DoubleIndirect(last / INDIRECT_COUNT, last % INDIRECT_COUNT)
    })
}

/// 容纳 data 个数据扇区总共需要多少扇区 (数据扇区加上索引块)
pub fn total_sectors(data: usize) -> usize {
    let mut total = data;
    if data > DIRECT_BOUND {
        // 一级索引
        total += 1;
    }
    if data > INDIRECT_BOUND {
        // 二级索引及其下挂的一级子索引
        total += 1;
        total += (data - INDIRECT_BOUND + INDIRECT_COUNT - 1) / INDIRECT_COUNT;
    }
    total
}

/// 一个 inode 占用的全部扇区
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MappedSectors {
    /// 按文件内顺序排列的数据扇区
    pub data: Vec<SectorId>,
    /// 索引块 (一级, 二级及其子索引)
    pub index: Vec<SectorId>,
}

/// 在块缓存与分配器之上进行地址翻译和扩展
pub struct BlockMap<'a> {
    cache: &'a BufferCache,
    allocator: &'a dyn Allocator,
}

impl<'a> BlockMap<'a> {
    pub fn new(cache: &'a BufferCache, allocator: &'a dyn Allocator) -> Self {
        Self { cache, allocator }
    }

    /// 只读翻译: 返回 offset 所在的数据扇区, 未分配时返回 None
    pub fn lookup(&self, record: &DiskInode, offset: usize) -> FsResult<Option<SectorId>> {
        let sector = match locate(offset) {
            None => 0,
            Some(Position::Direct(i)) => record.direct[i],
            Some(Position::Indirect(i)) => match record.indirect {
                0 => 0,
                indirect => self.entry(indirect, i)?,
            },
            Some(Position::DoubleIndirect(outer, inner)) => match record.double_indirect {
                0 => 0,
                top => match self.entry(top, outer)? {
                    0 => 0,
                    mid => self.entry(mid, inner)?,
                },
            },
        };
        Ok((sector != 0).then_some(sector))
    }

    /// 翻译 offset. for_write 为真时, 缺失的扇区 (以及它之前所有缺失的扇区) 会被分配并清零.
    ///
    /// 分配失败返回 [`FsError::AllocationExhausted`], 已经完成的分配保留在 record 中,
    /// 不会破坏 "没有空洞" 的性质.
    pub fn translate(
        &self,
        record: &mut DiskInode,
        offset: usize,
        for_write: bool,
    ) -> FsResult<Option<SectorId>> {
        if !for_write {
            return self.lookup(record, offset);
        }
        let sector = match locate(offset) {
            None => return Ok(None),
            Some(Position::Direct(i)) => self.ensure_direct(record, i)?,
            Some(Position::Indirect(i)) => self.ensure_indirect(record, i)?,
            Some(Position::DoubleIndirect(outer, inner)) => {
                self.ensure_double_indirect(record, outer, inner)?
            }
        };
        Ok(Some(sector))
    }

    /// 创建时一次性分配 length 字节所需的全部扇区, 并按索引顺序填入三级索引.
    ///
    /// 先向分配器申请全部扇区 (数据与索引块), 分配失败时不会留下任何部分分配.
    pub fn populate(&self, record: &mut DiskInode, length: usize) -> FsResult<()> {
        if length > MAX_FILE_SIZE {
            return Err(FsError::SizeLimitExceeded {
                requested: length,
                max: MAX_FILE_SIZE,
            });
        }
        let data_sectors = bytes_to_sectors(length);
        let total = total_sectors(data_sectors);
        if total == 0 {
            return Ok(());
        }
        let allocated = self.allocator.allocate(total)?;
        debug!(
            "block map: populate {} data + {} index sector(s)",
            data_sectors,
            total - data_sectors
        );
        let result = self.fill(record, data_sectors, allocated.iter().copied());
        if let Err(err) = result {
            error!("block map: populate failed, releasing {} sector(s)", total);
            *record = DiskInode::new(record.length, record.is_dir());
            for &sector in &allocated {
                self.allocator.release(sector, 1)?;
            }
            return Err(err);
        }
        Ok(())
    }

    /// 列出 record 占用的全部扇区, 沿着每一级的已分配前缀走到第一个 0 项为止
    pub fn mapped(&self, record: &DiskInode) -> FsResult<MappedSectors> {
        let mut mapped = MappedSectors::default();
        mapped
            .data
            .extend(record.direct.iter().copied().take_while(|&s| s != 0));
        if record.indirect != 0 {
            mapped.index.push(record.indirect);
            let block = self.read_index(record.indirect)?;
            mapped
                .data
                .extend(block.iter().copied().take_while(|&s| s != 0));
        }
        if record.double_indirect != 0 {
            mapped.index.push(record.double_indirect);
            let top = self.read_index(record.double_indirect)?;
            for &mid in top.iter().take_while(|&&s| s != 0) {
                mapped.index.push(mid);
                let block = self.read_index(mid)?;
                mapped
                    .data
                    .extend(block.iter().copied().take_while(|&s| s != 0));
            }
        }
        Ok(mapped)
    }

    /// 归还 record 占用的全部数据扇区与索引块, 返回归还的扇区数.
    ///
    /// 按已分配前缀回收, 因此覆盖 bytes_to_sectors(length) 个数据扇区,
    /// 也包括写入失败时已经扩展出来但未计入长度的扇区.
    pub fn release(&self, record: &mut DiskInode) -> FsResult<usize> {
        let mapped = self.mapped(record)?;
        debug_assert!(mapped.data.len() >= bytes_to_sectors(record.length as usize));
        for &sector in mapped.data.iter().chain(mapped.index.iter()) {
            self.allocator.release(sector, 1)?;
        }
        record.direct = [0; DIRECT_COUNT];
        record.indirect = 0;
        record.double_indirect = 0;
        Ok(mapped.data.len() + mapped.index.len())
    }

    fn fill(
        &self,
        record: &mut DiskInode,
        data_sectors: usize,
        mut sectors: impl Iterator<Item = SectorId>,
    ) -> FsResult<()> {
        let mut next = || sectors.next().expect("populate allocated too few sectors");
        let mut data = Vec::with_capacity(data_sectors);

        // 填充直接索引
        let direct = data_sectors.min(DIRECT_COUNT);
        for entry in record.direct.iter_mut().take(direct) {
            *entry = next();
            data.push(*entry);
        }
        let mut remaining = data_sectors - direct;

        // 填充一级索引
        if remaining > 0 {
            record.indirect = next();
            let mut block = empty_index();
            let count = remaining.min(INDIRECT_COUNT);
            for entry in block.iter_mut().take(count) {
                *entry = next();
                data.push(*entry);
            }
            self.write_index(record.indirect, &block)?;
            remaining -= count;
        }

        // 填充二级索引
        if remaining > 0 {
            record.double_indirect = next();
            let mut top = empty_index();
            for slot in top.iter_mut() {
                if remaining == 0 {
                    break;
                }
                *slot = next();
                let mut block = empty_index();
                let count = remaining.min(INDIRECT_COUNT);
                for entry in block.iter_mut().take(count) {
                    *entry = next();
                    data.push(*entry);
                }
                self.write_index(*slot, &block)?;
                remaining -= count;
            }
            self.write_index(record.double_indirect, &top)?;
        }

        for sector in data {
            self.cache.write(sector, 0, &ZERO_SECTOR)?;
        }
        Ok(())
    }

    /// 第一阶段: 直接索引
    fn ensure_direct(&self, record: &mut DiskInode, index: usize) -> FsResult<SectorId> {
        self.backfill(&mut record.direct, index)?;
        Ok(record.direct[index])
    }

    /// 第二阶段: 一级间接索引. 首次分配 indirect 时先填满直接索引.
    fn ensure_indirect(&self, record: &mut DiskInode, index: usize) -> FsResult<SectorId> {
        if record.indirect == 0 {
            self.ensure_direct(record, DIRECT_COUNT - 1)?;
            record.indirect = self.allocate_zeroed(1)?[0];
            debug!("block map: indirect block at sector {}", record.indirect);
        }
        self.ensure_entry(record.indirect, index)
    }

    /// 第三阶段: 二级间接索引. 首次分配 double_indirect 时先填满一级索引;
    /// 目标之前的一级子索引块都会被填满.
    fn ensure_double_indirect(
        &self,
        record: &mut DiskInode,
        outer: usize,
        inner: usize,
    ) -> FsResult<SectorId> {
        if record.double_indirect == 0 {
            self.ensure_indirect(record, INDIRECT_COUNT - 1)?;
            record.double_indirect = self.allocate_zeroed(1)?[0];
            debug!(
                "block map: double indirect block at sector {}",
                record.double_indirect
            );
        }
        let mut top = self.read_index(record.double_indirect)?;
        if top[outer] == 0 {
            let mut first = outer;
            while first > 0 && top[first - 1] == 0 {
                first -= 1;
            }
            // 游标从前沿一直走到目标, 中途失败也要把已经挂上的子索引块写回
            let grown = self.grow_double_indirect(&mut top, first, outer);
            self.write_index(record.double_indirect, &top)?;
            grown?;
        }
        self.ensure_entry(top[outer], inner)
    }

    fn grow_double_indirect(
        &self,
        top: &mut IndexBlock,
        first: usize,
        outer: usize,
    ) -> FsResult<()> {
        // 前沿之前的那个子索引块可能只填了一部分
        if first > 0 {
            self.ensure_entry(top[first - 1], INDIRECT_COUNT - 1)?;
        }
        for cursor in first..=outer {
            top[cursor] = self.allocate_zeroed(1)?[0];
            if cursor < outer {
                self.ensure_entry(top[cursor], INDIRECT_COUNT - 1)?;
            }
        }
        Ok(())
    }

    /// 确保索引块 block_sector 的 [0, index] 项都已分配
    fn ensure_entry(&self, block_sector: SectorId, index: usize) -> FsResult<SectorId> {
        let mut block = self.read_index(block_sector)?;
        if block[index] == 0 {
            self.backfill(&mut block, index)?;
            self.write_index(block_sector, &block)?;
        }
        Ok(block[index])
    }

    /// 从 index 向前回溯到第一个非 0 项 (或下标 0), 把这一段缺失的项一起分配
    fn backfill(&self, entries: &mut [SectorId], index: usize) -> FsResult<()> {
        if entries[index] != 0 {
            return Ok(());
        }
        let mut first = index;
        while first > 0 && entries[first - 1] == 0 {
            first -= 1;
        }
        let sectors = self.allocate_zeroed(index - first + 1)?;
        entries[first..=index].copy_from_slice(&sectors);
        Ok(())
    }

    /// 分配 count 个扇区并通过缓存清零
    fn allocate_zeroed(&self, count: usize) -> FsResult<Vec<SectorId>> {
        let sectors = self.allocator.allocate(count)?;
        for &sector in &sectors {
            if let Err(err) = self.cache.write(sector, 0, &ZERO_SECTOR) {
                // 尚未挂入索引, 直接归还
                for &sector in &sectors {
                    self.allocator.release(sector, 1)?;
                }
                return Err(err);
            }
        }
        Ok(sectors)
    }

    fn entry(&self, block_sector: SectorId, index: usize) -> FsResult<SectorId> {
        self.cache
            .read_as(block_sector, 0, |block: &IndexBlock| block[index])
    }

    fn read_index(&self, block_sector: SectorId) -> FsResult<IndexBlock> {
        self.cache.read_as(block_sector, 0, |block: &IndexBlock| *block)
    }

    fn write_index(&self, block_sector: SectorId, block: &IndexBlock) -> FsResult<()> {
        // 整个索引块被覆盖, 不需要预先读盘
        self.cache
            .get(block_sector, true)?
            .modify(0, |dst: &mut IndexBlock| *dst = *block);
        Ok(())
    }
}
