//! 空闲扇区管理
//!
//! 存储核心只通过 [`Allocator`] 申请和归还扇区. 默认实现 [`FreeMap`] 是一张位图:
//! 每个 bit 代表设备上的一个扇区, 0 意味着空闲, 而 1 则意味着已经分配出去.
//!
//! 位图本身存放在超级块之后的若干扇区中, 每个扇区 512 bytes, 即 4096 bits,
//! 所有读写都经过块缓存层.

use std::sync::Arc;

use log::{debug, error};
use spin::Mutex;

use super::{bytes_to_sectors, BufferCache, FsError, FsResult, SectorId, SECTOR_BITS};

/// 空闲空间分配器
pub trait Allocator: Send + Sync {
    /// 分配 count 个扇区 (不要求连续). 要么全部成功, 要么什么都不分配.
    fn allocate(&self, count: usize) -> FsResult<Vec<SectorId>>;

    /// 归还从 sector 开始的连续 count 个扇区
    fn release(&self, sector: SectorId, count: usize) -> FsResult<()>;

    /// 剩余的空闲扇区数
    fn free_count(&self) -> FsResult<usize>;
}

/// 位图区域中的一个扇区解释为长度为 64 的 u64 数组,
/// 每个 u64 打包了一组 64 bits, 于是整个数组包含 64 * 64 = 4096 bits, 刚好占用一个扇区.
type BitmapBlock = [u64; 64];

pub struct FreeMap {
    cache: Arc<BufferCache>,
    /// 位图所在区域的起始扇区
    start_sector: SectorId,
    /// 位图占用的扇区数
    sectors: usize,
    /// 位图管理的设备扇区总数
    total: usize,
    /// 保证一次 allocate 的全有或全无
    lock: Mutex<()>,
}

impl FreeMap {
    pub fn new(
        cache: Arc<BufferCache>,
        start_sector: SectorId,
        sectors: usize,
        total: usize,
    ) -> Self {
        assert!(sectors * SECTOR_BITS >= total);
        Self {
            cache,
            start_sector,
            sectors,
            total,
            lock: Mutex::new(()),
        }
    }

    /// 管理 total 个扇区需要的位图扇区数
    pub fn sectors_for(total: usize) -> usize {
        bytes_to_sectors((total + 7) / 8)
    }

    /// 清空位图, 将 [0, reserved) (超级块与位图自身) 和超出设备的尾部标记为已使用
    pub fn format(&self, reserved: usize) -> FsResult<()> {
        let _guard = self.lock.lock();
        for i in 0..self.sectors {
            let base = i * SECTOR_BITS;
            self.cache.modify_as(
                self.start_sector + i as SectorId,
                0,
                |bitmap_block: &mut BitmapBlock| {
                    for (word_pos, word) in bitmap_block.iter_mut().enumerate() {
                        *word = 0;
                        for inner_pos in 0..64 {
                            let bit = base + word_pos * 64 + inner_pos;
                            if bit < reserved || bit >= self.total {
                                *word |= 1u64 << inner_pos;
                            }
                        }
                    }
                },
            )?;
        }
        debug!(
            "free map: formatted {} sector(s), {} reserved",
            self.total, reserved
        );
        Ok(())
    }

    /// 分配一个 bit
    ///
    /// 遍历区域中的每个扇区, 再在每个扇区中以 bit 组 (每组 64 bits) 为单位进行遍历,
    /// 找到一个尚未被全部分配出去的组, 最后在里面分配一个 bit.
    /// 如果所有 bit 均已经被分配出去了, 则返回 None.
    fn alloc_one(&self) -> FsResult<Option<SectorId>> {
        for i in 0..self.sectors {
            let sector = self.start_sector + i as SectorId;
            let found = self.cache.read_as(sector, 0, |bitmap_block: &BitmapBlock| {
                bitmap_block
                    .iter()
                    .enumerate()
                    .find(|(_, bits64)| **bits64 != u64::MAX)
                    // 通过 u64::trailing_ones 找到最低的一个 0 的位置
                    .map(|(bits64_pos, bits64)| (bits64_pos, bits64.trailing_ones() as usize))
            })?;
            if let Some((bits64_pos, inner_pos)) = found {
                self.cache
                    .modify_as(sector, 0, |bitmap_block: &mut BitmapBlock| {
                        bitmap_block[bits64_pos] |= 1u64 << inner_pos;
                    })?;
                return Ok(Some(
                    (i * SECTOR_BITS + bits64_pos * 64 + inner_pos) as SectorId,
                ));
            }
        }
        Ok(None)
    }

    fn clear_bit(&self, bit: SectorId) -> FsResult<()> {
        let (sector_pos, bits64_pos, inner_pos) = decomposition(bit as usize);
        assert!(sector_pos < self.sectors, "sector {} outside free map", bit);
        self.cache.modify_as(
            self.start_sector + sector_pos as SectorId,
            0,
            |bitmap_block: &mut BitmapBlock| {
                assert!(
                    bitmap_block[bits64_pos] & (1u64 << inner_pos) != 0,
                    "releasing free sector {}",
                    bit
                );
                bitmap_block[bits64_pos] &= !(1u64 << inner_pos);
            },
        )
    }
}

impl Allocator for FreeMap {
    fn allocate(&self, count: usize) -> FsResult<Vec<SectorId>> {
        let _guard = self.lock.lock();
        let mut taken = Vec::with_capacity(count);
        while taken.len() < count {
            let failure = match self.alloc_one() {
                Ok(Some(sector)) => {
                    taken.push(sector);
                    continue;
                }
                Ok(None) => FsError::AllocationExhausted { requested: count },
                Err(err) => err,
            };
            // 归还这一次已经拿到的扇区, 分配器状态保持不变
            for &sector in &taken {
                if let Err(err) = self.clear_bit(sector) {
                    error!("free map: rollback of sector {} failed: {}", sector, err);
                }
            }
            return Err(failure);
        }
        Ok(taken)
    }

    fn release(&self, sector: SectorId, count: usize) -> FsResult<()> {
        let _guard = self.lock.lock();
        for bit in sector..sector + count as SectorId {
            self.clear_bit(bit)?;
        }
        Ok(())
    }

    fn free_count(&self) -> FsResult<usize> {
        let _guard = self.lock.lock();
        let mut free = 0;
        for i in 0..self.sectors {
            free += self.cache.read_as(
                self.start_sector + i as SectorId,
                0,
                |bitmap_block: &BitmapBlock| {
                    bitmap_block
                        .iter()
                        .map(|bits64| bits64.count_zeros() as usize)
                        .sum::<usize>()
                },
            )?;
        }
        Ok(free)
    }
}

/// 将 bit 编号分解为区域中的扇区编号, 扇区内的组编号以及组内编号的三元组
fn decomposition(mut bit: usize) -> (usize, usize, usize) {
    let sector_pos = bit / SECTOR_BITS;
    bit %= SECTOR_BITS;
    (sector_pos, bit / 64, bit % 64)
}
