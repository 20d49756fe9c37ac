//! 块缓存层: 在内存中缓存磁盘扇区的数据, 避免频繁读写磁盘
//!
//! 缓存由固定数量的槽位 [`CacheSlot`] 组成, 每个槽位持有恰好一个扇区大小的缓冲区.
//! 所有槽位按环形顺序排列 (时钟算法的 "表盘"), 另有一张 扇区 -> 槽位 的哈希表用于 O(1) 查找.
//!
//! 三层锁:
//! - 全局结构锁 (`index`): 保护查找表与环的旋转, 只做 O(1) 的簿记, 绝不跨越设备 I/O
//! - 槽位状态锁 (`state`): 保护绑定的扇区, 状态位与引用计数; 引用计数归零时通过条件变量唤醒等待者
//! - 槽位读写锁 (`data`): 保护缓冲区内容, 允许并发读, 写者独占
//!
//! 引用计数不为零的槽位不会被选为替换对象, 也不会被写回, 直到计数归零.
//! 脏槽位在被重新分配给别的扇区之前一定会先写回磁盘.

use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::{Arc, Condvar, Mutex as StdMutex, MutexGuard, PoisonError},
};

use log::{error, trace, warn};
use spin::{Mutex, RwLock};

use super::{BlockDevice, FsResult, SectorId, SECTOR_SIZE};

/// 扇区缓冲区; 8 字节对齐, 以便在缓冲区上直接解析 u32/u64 数组和 #[repr(C)] 结构
#[repr(C, align(8))]
struct SectorBuf([u8; SECTOR_SIZE]);

/// 槽位状态. 只有合法的组合才能被表示: 脏一定有效, 脏的槽位视为已访问.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotStatus {
    /// 缓冲区内容无效 (空槽位, 或正在从磁盘载入)
    Invalid,
    /// 有效且 accessed 位为 0
    Clean,
    /// 有效且 accessed 位为 1
    Accessed,
    /// 内容与磁盘不一致, 重用前必须写回
    Dirty,
}

struct SlotState {
    /// 绑定的扇区, None 表示空槽位
    sector: Option<SectorId>,
    status: SlotStatus,
    /// 正在使用该槽位的访问者数量
    ref_count: usize,
}

/// Cached sector inside memory
struct CacheSlot {
    state: StdMutex<SlotState>,
    /// ref_count 归零时通知
    drained: Condvar,
    data: RwLock<SectorBuf>,
}

impl CacheSlot {
    fn new() -> Self {
        Self {
            state: StdMutex::new(SlotState {
                sector: None,
                status: SlotStatus::Invalid,
                ref_count: 0,
            }),
            drained: Condvar::new(),
            data: RwLock::new(SectorBuf([0; SECTOR_SIZE])),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 调用者必须持有全局结构锁
    fn pin(&self) {
        self.state().ref_count += 1;
    }

    fn unpin(&self) {
        let mut state = self.state();
        assert!(state.ref_count > 0, "unbalanced cache slot unpin");
        state.ref_count -= 1;
        if state.ref_count == 0 {
            self.drained.notify_all();
        }
    }

    /// 阻塞直到没有访问者, 返回时仍持有状态锁
    fn wait_drained(&self) -> MutexGuard<'_, SlotState> {
        let mut state = self.state();
        while state.ref_count > 0 {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }

    /// 已被 pin 的槽位: 等待可能正在进行的载入完成, 再确认它仍绑定在 sector 上
    fn settle(&self, sector: SectorId) -> bool {
        let _data = self.data.read();
        let state = self.state();
        state.sector == Some(sector) && state.status != SlotStatus::Invalid
    }

    /// 访问之后更新状态位; 调用者持有 data 锁
    fn touch(&self, dirty: bool) {
        let mut state = self.state();
        state.status = match (state.status, dirty) {
            (_, true) => SlotStatus::Dirty,
            (SlotStatus::Clean, false) => SlotStatus::Accessed,
            (status, false) => status,
        };
    }
}

/// 在缓冲区偏移量 offset 处获取一个类型为 T 的磁盘上数据结构的不可变引用.
/// T 必须对任意比特模式都合法 (整数数组, 只含整数字段的 #[repr(C)] 结构).
fn view<T>(buf: &SectorBuf, offset: usize) -> &T {
    check_view::<T>(offset);
    unsafe { &*(buf.0.as_ptr().add(offset) as *const T) }
}

fn view_mut<T>(buf: &mut SectorBuf, offset: usize) -> &mut T {
    check_view::<T>(offset);
    unsafe { &mut *(buf.0.as_mut_ptr().add(offset) as *mut T) }
}

fn check_view<T>(offset: usize) {
    // 确认 T 被整个包含在扇区缓冲区之内, 且地址满足对齐
    assert!(offset + mem::size_of::<T>() <= SECTOR_SIZE);
    assert!(mem::align_of::<T>() <= mem::align_of::<SectorBuf>());
    assert_eq!(offset % mem::align_of::<T>(), 0);
}

/// 一个被 pin 住的槽位. 存活期间该槽位不会被替换或重新分配, drop 时引用计数减一.
pub struct SlotRef<'a> {
    cache: &'a BufferCache,
    index: usize,
    sector: SectorId,
}

impl SlotRef<'_> {
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    fn slot(&self) -> &CacheSlot {
        &self.cache.slots[self.index]
    }

    /// 以共享方式访问缓冲区偏移 offset 处的 T, 并设置 accessed 位
    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        let data = self.slot().data.read();
        let value = f(view(&data, offset));
        self.slot().touch(false);
        value
    }

    /// 以独占方式修改缓冲区偏移 offset 处的 T, 并将槽位标记为脏
    pub fn modify<T, V>(&self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        let mut data = self.slot().data.write();
        let value = f(view_mut(&mut data, offset));
        self.slot().touch(true);
        value
    }
}

impl Drop for SlotRef<'_> {
    fn drop(&mut self) {
        self.slot().unpin();
    }
}

/// 全局结构锁保护的部分
struct CacheIndex {
    /// 时钟算法的环, 队头是下一个被检查的槽位
    ring: VecDeque<usize>,
    /// 扇区 -> 槽位; 同一扇区至多对应一个槽位
    map: HashMap<SectorId, usize>,
}

/// 替换算法本次选择处于哪一轮
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Sweep {
    /// 第一圈: 只接受 accessed 为 0 且无人引用的槽位
    SecondChance,
    /// 第二圈: 忽略 accessed, 接受无人引用的干净槽位
    Relaxed,
    /// 之后: 所有槽位都脏或被引用, 强制选择 (仍然会等待引用归零并先写回)
    Forced,
}

/// 固定容量的扇区缓存
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    slots: Vec<CacheSlot>,
    index: Mutex<CacheIndex>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer cache needs at least one slot");
        Self {
            device,
            slots: (0..capacity).map(|_| CacheSlot::new()).collect(),
            index: Mutex::new(CacheIndex {
                ring: (0..capacity).collect(),
                map: HashMap::with_capacity(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 查找已缓存的扇区. 命中时返回被 pin 住的槽位, 除此之外没有副作用.
    pub fn search(&self, sector: SectorId) -> Option<SlotRef<'_>> {
        loop {
            let index = {
                let cache_index = self.index.lock();
                let index = *cache_index.map.get(&sector)?;
                self.slots[index].pin();
                index
            };
            if self.slots[index].settle(sector) {
                return Some(SlotRef {
                    cache: self,
                    index,
                    sector,
                });
            }
            // 另一个线程的载入失败了, 重新查找
            self.slots[index].unpin();
        }
    }

    /// 缓存缺失路径: 选出替换槽位并载入 sector.
    ///
    /// full_overwrite 表示调用者将覆盖整个扇区, 此时跳过磁盘读, 缓冲区内容为全 0.
    /// 若在此期间其他线程已经载入了该扇区, 直接返回已有的槽位.
    pub fn load(&self, sector: SectorId, full_overwrite: bool) -> FsResult<SlotRef<'_>> {
        self.fetch(sector, full_overwrite, None)
    }

    /// 先查找, 缺失时载入
    pub fn get(&self, sector: SectorId, full_overwrite: bool) -> FsResult<SlotRef<'_>> {
        match self.search(sector) {
            Some(slot) => Ok(slot),
            None => self.load(sector, full_overwrite),
        }
    }

    /// 将扇区 sector 中 [offset, offset + dst.len()) 的内容读到 dst
    pub fn read(&self, sector: SectorId, offset: usize, dst: &mut [u8]) -> FsResult<()> {
        assert!(offset + dst.len() <= SECTOR_SIZE);
        let slot = self.get(sector, false)?;
        slot.read(0, |data: &[u8; SECTOR_SIZE]| {
            dst.copy_from_slice(&data[offset..offset + dst.len()]);
        });
        trace!("cache: read sector {} [{}, +{})", sector, offset, dst.len());
        Ok(())
    }

    /// 将 src 写入扇区 sector 的 offset 处. 覆盖整个扇区时不会预先读磁盘.
    pub fn write(&self, sector: SectorId, offset: usize, src: &[u8]) -> FsResult<()> {
        assert!(offset + src.len() <= SECTOR_SIZE);
        let slot = match self.search(sector) {
            Some(slot) => slot,
            // 整扇区覆盖: 在载入时直接写入新内容, 其他线程不会看到中间的全 0 状态
            None if offset == 0 && src.len() == SECTOR_SIZE => {
                trace!("cache: overwrite sector {}", sector);
                return self.fetch(sector, true, Some(src)).map(|_| ());
            }
            None => self.load(sector, false)?,
        };
        slot.modify(0, |data: &mut [u8; SECTOR_SIZE]| {
            data[offset..offset + src.len()].copy_from_slice(src);
        });
        trace!("cache: write sector {} [{}, +{})", sector, offset, src.len());
        Ok(())
    }

    /// 在扇区 sector 的偏移 offset 处以类型 T 读取
    pub fn read_as<T, V>(
        &self,
        sector: SectorId,
        offset: usize,
        f: impl FnOnce(&T) -> V,
    ) -> FsResult<V> {
        Ok(self.get(sector, false)?.read(offset, f))
    }

    /// 在扇区 sector 的偏移 offset 处以类型 T 修改
    pub fn modify_as<T, V>(
        &self,
        sector: SectorId,
        offset: usize,
        f: impl FnOnce(&mut T) -> V,
    ) -> FsResult<V> {
        Ok(self.get(sector, false)?.modify(offset, f))
    }

    /// 写回所有脏槽位, 返回实际写回的扇区数.
    ///
    /// 在全局锁下确定要写回的槽位, 写回本身在全局锁之外进行.
    /// 调用者不能持有任何 [`SlotRef`], 否则会等待自己的引用归零.
    pub fn flush_all(&self) -> FsResult<usize> {
        let dirty: Vec<usize> = {
            let index = self.index.lock();
            index
                .ring
                .iter()
                .copied()
                .filter(|&i| self.slots[i].state().status == SlotStatus::Dirty)
                .collect()
        };
        let mut flushed = 0;
        for i in dirty {
            if self.write_back(i)? {
                flushed += 1;
            }
        }
        trace!("cache: flushed {} sector(s)", flushed);
        Ok(flushed)
    }

    /// 若 sector 在缓存中且为脏, 写回它
    pub fn flush_sector(&self, sector: SectorId) -> FsResult<bool> {
        let index = match self.index.lock().map.get(&sector) {
            Some(&index) => index,
            None => return Ok(false),
        };
        self.write_back(index)
    }

    /// 当前缓存中的扇区
    pub fn resident_sectors(&self) -> Vec<SectorId> {
        let _index = self.index.lock();
        self.slots.iter().filter_map(|s| s.state().sector).collect()
    }

    /// 当前脏槽位数量
    pub fn dirty_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state().status == SlotStatus::Dirty)
            .count()
    }

    fn fetch(
        &self,
        sector: SectorId,
        full_overwrite: bool,
        content: Option<&[u8]>,
    ) -> FsResult<SlotRef<'_>> {
        loop {
            let mut cache_index = self.index.lock();
            if let Some(&index) = cache_index.map.get(&sector) {
                self.slots[index].pin();
                drop(cache_index);
                if self.slots[index].settle(sector) {
                    let slot = SlotRef {
                        cache: self,
                        index,
                        sector,
                    };
                    if let Some(src) = content {
                        slot.modify(0, |data: &mut [u8; SECTOR_SIZE]| data.copy_from_slice(src));
                    }
                    return Ok(slot);
                }
                self.slots[index].unpin();
                continue;
            }

            let (victim, sweep) = Self::select_victim(&self.slots, &mut cache_index.ring);
            let slot = &self.slots[victim];
            let mut state = slot.state();
            if state.ref_count > 0 || state.status == SlotStatus::Dirty {
                // 不持有全局锁, 等待引用归零后写回, 然后重新选择
                drop(state);
                drop(cache_index);
                if sweep == Sweep::Forced {
                    warn!("cache: every slot dirty or in use, forcing slot {}", victim);
                }
                self.write_back(victim)?;
                continue;
            }

            if let Some(old) = state.sector.take() {
                cache_index.map.remove(&old);
                trace!("cache: evict sector {} from slot {}", old, victim);
            }
            cache_index.map.insert(sector, victim);
            state.sector = Some(sector);
            state.status = SlotStatus::Invalid;
            state.ref_count = 1;
            drop(state);
            // 引用计数刚才为 0, 没有人持有 data 锁
            let mut data = slot.data.write();
            drop(cache_index);

            data.0.fill(0);
            let loaded = match content {
                Some(src) => {
                    data.0.copy_from_slice(src);
                    Ok(())
                }
                None if full_overwrite => Ok(()),
                None => self.device.read_block(sector as usize, &mut data.0),
            };
            match loaded {
                Ok(()) => {
                    slot.state().status = if content.is_some() {
                        SlotStatus::Dirty
                    } else {
                        SlotStatus::Clean
                    };
                    drop(data);
                    trace!("cache: load sector {} into slot {}", sector, victim);
                    return Ok(SlotRef {
                        cache: self,
                        index: victim,
                        sector,
                    });
                }
                Err(err) => {
                    error!("cache: failed to read sector {}: {}", sector, err);
                    {
                        let mut cache_index = self.index.lock();
                        if cache_index.map.get(&sector) == Some(&victim) {
                            cache_index.map.remove(&sector);
                        }
                        let mut state = slot.state();
                        state.sector = None;
                        state.status = SlotStatus::Invalid;
                    }
                    drop(data);
                    slot.unpin();
                    return Err(err.into());
                }
            }
        }
    }

    /// 时钟 (second-chance) 替换算法. 调用者持有全局结构锁.
    ///
    /// 每次从队头弹出一个槽位并压回队尾:
    /// - 第一圈: accessed 为 0 且无人引用的槽位即为替换对象; 干净的已访问槽位清除 accessed 位再给一次机会;
    ///   脏槽位保持 accessed, 直到写回才会降级
    /// - 第二圈: 接受任意无人引用的干净槽位
    /// - 第三圈: 接受任意无人引用的槽位 (脏的会先写回)
    /// - 再之后: 直接选择当前槽位, 由调用者等待引用归零
    ///
    /// 经典的时钟算法在第二圈之后就强制选择当前槽位. 这里有意多走一圈:
    /// 宁可写回一个无人引用的脏槽位, 也不去等待一个正在被使用的槽位.
    /// 只有全部槽位都被引用时才会走到强制选择.
    fn select_victim(slots: &[CacheSlot], ring: &mut VecDeque<usize>) -> (usize, Sweep) {
        let n = ring.len();
        let mut popped = 0;
        loop {
            let index = ring.pop_front().expect("cache ring is never empty");
            ring.push_back(index);
            let mut state = slots[index].state();
            let unreferenced = state.ref_count == 0;
            let revolution = popped / n;
            popped += 1;
            match revolution {
                0 => match state.status {
                    SlotStatus::Invalid | SlotStatus::Clean if unreferenced => {
                        return (index, Sweep::SecondChance)
                    }
                    SlotStatus::Accessed => state.status = SlotStatus::Clean,
                    _ => {}
                },
                1 => {
                    if unreferenced && state.status != SlotStatus::Dirty {
                        return (index, Sweep::Relaxed);
                    }
                }
                2 => {
                    if unreferenced {
                        return (index, Sweep::Forced);
                    }
                }
                _ => return (index, Sweep::Forced),
            }
        }
    }

    /// 等待槽位引用归零; 若为脏则写回并清除 dirty/accessed. 返回是否发生了写回.
    fn write_back(&self, index: usize) -> FsResult<bool> {
        let slot = &self.slots[index];
        let mut state = slot.wait_drained();
        let sector = match (state.status, state.sector) {
            (SlotStatus::Dirty, Some(sector)) => sector,
            _ => return Ok(false),
        };
        // 先清除 dirty 再拷贝: 写回期间的新修改会重新把槽位标记为脏
        state.status = SlotStatus::Clean;
        state.ref_count += 1;
        drop(state);

        let result = {
            let data = slot.data.read();
            self.device.write_block(sector as usize, &data.0)
        };
        if let Err(err) = &result {
            error!("cache: failed to write back sector {}: {}", sector, err);
            slot.state().status = SlotStatus::Dirty;
        } else {
            trace!("cache: wrote back sector {} from slot {}", sector, index);
        }
        slot.unpin();
        result?;
        Ok(true)
    }
}
