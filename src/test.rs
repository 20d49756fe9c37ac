use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rand::{Rng, RngCore};

use crate::device::{BlockFile, RamDisk};
use crate::fs::{
    self, bytes_to_sectors, Allocator, BlockDevice, BufferCache, FileSystem, FreeMap, FsError,
    Inode, DIRECT_COUNT, DIRECT_LIMIT, INDIRECT_LIMIT, MAX_FILE_SIZE, SECTOR_SIZE,
};

const TOTAL_SECTORS: u32 = 4096;

fn ram_volume(total: u32, cache: usize) -> (Arc<RamDisk>, Arc<FileSystem>) {
    let disk = Arc::new(RamDisk::new(total as usize));
    let fs = FileSystem::format(disk.clone(), total, cache).unwrap();
    (disk, fs)
}

fn new_file(fs: &Arc<FileSystem>, length: usize) -> Arc<Inode> {
    let sector = fs.alloc_inode_sector().unwrap();
    fs.create_inode(sector, length, false).unwrap();
    fs.open_inode(sector).unwrap()
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[test]
fn sfs_test() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 64);
    let file = new_file(&fs, 0);

    let greet_str = "Hello, world!";
    assert_eq!(file.write_at(greet_str.as_bytes(), 0).unwrap(), greet_str.len());
    let mut buffer = [0u8; 233];
    let len = file.read_at(&mut buffer, 0).unwrap();
    assert_eq!(greet_str, core::str::from_utf8(&buffer[..len]).unwrap());

    let random_str_test = |len: usize| {
        let file = new_file(&fs, 0);
        let mut str = String::new();
        // random digit
        for _ in 0..len {
            str.push(char::from(b'0' + rand::random::<u8>() % 10));
        }
        assert_eq!(file.write_at(str.as_bytes(), 0).unwrap(), len);
        let mut read_buffer = [0u8; 127];
        let mut offset = 0usize;
        let mut read_str = String::new();
        loop {
            let len = file.read_at(&mut read_buffer, offset).unwrap();
            if len == 0 {
                break;
            }
            offset += len;
            read_str.push_str(core::str::from_utf8(&read_buffer[..len]).unwrap());
        }
        assert_eq!(str, read_str);
        file.remove();
        file.close().unwrap();
    };

    random_str_test(4 * SECTOR_SIZE);
    random_str_test(8 * SECTOR_SIZE + SECTOR_SIZE / 2);
    random_str_test(100 * SECTOR_SIZE);
    random_str_test(70 * SECTOR_SIZE + SECTOR_SIZE / 7);
    random_str_test((12 + 128) * SECTOR_SIZE);
    random_str_test(400 * SECTOR_SIZE);
    random_str_test(1000 * SECTOR_SIZE);

    file.close().unwrap();
    fs.close().unwrap();
}

#[test]
fn round_trip_across_tier_boundaries() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 32);
    let file = new_file(&fs, 0);
    // 跨越 direct -> indirect 和 indirect -> double indirect 的边界
    for &boundary in &[DIRECT_LIMIT, INDIRECT_LIMIT] {
        let offset = boundary - 300;
        let data = random_bytes(1000);
        assert_eq!(file.write_at(&data, offset).unwrap(), data.len());
        let mut back = vec![0u8; data.len()];
        assert_eq!(file.read_at(&mut back, offset).unwrap(), data.len());
        assert_eq!(data, back);
    }
    assert_eq!(file.length(), INDIRECT_LIMIT + 700);
    file.close().unwrap();
}

#[test]
fn sparse_write_leaves_no_holes() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 32);
    let file = new_file(&fs, 0);
    assert_eq!(file.write_at(b"abc", 10).unwrap(), 3);
    assert_eq!(file.write_at(b"tail", 70_000).unwrap(), 4);
    assert_eq!(file.length(), 70_004);

    let record = file.record();
    assert!(record.direct.iter().all(|&s| s != 0));
    assert_ne!(record.indirect, 0);
    let mapped = file.mapped().unwrap();
    assert_eq!(mapped.data.len(), bytes_to_sectors(70_004));
    assert!(mapped.data.iter().all(|&s| s != 0));

    // 旧的文件末尾到新写入位置之间读作 0
    let mut gap = vec![0xffu8; 70_000 - 13];
    assert_eq!(file.read_at(&mut gap, 13).unwrap(), gap.len());
    assert!(gap.iter().all(|&b| b == 0));

    let mut head = [0u8; 3];
    file.read_at(&mut head, 10).unwrap();
    assert_eq!(&head, b"abc");
    file.close().unwrap();
}

#[test]
fn read_stops_at_end_of_file() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 16);
    let file = new_file(&fs, 0);
    file.write_at(&[7u8; 600], 0).unwrap();
    let mut buf = [0u8; 1024];
    assert_eq!(file.read_at(&mut buf, 500).unwrap(), 100);
    assert_eq!(file.read_at(&mut buf, 600).unwrap(), 0);
    assert_eq!(file.read_at(&mut buf, 10_000).unwrap(), 0);
    file.close().unwrap();
}

#[test]
fn created_file_reads_zeros() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 16);
    let file = new_file(&fs, 80_000);
    assert_eq!(file.length(), 80_000);
    let mut buf = vec![0xaau8; 80_000];
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), 80_000);
    assert!(buf.iter().all(|&b| b == 0));
    file.close().unwrap();
}

#[test]
fn idempotent_flush() {
    let (disk, fs) = ram_volume(TOTAL_SECTORS, 32);
    let file = new_file(&fs, 0);
    file.write_at(&random_bytes(5000), 0).unwrap();
    fs.flush_all().unwrap();
    let writes = disk.writes();
    assert_eq!(fs.flush_all().unwrap(), 0);
    assert_eq!(disk.writes(), writes);
    file.close().unwrap();
}

#[test]
fn shared_handles_observe_each_other() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 32);
    let a = new_file(&fs, 0);
    let b = fs.open_inode(a.inumber()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.open_count(), 2);

    a.write_at(b"shared", 0).unwrap();
    let mut buf = [0u8; 6];
    assert_eq!(b.read_at(&mut buf, 0).unwrap(), 6);
    assert_eq!(&buf, b"shared");

    let c = b.reopen();
    assert_eq!(a.open_count(), 3);
    c.close().unwrap();
    b.close().unwrap();
    assert_eq!(fs.open_inode_count(), 1);
    a.close().unwrap();
    assert_eq!(fs.open_inode_count(), 0);
}

#[test]
fn shrink_then_extend_reads_zeros() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 16);
    let file = new_file(&fs, 0);
    assert_eq!(file.write_at(&[0xff; SECTOR_SIZE], 0).unwrap(), SECTOR_SIZE);
    file.set_length(100).unwrap();
    assert_eq!(file.length(), 100);

    // 越过末尾写入, 中间的空洞不能露出截断前的内容
    assert_eq!(file.write_at(b"x", 1000).unwrap(), 1);
    let mut buf = vec![0u8; 1001];
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), 1001);
    assert!(buf[..100].iter().all(|&b| b == 0xff));
    assert!(buf[100..1000].iter().all(|&b| b == 0));
    assert_eq!(buf[1000], b'x');
    file.close().unwrap();
}

#[test]
fn reopen_after_close_sees_persisted_record() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 8);
    let file = new_file(&fs, 0);
    let sector = file.inumber();
    let data = random_bytes(9000);
    file.write_at(&data, 0).unwrap();
    file.close().unwrap();

    let again = fs.open_inode(sector).unwrap();
    assert_eq!(again.length(), data.len());
    let mut back = vec![0u8; data.len()];
    again.read_at(&mut back, 0).unwrap();
    assert_eq!(back, data);
    again.close().unwrap();
}

#[test]
fn deny_write_gate() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 16);
    let file = new_file(&fs, 0);
    file.deny_write();
    assert_eq!(file.write_at(&[1u8; 4096], 0).unwrap(), 0);
    assert_eq!(file.length(), 0);
    file.allow_write();
    assert_eq!(file.write_at(&[1u8; 4096], 0).unwrap(), 4096);
    file.close().unwrap();
}

#[test]
#[should_panic(expected = "allow_write without deny_write")]
fn allow_write_requires_deny() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 16);
    let file = new_file(&fs, 0);
    file.allow_write();
}

#[test]
fn size_limit_rejection_allocates_nothing() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 16);
    let sector = fs.alloc_inode_sector().unwrap();
    let free = fs.free_count().unwrap();
    let err = fs.create_inode(sector, MAX_FILE_SIZE + 1, false).unwrap_err();
    assert!(matches!(err, FsError::SizeLimitExceeded { .. }));
    assert!(err.is_recoverable());
    assert_eq!(fs.free_count().unwrap(), free);
}

#[test]
fn create_exhaustion_allocates_nothing() {
    let (_, fs) = ram_volume(256, 16);
    let sector = fs.alloc_inode_sector().unwrap();
    let free = fs.free_count().unwrap();
    let err = fs.create_inode(sector, 300 * SECTOR_SIZE, false).unwrap_err();
    assert!(matches!(err, FsError::AllocationExhausted { .. }));
    assert_eq!(fs.free_count().unwrap(), free);
}

#[test]
fn exhaustion_gives_short_write() {
    let (_, fs) = ram_volume(128, 16);
    let file = new_file(&fs, 0);
    let data = random_bytes(200 * SECTOR_SIZE);
    let written = file.write_at(&data, 0).unwrap();
    assert!(written > 0 && written < data.len());
    assert_eq!(written % SECTOR_SIZE, 0);
    assert_eq!(file.length(), written);
    assert_eq!(fs.free_count().unwrap(), 0);

    let mut back = vec![0u8; written];
    file.read_at(&mut back, 0).unwrap();
    assert_eq!(&back[..], &data[..written]);
    file.close().unwrap();
}

#[test]
fn remove_releases_every_sector() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 32);
    let free = fs.free_count().unwrap();
    let file = new_file(&fs, 0);
    let sector = file.inumber();
    file.write_at(&random_bytes(300_000), 0).unwrap();
    let other = fs.open_inode(sector).unwrap();
    file.remove();
    file.close().unwrap();
    // 仍有打开者, 扇区暂不归还
    assert!(other.is_removed());
    assert!(fs.free_count().unwrap() < free);
    other.close().unwrap();
    assert_eq!(fs.free_count().unwrap(), free);
    assert!(matches!(
        fs.open_inode(sector),
        Err(FsError::Corrupted { .. })
    ));
}

#[test]
fn corrupted_magic_is_rejected() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 16);
    let sector = fs.alloc_inode_sector().unwrap();
    // 未初始化的扇区没有魔数
    match fs.open_inode(sector) {
        Err(FsError::Corrupted { sector: s, magic }) => {
            assert_eq!(s, sector);
            assert_eq!(magic, 0);
        }
        other => panic!("expected corrupted record, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(
        fs.open_inode(TOTAL_SECTORS + 1),
        Err(FsError::OutOfRange { .. })
    ));
}

/// 可以在运行中打开故障开关的设备
struct FlakyDisk {
    inner: RamDisk,
    failing: AtomicBool,
}

impl BlockDevice for FlakyDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        self.inner.read_block(block_id, buf)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        self.inner.write_block(block_id, buf)
    }
}

#[test]
fn device_errors_propagate() {
    let disk = Arc::new(FlakyDisk {
        inner: RamDisk::new(TOTAL_SECTORS as usize),
        failing: AtomicBool::new(false),
    });
    // 缓存很小, 逼迫读写真正落到设备上
    let fs = FileSystem::format(disk.clone(), TOTAL_SECTORS, 4).unwrap();
    let file = new_file(&fs, 0);
    file.write_at(&random_bytes(20 * SECTOR_SIZE), 0).unwrap();

    disk.failing.store(true, Ordering::SeqCst);
    let mut buf = vec![0u8; 20 * SECTOR_SIZE];
    assert!(matches!(
        file.read_at(&mut buf, 0).unwrap_err(),
        FsError::Device(_)
    ));
    assert!(matches!(fs.flush_all(), Err(FsError::Device(_)) | Ok(0)));
    disk.failing.store(false, Ordering::SeqCst);
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), buf.len());
    file.close().unwrap();
}

#[test]
fn free_count_reports_device_errors() {
    let disk = Arc::new(FlakyDisk {
        inner: RamDisk::new(TOTAL_SECTORS as usize),
        failing: AtomicBool::new(false),
    });
    let free = FileSystem::format(disk.clone(), TOTAL_SECTORS, 4)
        .unwrap()
        .free_count()
        .unwrap();

    // 新的缓存里只有超级块, 位图必须从设备读
    let fs = FileSystem::open(disk.clone(), 4).unwrap();
    disk.failing.store(true, Ordering::SeqCst);
    assert!(matches!(fs.free_count(), Err(FsError::Device(_))));
    disk.failing.store(false, Ordering::SeqCst);
    assert_eq!(fs.free_count().unwrap(), free);
}

#[test]
fn bad_superblock_is_rejected() {
    let disk = Arc::new(RamDisk::new(64));
    assert!(matches!(
        FileSystem::open(disk, 8),
        Err(FsError::BadSuperBlock)
    ));
}

#[test]
fn custom_allocator_volume() {
    let disk = Arc::new(RamDisk::new(512));
    let cache = Arc::new(BufferCache::new(disk, 16));
    let free_map = Arc::new(FreeMap::new(cache.clone(), 1, 1, 512));
    free_map.format(2).unwrap();
    let fs = FileSystem::with_allocator(cache, free_map.clone());
    assert!(fs.super_block().is_none());

    let file = new_file(&fs, DIRECT_COUNT * SECTOR_SIZE);
    assert_eq!(free_map.free_count().unwrap(), 510 - 1 - DIRECT_COUNT);
    file.set_length(100).unwrap();
    assert_eq!(file.length(), 100);
    assert!(matches!(
        file.set_length((DIRECT_COUNT + 1) * SECTOR_SIZE).unwrap_err(),
        FsError::SizeLimitExceeded { .. }
    ));
    file.close().unwrap();
}

#[test]
fn block_file_volume_survives_reopen() {
    let image = tempfile::NamedTempFile::new().unwrap();
    image
        .as_file()
        .set_len(TOTAL_SECTORS as u64 * SECTOR_SIZE as u64)
        .unwrap();

    let data = random_bytes(75_000);
    let sector = {
        let file = image.reopen().unwrap();
        let fs = FileSystem::format(Arc::new(BlockFile::new(file)), TOTAL_SECTORS, 16).unwrap();
        let inode = new_file(&fs, 0);
        assert_eq!(inode.write_at(&data, 0).unwrap(), data.len());
        let sector = inode.inumber();
        inode.close().unwrap();
        fs.close().unwrap();
        sector
    };

    let file = image.reopen().unwrap();
    let fs = FileSystem::open(Arc::new(BlockFile::new(file)), 16).unwrap();
    let sb = fs.super_block().unwrap();
    assert_eq!(sb.total_sectors, TOTAL_SECTORS);
    assert!(sb.formatted_at > 0);
    let inode = fs.open_inode(sector).unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(inode.read_at(&mut back, 0).unwrap(), data.len());
    assert_eq!(back, data);
    inode.close().unwrap();
}

#[test]
fn mount_point_lifecycle() {
    let (disk, volume) = ram_volume(256, 8);
    assert!(fs::mount(volume).is_none());
    let mounted = fs::mounted().unwrap();
    let file = new_file(&mounted, 0);
    let sector = file.inumber();
    file.write_at(b"mounted", 0).unwrap();
    file.close().unwrap();
    drop(mounted);

    fs::unmount().unwrap();
    assert!(fs::mounted().is_none());
    // 卸载后所有内容都已落盘, 换一个新的缓存也能读到
    let volume = FileSystem::open(disk, 8).unwrap();
    let file = volume.open_inode(sector).unwrap();
    let mut buf = [0u8; 7];
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), 7);
    assert_eq!(&buf, b"mounted");
    file.close().unwrap();
}

#[test]
fn concurrent_writers_on_distinct_files() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 16);
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let fs = fs.clone();
            std::thread::spawn(move || {
                let file = new_file(&fs, 0);
                let len = rand::thread_rng().gen_range(1..40_000);
                let data = vec![i as u8 + 1; len];
                assert_eq!(file.write_at(&data, 0).unwrap(), len);
                let mut back = vec![0u8; len];
                file.read_at(&mut back, 0).unwrap();
                assert_eq!(back, data);
                file.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(fs.open_inode_count(), 0);
}

#[test]
fn readers_see_a_prefix_while_file_grows() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 32);
    let file = new_file(&fs, 0);
    // 跨过直接块和一级间接块的边界, 进入二级间接块
    let total = INDIRECT_LIMIT + 4 * SECTOR_SIZE;
    let pattern: Arc<Vec<u8>> = Arc::new((0..total).map(|i| (i % 251) as u8 + 1).collect());

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let file = file.reopen();
            let pattern = pattern.clone();
            std::thread::spawn(move || {
                let mut buf = vec![0u8; total];
                for _ in 0..200 {
                    let read = file.read_at(&mut buf, 0).unwrap();
                    assert!(read <= total);
                    assert!(
                        buf[..read] == pattern[..read],
                        "reader saw bytes outside the written prefix of {}",
                        read
                    );
                    std::thread::yield_now();
                }
                file.close().unwrap();
            })
        })
        .collect();

    let mut pos = 0;
    while pos < total {
        let chunk = 1500.min(total - pos);
        assert_eq!(file.write_at(&pattern[pos..pos + chunk], pos).unwrap(), chunk);
        pos += chunk;
    }
    for reader in readers {
        reader.join().unwrap();
    }

    let mapped = file.mapped().unwrap();
    assert_eq!(mapped.data.len(), bytes_to_sectors(total));
    assert!(mapped.data.iter().all(|&sector| sector != 0));
    assert_eq!(mapped.index.len(), 3);
    let mut back = vec![0u8; total];
    assert_eq!(file.read_at(&mut back, 0).unwrap(), total);
    assert!(back == *pattern);
    file.close().unwrap();
}

#[test]
fn removed_inode_is_never_reopened() {
    let (_, fs) = ram_volume(TOTAL_SECTORS, 16);
    let free = fs.free_count().unwrap();
    for _ in 0..300 {
        let file = new_file(&fs, 0);
        file.write_at(&random_bytes(3 * SECTOR_SIZE), 0).unwrap();
        let sector = file.inumber();
        file.remove();

        let opener = {
            let fs = fs.clone();
            std::thread::spawn(move || loop {
                match fs.open_inode(sector) {
                    // 只能拿到那个已删除的共享实例
                    Ok(inode) => {
                        assert!(inode.is_removed());
                        inode.close().unwrap();
                    }
                    Err(FsError::Released { .. }) => std::thread::yield_now(),
                    Err(FsError::Corrupted { .. }) => break,
                    Err(err) => panic!("open inode {}: {}", sector, err),
                }
            })
        };
        file.close().unwrap();
        opener.join().unwrap();
    }
    assert_eq!(fs.free_count().unwrap(), free);
    assert_eq!(fs.open_inode_count(), 0);
}
