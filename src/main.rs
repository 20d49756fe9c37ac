use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};

use sector_fs::{
    device::BlockFile,
    fs::{FileSystem, SectorId, DEFAULT_CACHE_CAPACITY, SECTOR_SIZE},
};

#[derive(Parser)]
#[command(name = "sector-fs", about = "Inspect and pack sector-fs volume images")]
struct Cli {
    /// Volume image path
    #[arg(long, short, default_value = "target/fs.img")]
    image: PathBuf,

    /// Buffer cache capacity in sectors
    #[arg(long, short, default_value_t = DEFAULT_CACHE_CAPACITY)]
    cache: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh volume image
    Format {
        /// Total sectors of the volume
        #[arg(long, short, default_value_t = 0x4000)]
        sectors: u32,
    },
    /// Copy a host file into a new inode, print its sector
    Put {
        #[arg(long, short)]
        file: PathBuf,
    },
    /// Copy the content of an inode out to a host file
    Get {
        #[arg(long)]
        inode: SectorId,
        #[arg(long, short)]
        out: PathBuf,
    },
    /// Show an inode's length, type and block pointers
    Stat {
        #[arg(long)]
        inode: SectorId,
    },
    /// Remove an inode and release its sectors
    Rm {
        #[arg(long)]
        inode: SectorId,
    },
    /// Show the superblock and free space
    Info,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Format { sectors } => format(&cli.image, sectors, cli.cache),
        Command::Put { ref file } => put(&open(&cli.image, cli.cache)?, file),
        Command::Get { inode, ref out } => get(&open(&cli.image, cli.cache)?, inode, out),
        Command::Stat { inode } => stat(&open(&cli.image, cli.cache)?, inode),
        Command::Rm { inode } => rm(&open(&cli.image, cli.cache)?, inode),
        Command::Info => info(&open(&cli.image, cli.cache)?),
    }
}

fn format(image: &Path, sectors: u32, cache: usize) -> anyhow::Result<()> {
    // 在 host 上创建文件来新建一个虚拟块设备, 容量为 sectors 个扇区
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)
        .with_context(|| format!("cannot create image {}", image.display()))?;
    file.set_len(sectors as u64 * SECTOR_SIZE as u64)?;

    let fs = FileSystem::format(Arc::new(BlockFile::new(file)), sectors, cache)
        .context("format failed")?;
    println!(
        "formatted {}: {} sector(s), {} free",
        image.display(),
        sectors,
        fs.free_count()?
    );
    fs.close()?;
    Ok(())
}

fn open(image: &Path, cache: usize) -> anyhow::Result<Arc<FileSystem>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .with_context(|| format!("cannot open image {}", image.display()))?;
    FileSystem::open(Arc::new(BlockFile::new(file)), cache)
        .with_context(|| format!("{} is not a sector-fs volume", image.display()))
}

fn put(fs: &Arc<FileSystem>, host: &Path) -> anyhow::Result<()> {
    let mut data = Vec::new();
    File::open(host)
        .and_then(|mut f| f.read_to_end(&mut data))
        .with_context(|| format!("cannot read {}", host.display()))?;

    let sector = fs.alloc_inode_sector()?;
    fs.create_inode(sector, 0, false)?;
    let inode = fs.open_inode(sector)?;
    let written = inode.write_at(&data, 0)?;
    inode.close()?;
    fs.close()?;
    if written < data.len() {
        bail!(
            "volume full: wrote {} of {} byte(s) to inode {}",
            written,
            data.len(),
            sector
        );
    }
    println!("{}", sector);
    Ok(())
}

fn get(fs: &Arc<FileSystem>, sector: SectorId, out: &Path) -> anyhow::Result<()> {
    let inode = fs.open_inode(sector)?;
    let mut data = vec![0u8; inode.length()];
    let read = inode.read_at(&mut data, 0)?;
    inode.close()?;
    File::create(out)
        .and_then(|mut f| f.write_all(&data[..read]))
        .with_context(|| format!("cannot write {}", out.display()))?;
    println!("{} byte(s) -> {}", read, out.display());
    Ok(())
}

fn stat(fs: &Arc<FileSystem>, sector: SectorId) -> anyhow::Result<()> {
    let inode = fs.open_inode(sector)?;
    let record = inode.record();
    let mapped = inode.mapped()?;
    inode.close()?;
    println!("inode: {}", sector);
    println!("length: {} B", record.length);
    println!("type: {}", if record.is_dir() { "directory" } else { "file" });
    println!("direct: {:?}", record.direct);
    println!("indirect: {}", record.indirect);
    println!("double indirect: {}", record.double_indirect);
    println!(
        "sectors: {} data, {} index",
        mapped.data.len(),
        mapped.index.len()
    );
    Ok(())
}

fn rm(fs: &Arc<FileSystem>, sector: SectorId) -> anyhow::Result<()> {
    let before = fs.free_count()?;
    let inode = fs.open_inode(sector)?;
    inode.remove();
    inode.close()?;
    fs.close()?;
    println!(
        "removed inode {}, released {} sector(s)",
        sector,
        fs.free_count()? - before
    );
    Ok(())
}

fn info(fs: &Arc<FileSystem>) -> anyhow::Result<()> {
    let Some(sb) = fs.super_block() else {
        bail!("volume has no superblock");
    };
    let formatted_at = Utc
        .timestamp_opt(sb.formatted_at, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| sb.formatted_at.to_string());
    println!("total sectors: {}", sb.total_sectors);
    println!(
        "free map: sectors [{}, {})",
        sb.free_map_start,
        sb.free_map_start + sb.free_map_sectors
    );
    println!("formatted at: {}", formatted_at);
    println!("free sectors: {}", fs.free_count()?);
    Ok(())
}
