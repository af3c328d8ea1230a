#![forbid(unsafe_code)]
//! Command-line tools for RT-11 volume images: inspect, list, format,
//! extract, and mount.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rt11_block::FileDataSource;
use rt11_core::Rt11Fs;
use rt11_dir::format;
use rt11_fuse::MountOptions;
use rt11_types::{
    date, CREATION_DATE_WORD, E_EOS, E_MPTY, E_PERM, E_PRE, E_PROT, E_READ, E_TENT, SECTOR_SIZE,
    STATUS_WORD,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rt11fs", about = "RT-11 volume image toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show volume geometry and usage statistics.
    Inspect {
        /// Path to the volume image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List the directory, free space included.
    Ls {
        /// Path to the volume image.
        image: PathBuf,
    },
    /// Create (or overwrite) a freshly formatted volume image.
    Format {
        /// Path to the volume image.
        image: PathBuf,
        /// Volume size in 512-byte sectors.
        #[arg(long, default_value_t = 512)]
        sectors: u32,
        /// Directory segments to allocate.
        #[arg(long, default_value_t = 4)]
        segments: u16,
        /// Application-reserved extra bytes per directory entry.
        #[arg(long, default_value_t = 0)]
        extra_bytes: u16,
    },
    /// Copy a file's contents to standard output.
    Cat {
        /// Path to the volume image.
        image: PathBuf,
        /// RT-11 filename, e.g. SWAP.SYS.
        name: String,
    },
    /// Mount the volume via FUSE (blocks until unmounted).
    Mount {
        /// Path to the volume image.
        image: PathBuf,
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
        /// Refuse writes.
        #[arg(long)]
        read_only: bool,
    },
}

#[derive(Serialize)]
struct InspectReport {
    sectors: u32,
    directory_segments: u16,
    entry_size: usize,
    entries_per_segment: usize,
    stats: rt11_core::FsStats,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Ls { image } => ls(&image),
        Command::Format {
            image,
            sectors,
            segments,
            extra_bytes,
        } => format_image(&image, sectors, segments, extra_bytes),
        Command::Cat { image, name } => cat(&image, &name),
        Command::Mount {
            image,
            mountpoint,
            allow_other,
            read_only,
        } => mount(&image, &mountpoint, allow_other, read_only),
    }
}

fn open_volume(image: &PathBuf) -> Result<Rt11Fs> {
    Rt11Fs::mount_path(image).with_context(|| format!("mounting {}", image.display()))
}

fn inspect(image: &PathBuf, json: bool) -> Result<()> {
    let fs = open_volume(image)?;
    let report = InspectReport {
        sectors: fs.volume_sectors(),
        directory_segments: fs.dir().total_segments(),
        entry_size: fs.dir().entry_size(),
        entries_per_segment: fs.dir().max_entries_per_segment(),
        stats: fs.statfs(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("volume:   {} sectors ({} bytes)", report.sectors, u64::from(report.sectors) * SECTOR_SIZE as u64);
    println!(
        "directory: {} segments, {}-byte entries, {} per segment",
        report.directory_segments, report.entry_size, report.entries_per_segment
    );
    println!(
        "data:     {} blocks total, {} free",
        report.stats.total_blocks, report.stats.free_blocks
    );
    println!(
        "files:    {} slots total, {} free",
        report.stats.total_files, report.stats.free_files
    );
    Ok(())
}

fn flags_column(status: u16) -> String {
    let mut out = String::new();
    for (bit, tag) in [
        (E_TENT, "TEN"),
        (E_MPTY, "MPT"),
        (E_PERM, "PRM"),
        (E_EOS, "EOS"),
        (E_READ, "RDO"),
        (E_PROT, "PRT"),
        (E_PRE, "PRE"),
    ] {
        if status & bit != 0 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(tag);
        }
    }
    out
}

fn ls(image: &PathBuf) -> Result<()> {
    let fs = open_volume(image)?;
    let dir = fs.dir();

    println!("SEG,IDX ---NAME--- LENGTH SECTOR DATE       FLAGS");
    let mut ptr = dir.start_scan();
    while ptr.advance() {
        let status = ptr.word(STATUS_WORD);
        let Some(pos) = ptr.position() else { break };
        let Some(ent) = dir.entry_at(&ptr) else { break };

        let name = if status & E_MPTY != 0 {
            "<FREE>".to_owned()
        } else if status & E_EOS != 0 {
            "<EOS>".to_owned()
        } else {
            ent.name
        };

        let when = match date::decode(ptr.word(CREATION_DATE_WORD)) {
            Some((y, m, d)) => format!("{y:04}-{m:02}-{d:02}"),
            None => "   -  -   ".to_owned(),
        };

        println!(
            "{:3},{:3} {:>10} {:6} {:6} {} {}",
            pos.segment,
            pos.index,
            name,
            ent.length / SECTOR_SIZE as u64,
            ent.sector0,
            when,
            flags_column(status),
        );
    }
    Ok(())
}

fn format_image(image: &PathBuf, sectors: u32, segments: u16, extra_bytes: u16) -> Result<()> {
    if sectors < 8 {
        bail!("a volume needs at least 8 sectors");
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(image)
        .with_context(|| format!("creating {}", image.display()))?;
    file.set_len(u64::from(sectors) * SECTOR_SIZE as u64)?;
    drop(file);

    let source = FileDataSource::open(image)?;
    format::format_empty(&source, segments, extra_bytes)
        .with_context(|| format!("formatting {}", image.display()))?;

    println!(
        "{}: {} sectors, {} directory segments",
        image.display(),
        sectors,
        segments
    );
    Ok(())
}

fn cat(image: &PathBuf, name: &str) -> Result<()> {
    let mut fs = open_volume(image)?;
    let ent = fs.stat(name)?;
    let fd = fs.open(name)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut offset = 0_u64;
    let mut buf = vec![0_u8; 64 * SECTOR_SIZE];
    while offset < ent.length {
        let got = fs.read(fd, &mut buf, offset)?;
        if got == 0 {
            break;
        }
        out.write_all(&buf[..got])?;
        offset += got as u64;
    }
    fs.close(fd)?;
    Ok(())
}

fn mount(image: &PathBuf, mountpoint: &PathBuf, allow_other: bool, read_only: bool) -> Result<()> {
    let fs = open_volume(image)?;
    let options = MountOptions {
        read_only,
        allow_other,
        ..MountOptions::default()
    };
    rt11_fuse::mount(fs, mountpoint, &options)
        .with_context(|| format!("mounting at {}", mountpoint.display()))?;
    Ok(())
}
