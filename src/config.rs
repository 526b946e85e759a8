use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::{FsError, Result};

#[derive(Parser, Debug)]
#[command(name = "bucketfs", about = "FUSE filesystem over a flat object store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount a store
    Mount {
        /// Directory holding the objects
        store: PathBuf,

        /// Path to the mount point
        mountpoint: PathBuf,

        /// Serve an empty in-memory store instead of `store`
        #[arg(long)]
        memory: bool,

        /// JSON list of `{ "path", "store", "prefix" }` grafts applied at startup
        #[arg(long)]
        mounts: Option<PathBuf>,

        /// Log file path
        #[arg(long, default_value = "/tmp/bucketfs.log")]
        log_file: PathBuf,

        /// Extra FUSE mount options
        #[arg(short = 'o')]
        options: Vec<String>,

        /// Permission bits for directories
        #[arg(long, default_value = "755", value_parser = parse_mode)]
        dir_mode: u16,

        /// Permission bits for files
        #[arg(long, default_value = "644", value_parser = parse_mode)]
        file_mode: u16,

        /// Owner of every entry (defaults to the mounting user)
        #[arg(long)]
        uid: Option<u32>,

        /// Group of every entry (defaults to the mounting user's group)
        #[arg(long)]
        gid: Option<u32>,

        /// How long cached attributes stay valid
        #[arg(long, default_value = "1m", value_parser = parse_duration)]
        stat_cache_ttl: Duration,

        /// How long cached names and listings stay valid
        #[arg(long, default_value = "1m", value_parser = parse_duration)]
        type_cache_ttl: Duration,

        /// Timeout for each store request; 0 disables it
        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        http_timeout: Duration,

        /// Only treat `dir/` marker objects as directories
        #[arg(long)]
        no_implicit_dir: bool,

        /// Log every filesystem request
        #[arg(long)]
        debug_fuse: bool,
    },
    /// Unmount a bucketfs filesystem
    Unmount {
        /// Path to the mount point
        mountpoint: PathBuf,
    },
}

/// Settings consumed by the filesystem core.
#[derive(Debug, Clone)]
pub struct FsConfig {
    pub dir_mode: u16,
    pub file_mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub stat_cache_ttl: Duration,
    pub type_cache_ttl: Duration,
    pub request_timeout: Option<Duration>,
    /// Disables implicit directories: only `dir/` markers count.
    pub explicit_dir: bool,
    pub debug_fuse: bool,
    /// Keys requested per listing page.
    pub dir_page_size: u32,
    /// Uploads larger than this go through multipart.
    pub multipart_threshold: u64,
    pub readahead_size: u64,
    /// Largest file a handle will buffer; writes and truncates past it fail.
    pub max_file_size: u64,
    /// Capacity of the background upload ticket.
    pub replicators: u32,
    /// Capacity of the background read-ahead ticket.
    pub restorers: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            dir_mode: 0o755,
            file_mode: 0o644,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            stat_cache_ttl: Duration::from_secs(60),
            type_cache_ttl: Duration::from_secs(60),
            request_timeout: Some(Duration::from_secs(30)),
            explicit_dir: false,
            debug_fuse: false,
            dir_page_size: 1000,
            multipart_threshold: 8 * 1024 * 1024,
            readahead_size: 1024 * 1024,
            max_file_size: 5 << 40,
            replicators: 16,
            restorers: 20,
        }
    }
}

/// One graft read from the `--mounts` file.
#[derive(Debug, Clone, Deserialize)]
pub struct MountSpec {
    /// Path below the mount root, e.g. `data/archive`.
    pub path: String,
    /// Directory holding the grafted objects.
    pub store: PathBuf,
    #[serde(default)]
    pub prefix: String,
}

pub fn load_mounts(path: &Path) -> Result<Vec<MountSpec>> {
    let raw = std::fs::read(path)?;
    serde_json::from_slice(&raw)
        .map_err(|e| FsError::Config(format!("{}: {}", path.display(), e)))
}

/// Parse `500ms`, `30s`, `5m`, `2h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| format!("invalid duration {:?}", s))?;
    match unit {
        "" | "s" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("unknown duration unit {:?}", unit)),
    }
}

/// Parse octal permission bits such as `755` or `0o644`.
pub fn parse_mode(s: &str) -> std::result::Result<u16, String> {
    let digits = s.trim_start_matches("0o");
    u16::from_str_radix(digits, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| format!("invalid mode {:?}", s))
}
