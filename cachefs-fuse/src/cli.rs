use std::path::PathBuf;
use std::time::Duration;

use cachefs::CacheConfig;
use cachefs::config::{CACHE_CAPACITY, FLUSH_INTERVAL};
use clap::builder::RangedU64ValueParser;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "Inspect and fill cachefs disk images")]
pub struct Cli {
    #[command(flatten)]
    pub cache: CacheArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct CacheArgs {
    /// Number of frames in the block cache
    #[arg(
        long,
        global = true,
        default_value_t = CACHE_CAPACITY,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..),
    )]
    pub cache_capacity: usize,

    /// Milliseconds between two write-behind flushes
    #[arg(
        long,
        global = true,
        default_value_t = FLUSH_INTERVAL.as_millis() as u64,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub flush_interval_ms: u64,

    /// Do not start the read-ahead task
    #[arg(long, global = true)]
    pub no_read_ahead: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an image and lay down an empty free map
    Format {
        #[arg(long, short)]
        image: PathBuf,

        /// Image size in sectors
        #[arg(long, short = 'n')]
        sectors: usize,
    },
    /// Copy a host file into a new inode, printing its sector
    Put {
        #[arg(long, short)]
        image: PathBuf,

        #[arg(long, short)]
        source: PathBuf,
    },
    /// Copy an inode's contents out to a host file
    Get {
        #[arg(long, short)]
        image: PathBuf,

        /// Descriptor sector of the inode
        #[arg(long)]
        inode: u32,

        #[arg(long, short = 'O')]
        out: PathBuf,
    },
    /// Show an inode's length, kind and footprint
    Stat {
        #[arg(long, short)]
        image: PathBuf,

        #[arg(long)]
        inode: u32,
    },
    /// Remove an inode and release its sectors
    Rm {
        #[arg(long, short)]
        image: PathBuf,

        #[arg(long)]
        inode: u32,
    },
}

impl CacheArgs {
    pub fn config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_capacity,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            read_ahead: !self.no_read_ahead,
        }
    }
}
