//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the session inspector
#[derive(Debug, Parser)]
#[command(name = "torrent-session")]
#[command(about = "Check, inspect and resume BitTorrent transfers", long_about = None)]
pub struct CliArgs {
    /// Path to a .torrent file, or a magnet link
    #[arg(value_name = "TORRENT")]
    pub torrent: String,

    /// Directory the transfer's data lives in
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Directory resume files are kept in
    #[arg(long, value_name = "DIR", default_value = ".resume")]
    pub resume_dir: PathBuf,

    /// Ignore existing resume data and hash every piece
    #[arg(long)]
    pub no_resume: bool,

    /// Upload limit in bytes per second (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub upload_limit: i64,

    /// Download limit in bytes per second (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub download_limit: i64,

    /// Maximum number of peer connections (-1 = unlimited)
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
    pub max_connections: i32,

    /// Maximum number of unchoked peers (-1 = unlimited)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub max_uploads: i32,

    /// Share ratio (0 = unlimited, otherwise at least 1)
    #[arg(long, default_value_t = 0.0)]
    pub ratio: f32,

    /// Index of a file not to download; may be repeated
    #[arg(long = "skip-file", value_name = "INDEX")]
    pub skip_files: Vec<usize>,

    /// Network interface for outgoing connections
    #[arg(long, value_name = "NAME")]
    pub interface: Option<String>,

    /// Request block size in KiB
    #[arg(long, default_value_t = 16)]
    pub block_size: u32,

    /// Add the transfer paused
    #[arg(long)]
    pub paused: bool,

    /// Exit after checking files, writing resume data
    #[arg(long)]
    pub once: bool,

    /// Seconds between status lines
    #[arg(long, default_value_t = 5)]
    pub status_interval: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
