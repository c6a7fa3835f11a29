//! CLI configuration module
//!
//! Turns parsed arguments into the session's configuration and the settings
//! applied to the transfer once it is added.

use crate::cli::args::CliArgs;
use crate::config::{SessionConfig, TransferLimits};
use crate::torrent::MagnetParser;
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the session inspector
#[derive(Debug, Clone)]
pub struct Config {
    /// .torrent path or magnet link
    pub source: String,
    /// Download directory
    pub output_dir: PathBuf,
    /// Resume file directory
    pub resume_dir: PathBuf,
    /// Load resume data if present
    pub use_resume: bool,
    /// Caps applied to the transfer
    pub limits: TransferLimits,
    /// Files not to download
    pub skip_files: Vec<usize>,
    /// Network interface for outgoing connections
    pub interface: Option<String>,
    /// Request block size in bytes
    pub block_size: u32,
    /// Add paused
    pub paused: bool,
    /// Exit after checking
    pub once: bool,
    /// Time between status lines
    pub status_interval: Duration,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let output_dir = args.output_dir.clone().unwrap_or_else(|| PathBuf::from("./downloads"));

        Self {
            source: args.torrent.clone(),
            output_dir,
            resume_dir: args.resume_dir.clone(),
            use_resume: !args.no_resume,
            limits: TransferLimits {
                upload_limit: args.upload_limit,
                download_limit: args.download_limit,
                max_uploads: args.max_uploads,
                max_connections: args.max_connections,
                ratio: args.ratio,
            },
            skip_files: args.skip_files.clone(),
            interface: args.interface.clone(),
            block_size: args.block_size.saturating_mul(1024),
            paused: args.paused,
            once: args.once,
            status_interval: Duration::from_secs(args.status_interval),
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("output_dir cannot be empty"));
        }
        if self.status_interval.is_zero() {
            return Err(anyhow::anyhow!("status_interval must be at least 1 second"));
        }
        self.limits.validate()?;
        self.session_config().validate()?;
        Ok(())
    }

    /// Engine settings
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            block_size: self.block_size,
            ..SessionConfig::default()
        }
    }

    /// Whether the source is a magnet link rather than a file
    pub fn is_magnet(&self) -> bool {
        MagnetParser::is_magnet_link(&self.source)
    }

    /// Filter flag per file, set for skipped files
    pub fn file_filter(&self, num_files: usize) -> Result<Vec<bool>> {
        if let Some(&index) = self.skip_files.iter().find(|&&i| i >= num_files) {
            return Err(anyhow::anyhow!("--skip-file {} out of range ({} files)", index, num_files));
        }
        Ok((0..num_files).map(|i| self.skip_files.contains(&i)).collect())
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
