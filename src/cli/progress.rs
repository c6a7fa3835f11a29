//! Progress display module
//!
//! Renders [`TorrentStatus`] snapshots as status lines on the terminal.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::session::{TorrentState, TorrentStatus};

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format a rate to human readable string
pub fn format_rate(bytes_per_sec: f32) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Time to fetch the remaining wanted bytes at the current payload rate
pub fn eta(status: &TorrentStatus) -> Option<Duration> {
    let remaining = status.total_wanted.saturating_sub(status.total_wanted_done);
    if status.download_payload_rate <= 0.0 || remaining == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(remaining as f64 / status.download_payload_rate as f64))
}

/// One-line summary of a snapshot
pub fn status_line(name: &str, status: &TorrentStatus) -> String {
    let bar_width: usize = 30;
    let filled = ((status.progress.clamp(0.0, 1.0) * bar_width as f32) as usize).min(bar_width);
    let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);
    let state = if status.paused {
        format!("{} (paused)", status.state)
    } else {
        status.state.to_string()
    };

    let mut line = format!(
        "{} [{}] {:.1}% {} | {} / {} | down {} | up {} | peers {} ({} seeds) | copies {:.2}",
        name,
        bar,
        status.progress * 100.0,
        state,
        format_bytes(status.total_wanted_done),
        format_bytes(status.total_wanted),
        format_rate(status.download_payload_rate),
        format_rate(status.upload_payload_rate),
        status.num_peers,
        status.num_seeds,
        status.distributed_copies,
    );
    if status.state == TorrentState::Downloading {
        let eta = eta(status).map_or_else(|| "unknown".to_string(), format_duration);
        line.push_str(&format!(" | eta {}", eta));
    }
    if let Some(error) = &status.error {
        line.push_str(&format!(" | error: {}", error));
    }
    line
}

/// Progress display for CLI
pub struct ProgressDisplay {
    /// Start time of the session
    start_time: Instant,
    /// Quiet mode (no progress output)
    quiet: bool,
}

impl ProgressDisplay {
    /// Create a new progress display
    pub fn new(quiet: bool) -> Self {
        Self {
            start_time: Instant::now(),
            quiet,
        }
    }

    /// Print a status line for a snapshot
    pub fn print_status(&self, name: &str, status: &TorrentStatus) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", status_line(name, status))?;
        stdout.flush()
    }

    /// Print the final statistics
    pub fn print_summary(&self, name: &str, status: &TorrentStatus) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!();
        println!("{}:", name);
        println!("  State: {}{}", status.state, if status.paused { " (paused)" } else { "" });
        println!(
            "  Pieces: {} / {}",
            status.num_pieces,
            status.pieces.len()
        );
        println!(
            "  Wanted: {} / {} ({:.1}%)",
            format_bytes(status.total_wanted_done),
            format_bytes(status.total_wanted),
            status.progress * 100.0
        );
        println!("  On disk: {}", format_bytes(status.total_done));
        println!("  Failed hash checks: {}", format_bytes(status.total_failed_bytes));
        println!(
            "  Lifetime payload: {} down, {} up",
            format_bytes(status.total_payload_download),
            format_bytes(status.total_payload_upload)
        );
        if !status.current_tracker.is_empty() {
            println!("  Tracker: {}", status.current_tracker);
        }
        println!("  Elapsed Time: {}", format_duration(self.start_time.elapsed()));
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("Error: {}", message);
        Ok(())
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
