//! Transfer rate accounting
//!
//! Byte counters are fed as traffic happens and turned into rates on the
//! engine tick, so every rate in a snapshot covers the same window.

use std::collections::VecDeque;
use std::time::Duration;

/// Number of ticks a rate is averaged over
pub const RATE_WINDOW: usize = 5;

/// Running total plus a windowed rate
#[derive(Debug, Clone, Default)]
pub struct RateMeter {
    /// (bytes, elapsed) per tick, oldest first
    samples: VecDeque<(u64, Duration)>,
    /// Bytes since the last tick
    pending: u64,
    /// Bytes over the meter's lifetime
    total: u64,
}

impl RateMeter {
    /// Count transferred bytes
    pub fn record(&mut self, bytes: u64) {
        self.pending += bytes;
        self.total += bytes;
    }

    /// Close the current sample
    pub fn tick(&mut self, elapsed: Duration) {
        if self.samples.len() >= RATE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((self.pending, elapsed));
        self.pending = 0;
    }

    /// Bytes per second over the window
    pub fn rate(&self) -> f32 {
        let secs: f64 = self.samples.iter().map(|(_, d)| d.as_secs_f64()).sum();
        if secs <= 0.0 {
            return 0.0;
        }
        let bytes: u64 = self.samples.iter().map(|(b, _)| *b).sum();
        (bytes as f64 / secs) as f32
    }

    /// Bytes over the meter's lifetime
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Forget the rate window
    pub fn clear_rate(&mut self) {
        self.samples.clear();
        self.pending = 0;
    }
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// Payload and protocol meters in both directions
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub download_payload: RateMeter,
    pub download_protocol: RateMeter,
    pub upload_payload: RateMeter,
    pub upload_protocol: RateMeter,
}

impl TransferStats {
    /// Count bytes moved in one direction
    pub fn record(&mut self, direction: Direction, payload: u64, protocol: u64) {
        let (payload_meter, protocol_meter) = match direction {
            Direction::Download => (&mut self.download_payload, &mut self.download_protocol),
            Direction::Upload => (&mut self.upload_payload, &mut self.upload_protocol),
        };
        payload_meter.record(payload);
        protocol_meter.record(protocol);
    }

    /// Close the current sample of every meter
    pub fn tick(&mut self, elapsed: Duration) {
        self.download_payload.tick(elapsed);
        self.download_protocol.tick(elapsed);
        self.upload_payload.tick(elapsed);
        self.upload_protocol.tick(elapsed);
    }

    /// Download rate, payload plus protocol
    pub fn download_rate(&self) -> f32 {
        self.download_payload.rate() + self.download_protocol.rate()
    }

    /// Upload rate, payload plus protocol
    pub fn upload_rate(&self) -> f32 {
        self.upload_payload.rate() + self.upload_protocol.rate()
    }

    /// Bytes downloaded, payload plus protocol
    pub fn total_download(&self) -> u64 {
        self.download_payload.total() + self.download_protocol.total()
    }

    /// Bytes uploaded, payload plus protocol
    pub fn total_upload(&self) -> u64 {
        self.upload_payload.total() + self.upload_protocol.total()
    }

    /// Forget every rate window, keeping totals
    pub fn clear_rates(&mut self) {
        self.download_payload.clear_rate();
        self.download_protocol.clear_rate();
        self.upload_payload.clear_rate();
        self.upload_protocol.clear_rate();
    }
}
