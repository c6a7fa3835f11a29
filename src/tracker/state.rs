//! Announce scheduling for one transfer
//!
//! Decides when the next announce is due and to which tracker, and records
//! what trackers report back. The announces themselves are sent by the
//! tracker client outside the engine.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::torrent::InfoHash;
use crate::tracker::AnnounceEntry;

/// Event attached to an announce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnounceEvent {
    /// Regular interval announce
    None,
    /// First announce of a session
    Started,
    /// The download just finished
    Completed,
    /// The transfer is paused or removed
    Stopped,
}

/// Announce the engine asks the tracker client to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    /// Transfer being announced
    pub info_hash: InfoHash,
    /// Tracker to contact
    pub url: String,
    /// Event to report
    pub event: AnnounceEvent,
    /// HTTP basic-auth credentials, if set
    pub login: Option<(String, String)>,
    /// Payload bytes uploaded so far
    pub uploaded: u64,
    /// Payload bytes downloaded so far
    pub downloaded: u64,
    /// Wanted bytes still missing
    pub left: u64,
}

/// Tracker list and announce timing
#[derive(Debug, Clone)]
pub struct TrackerState {
    entries: Vec<AnnounceEntry>,
    current: Option<usize>,
    interval: Duration,
    retry_interval: Duration,
    next_announce: Instant,
    override_until: Option<Instant>,
    login: Option<(String, String)>,
    num_complete: i32,
    num_incomplete: i32,
    started_sent: bool,
}

impl TrackerState {
    /// Tracker state with the first announce due immediately
    pub fn new(entries: Vec<AnnounceEntry>, interval: Duration, retry_interval: Duration, now: Instant) -> Self {
        let mut state = Self {
            entries: Vec::new(),
            current: None,
            interval,
            retry_interval,
            next_announce: now,
            override_until: None,
            login: None,
            num_complete: -1,
            num_incomplete: -1,
            started_sent: false,
        };
        state.set_entries(entries);
        state
    }

    /// Current tracker list, in announce order
    pub fn entries(&self) -> &[AnnounceEntry] {
        &self.entries
    }

    /// Swap in a new tracker list and announce to it at the next tick
    pub fn replace(&mut self, entries: Vec<AnnounceEntry>, now: Instant) {
        info!("Replacing tracker list ({} entries)", entries.len());
        self.set_entries(entries);
        self.current = None;
        self.next_announce = now;
        self.override_until = None;
    }

    fn set_entries(&mut self, mut entries: Vec<AnnounceEntry>) {
        // stable: order within a tier is kept
        entries.sort_by_key(|e| e.tier);
        self.entries = entries;
    }

    /// Set credentials sent with every announce
    pub fn set_login(&mut self, username: String, password: String) {
        self.login = Some((username, password));
    }

    /// Credentials sent with every announce
    pub fn login(&self) -> Option<&(String, String)> {
        self.login.as_ref()
    }

    /// Announce immediately, or after `delay` regardless of the tracker's interval
    ///
    /// A later call replaces any pending override.
    pub fn force_reannounce(&mut self, delay: Option<Duration>, now: Instant) {
        match delay {
            Some(delay) => {
                self.next_announce = now + delay;
                self.override_until = Some(now + delay);
            }
            None => {
                self.next_announce = now;
                self.override_until = None;
            }
        }
        debug!("Forced reannounce in {:?}", self.next_announce.saturating_duration_since(now));
    }

    /// Whether an announce should be sent now
    pub fn is_due(&self, now: Instant) -> bool {
        !self.entries.is_empty() && self.next_announce <= now
    }

    /// Build the next announce and push the schedule forward
    ///
    /// The first announce of a session always carries `Started`.
    pub fn next_request(
        &mut self,
        info_hash: InfoHash,
        event: AnnounceEvent,
        totals: (u64, u64, u64),
        now: Instant,
    ) -> Option<AnnounceRequest> {
        if self.entries.is_empty() {
            return None;
        }
        let index = *self.current.get_or_insert(0);
        let event = if !self.started_sent && event != AnnounceEvent::Stopped {
            self.started_sent = true;
            AnnounceEvent::Started
        } else {
            event
        };
        if event == AnnounceEvent::Stopped {
            self.started_sent = false;
        }
        self.next_announce = now + self.interval;
        self.override_until = None;

        let (uploaded, downloaded, left) = totals;
        Some(AnnounceRequest {
            info_hash,
            url: self.entries[index].url.clone(),
            event,
            login: self.login.clone(),
            uploaded,
            downloaded,
            left,
        })
    }

    /// Record a successful announce
    pub fn on_reply(
        &mut self,
        url: &str,
        interval: Option<Duration>,
        complete: Option<i32>,
        incomplete: Option<i32>,
        now: Instant,
    ) {
        let Some(index) = self.entries.iter().position(|e| e.url == url) else {
            debug!("Ignoring reply from unknown tracker {}", url);
            return;
        };
        let entry = &mut self.entries[index];
        entry.fails = 0;
        entry.last_success = Some(now);
        entry.message = None;
        self.current = Some(index);

        if let Some(interval) = interval.filter(|i| !i.is_zero()) {
            self.interval = interval;
        }
        self.num_complete = complete.unwrap_or(-1);
        self.num_incomplete = incomplete.unwrap_or(-1);
        self.reschedule(now + self.interval, now);
    }

    /// Record a failed announce and move on to the next tracker
    pub fn on_error(&mut self, url: &str, message: String, now: Instant) {
        let Some(index) = self.entries.iter().position(|e| e.url == url) else {
            debug!("Ignoring error from unknown tracker {}", url);
            return;
        };
        let entry = &mut self.entries[index];
        entry.fails += 1;
        entry.last_failure = Some(now);
        warn!("Tracker {} failed ({} in a row): {}", url, entry.fails, message);
        entry.message = Some(message);

        self.current = Some((index + 1) % self.entries.len());
        self.reschedule(now + self.retry_interval, now);
    }

    // An unexpired forced reannounce wins over the regular schedule
    fn reschedule(&mut self, at: Instant, now: Instant) {
        match self.override_until {
            Some(until) if until > now => self.next_announce = until,
            _ => {
                self.override_until = None;
                self.next_announce = at;
            }
        }
    }

    /// URL of the tracker currently in use, empty before the first announce
    pub fn current_tracker(&self) -> String {
        self.current
            .and_then(|i| self.entries.get(i))
            .map(|e| e.url.clone())
            .unwrap_or_default()
    }

    /// Time until the next announce
    pub fn next_announce_in(&self, now: Instant) -> Duration {
        self.next_announce.saturating_duration_since(now)
    }

    /// Announce interval currently in effect
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Seeds reported by the last scrape, -1 if unknown
    pub fn num_complete(&self) -> i32 {
        self.num_complete
    }

    /// Leechers reported by the last scrape, -1 if unknown
    pub fn num_incomplete(&self) -> i32 {
        self.num_incomplete
    }
}
