//! Tracker bookkeeping
//!
//! The tracker list of a transfer and the announce schedule kept against it.

pub mod entry;
pub mod state;

pub use entry::AnnounceEntry;
pub use state::{AnnounceEvent, AnnounceRequest, TrackerState};
