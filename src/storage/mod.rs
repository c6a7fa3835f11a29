//! Storage module
//!
//! Piece and block accounting, selective download, resume data and the
//! storage backend the session drives.

pub mod backend;
pub mod bitfield;
pub mod file;
pub mod filter;
pub mod queue;
pub mod resume;

pub use backend::{SharedStorage, StorageBackend, StorageConstructor};
pub use file::FileStorage;
pub use filter::PieceFilter;
pub use queue::{BlockLayout, DownloadQueue, PartialPieceInfo, RequestOutcome, DEFAULT_BLOCK_SIZE};
pub use resume::{PieceState, ResumeData, ResumeManager};
