//! Synchronization orchestration

pub mod mapping;
pub mod report;
pub mod syncer;

pub use mapping::{SyncMapping, TagFilter};
pub use report::{SyncOutcome, SyncReport, SyncStatus};
pub use syncer::{SyncOptions, Syncer};
