//! SyncerD library
//!
//! Keeps destination registries in step with Docker Hub: registry backends,
//! the content store images pass through, the sync orchestration and the
//! cron scheduler that drives it.

pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{Result, SyncFailure, SyncerError};
pub use registry::{Registry, RegistryFactory, RegistryResolver};
pub use scheduler::{Scheduler, SyncJob};
pub use store::ContentStore;
pub use sync::{SyncMapping, SyncOutcome, SyncReport, SyncStatus, Syncer};
