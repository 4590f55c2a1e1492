//! Per-tag outcomes and the report of one sync run

use crate::error::SyncerError;
use crate::sync::SyncMapping;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Synced,
    SkippedExists,
    Failed,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::Synced => "synced",
            SyncStatus::SkippedExists => "skipped-exists",
            SyncStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Result for one (mapping, tag) pair
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub mapping: Arc<SyncMapping>,
    /// `None` only when the mapping failed before its tags were known
    pub tag: Option<String>,
    pub status: SyncStatus,
    pub digest: Option<String>,
    pub error: Option<SyncerError>,
}

impl SyncOutcome {
    pub fn synced(mapping: Arc<SyncMapping>, tag: String, digest: String) -> Self {
        Self {
            mapping,
            tag: Some(tag),
            status: SyncStatus::Synced,
            digest: Some(digest),
            error: None,
        }
    }

    pub fn skipped(mapping: Arc<SyncMapping>, tag: String, digest: Option<String>) -> Self {
        Self {
            mapping,
            tag: Some(tag),
            status: SyncStatus::SkippedExists,
            digest,
            error: None,
        }
    }

    pub fn failed(mapping: Arc<SyncMapping>, tag: Option<String>, error: SyncerError) -> Self {
        Self {
            mapping,
            tag,
            status: SyncStatus::Failed,
            digest: None,
            error: Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == SyncStatus::Failed
    }
}

/// Everything one `sync_all` run did, in mapping then tag order
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub outcomes: Vec<SyncOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            outcomes: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }

    pub fn count(&self, status: SyncStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn synced(&self) -> usize {
        self.count(SyncStatus::Synced)
    }

    pub fn skipped(&self) -> usize {
        self.count(SyncStatus::SkippedExists)
    }

    pub fn failed(&self) -> usize {
        self.count(SyncStatus::Failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SyncOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn duration(&self) -> std::time::Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} synced, {} skipped, {} failed",
            self.synced(),
            self.skipped(),
            self.failed()
        )
    }
}
