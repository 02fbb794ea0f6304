//! Remote archive storage abstraction
//!
//! The orchestrator and the retention sweeper only talk to [`ArchiveStore`];
//! Google Drive is the production implementation ([`crate::drive`]).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An archive as known to the storage provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteArchive {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
}

impl RemoteArchive {
    /// Timestamp used for retention: modified time, else created time
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.modified_time.or(self.created_time)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Cheap read-only probe; refreshes credentials when they were rejected
    async fn verify_access(&self) -> Result<()>;

    /// Upload a local archive file
    async fn upload(&self, path: &Path) -> Result<RemoteArchive>;

    /// Every archive visible to the store, all pages materialized
    async fn list_archives(&self) -> Result<Vec<RemoteArchive>>;

    async fn delete(&self, id: &str) -> Result<()>;
}
