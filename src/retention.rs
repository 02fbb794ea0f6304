//! Expiry of remote archives older than the retention window

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::storage::{ArchiveStore, RemoteArchive};

/// Outcome of one sweep
///
/// `deleted.len() + kept + errors.len()` equals the number of archives listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    pub kept: usize,
    pub errors: Vec<(String, String)>,
    pub dry_run: bool,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.deleted.len() + self.kept + self.errors.len()
    }
}

/// Whether `archive` is strictly older than `window` at `now`
///
/// Archives without any timestamp are never expired.
pub fn is_expired(archive: &RemoteArchive, window: Duration, now: DateTime<Utc>) -> bool {
    let Some(modified) = archive.last_modified() else {
        return false;
    };
    let Ok(window) = chrono::Duration::from_std(window) else {
        return false;
    };
    now - modified > window
}

/// List every remote archive and delete the expired ones
///
/// A listing failure aborts the sweep; individual deletion failures are collected.
pub async fn sweep(
    store: &dyn ArchiveStore,
    window: Duration,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<SweepReport> {
    let archives = store
        .list_archives()
        .await
        .context("Retention sweep could not list archives")?;

    let mut report = SweepReport {
        dry_run,
        ..SweepReport::default()
    };

    for archive in archives {
        if !is_expired(&archive, window, now) {
            debug!("Keeping {}", archive.name);
            report.kept += 1;
            continue;
        }

        if dry_run {
            info!("Would delete expired archive {}", archive.name);
            report.deleted.push(archive.name);
            continue;
        }

        match store.delete(&archive.id).await {
            Ok(()) => {
                info!("Deleted expired archive {}", archive.name);
                report.deleted.push(archive.name);
            }
            Err(e) => {
                warn!("Failed to delete {}: {:#}", archive.name, e);
                report.errors.push((archive.name, format!("{:#}", e)));
            }
        }
    }

    info!(
        "Sweep finished: {} deleted, {} kept, {} errors",
        report.deleted.len(),
        report.kept,
        report.errors.len()
    );
    Ok(report)
}
