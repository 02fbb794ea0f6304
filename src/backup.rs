//! Backup Orchestrator - one end-to-end run of the pipeline
//!
//! verify storage access → list repositories → for each repository
//! fetch → archive → upload → drop local files → sweep expired remote
//! archives → clear working storage.
//!
//! Runs never overlap: both the scheduler and manual triggers go through the
//! same run lock, and the `running` status is published while the lock is held.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archive::Archiver;
use crate::config::Config;
use crate::discovery::{Repository, RepositoryLister};
use crate::drive::DriveClient;
use crate::error::is_credential_rejected;
use crate::fetch::{remove_if_exists, RepositoryFetcher};
use crate::github::GitHubClient;
use crate::history::{RunFinish, RunHistory};
use crate::retention::{self, SweepReport};
use crate::status::{RunPhase, RunStatus, StatusHandle, TriggerSource};
use crate::storage::{ArchiveStore, RemoteArchive};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("A backup run is already in progress")]
    AlreadyRunning,

    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

/// Result of one repository within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoOutcome {
    pub repository: String,
    pub strategy: Option<String>,
    pub remote_id: Option<String>,
    pub error: Option<String>,
}

impl RepoOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Results from a complete backup run
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<RepoOutcome>,
    pub sweep: SweepReport,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub working_root: PathBuf,
    pub retention: Duration,
}

impl BackupSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            working_root: config.working_directory(),
            retention: config.retention_window()?,
        })
    }
}

/// Proof that the run lock is held and `running` was published
pub struct RunTicket {
    _guard: OwnedMutexGuard<()>,
    trigger: TriggerSource,
    run_id: Option<i64>,
    started: Instant,
}

pub struct BackupOrchestrator {
    settings: BackupSettings,
    lister: Arc<dyn RepositoryLister>,
    fetcher: RepositoryFetcher,
    archiver: Archiver,
    store: Arc<dyn ArchiveStore>,
    status: StatusHandle,
    run_lock: Arc<Mutex<()>>,
    history: Option<Arc<RunHistory>>,
}

impl BackupOrchestrator {
    pub fn new(
        settings: BackupSettings,
        lister: Arc<dyn RepositoryLister>,
        fetcher: RepositoryFetcher,
        archiver: Archiver,
        store: Arc<dyn ArchiveStore>,
    ) -> Self {
        Self {
            settings,
            lister,
            fetcher,
            archiver,
            store,
            status: StatusHandle::new(),
            run_lock: Arc::new(Mutex::new(())),
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<RunHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Wire production components from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = BackupSettings::from_config(config)?;
        let github = GitHubClient::new(config)?;
        let fetcher = RepositoryFetcher::from_config(config, Some(github.token().to_string()))?;
        let drive = DriveClient::from_config(config)?;
        let archiver = Archiver::new(config.backup.compression_level);

        let mut orchestrator =
            Self::new(settings, Arc::new(github), fetcher, archiver, Arc::new(drive));

        if config.history.enabled {
            match RunHistory::open_at(Path::new(&config.history.database)) {
                Ok(history) => orchestrator = orchestrator.with_history(Arc::new(history)),
                Err(e) => warn!("Run history disabled: {:#}", e),
            }
        }

        Ok(orchestrator)
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    pub fn lister(&self) -> &Arc<dyn RepositoryLister> {
        &self.lister
    }

    pub fn store(&self) -> &Arc<dyn ArchiveStore> {
        &self.store
    }

    pub fn history(&self) -> Option<&Arc<RunHistory>> {
        self.history.as_ref()
    }

    pub fn retention(&self) -> Duration {
        self.settings.retention
    }

    /// Take the run lock and publish `running`; fails without touching status if held
    pub fn try_begin(&self, trigger: TriggerSource) -> Result<RunTicket, BackupError> {
        let guard = self
            .run_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| BackupError::AlreadyRunning)?;

        let now = Utc::now();
        self.status.publish(self.status.snapshot().started(trigger, now));

        let run_id = self.history.as_ref().and_then(|history| {
            history
                .record_run_start(trigger, now)
                .map_err(|e| warn!("Failed to record run start: {:#}", e))
                .ok()
        });

        info!("Backup run started ({})", trigger);
        Ok(RunTicket {
            _guard: guard,
            trigger,
            run_id,
            started: Instant::now(),
        })
    }

    /// Run the pipeline to completion in the current task
    pub async fn run(&self, trigger: TriggerSource) -> Result<BackupSummary, BackupError> {
        let ticket = self.try_begin(trigger)?;
        self.execute(ticket).await
    }

    /// Claim the run synchronously, then run the pipeline on a new task
    pub fn spawn_run(
        self: &Arc<Self>,
        trigger: TriggerSource,
    ) -> Result<JoinHandle<Result<BackupSummary, BackupError>>, BackupError> {
        let ticket = self.try_begin(trigger)?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.execute(ticket).await }))
    }

    async fn execute(&self, ticket: RunTicket) -> Result<BackupSummary, BackupError> {
        let mut outcomes = Vec::new();
        let result = self.pipeline(&ticket, &mut outcomes).await;

        if let Err(e) = remove_if_exists(&self.settings.working_root).await {
            warn!("Failed to clear working storage: {:#}", e);
        }

        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        let failed = outcomes.len() - succeeded;

        let (status, outcome) = match result {
            Ok(sweep) => {
                let last_error = (failed > 0).then(|| failure_summary(&outcomes));
                let status = RunStatus {
                    phase: RunPhase::Completed,
                    last_run_finished_at: Some(Utc::now()),
                    repositories_processed: succeeded,
                    repositories_failed: failed,
                    last_error,
                    last_sweep: Some(sweep.clone()),
                    ..(*self.status.snapshot()).clone()
                };
                let summary = BackupSummary {
                    total: outcomes.len(),
                    succeeded,
                    failed,
                    outcomes,
                    sweep,
                    duration: ticket.started.elapsed(),
                };
                info!(
                    "Backup completed in {:.2}s: {} succeeded, {} failed, {} expired archives deleted",
                    summary.duration.as_secs_f64(),
                    summary.succeeded,
                    summary.failed,
                    summary.sweep.deleted.len()
                );
                (status, Ok(summary))
            }
            Err(e) => {
                error!("Backup run failed: {:#}", e);
                let status = RunStatus {
                    phase: RunPhase::Failed,
                    last_run_finished_at: Some(Utc::now()),
                    repositories_processed: succeeded,
                    repositories_failed: failed,
                    last_error: Some(format!("{:#}", e)),
                    ..(*self.status.snapshot()).clone()
                };
                (status, Err(BackupError::Fatal(e)))
            }
        };

        if let (Some(history), Some(run_id)) = (&self.history, ticket.run_id) {
            let finish = RunFinish {
                phase: status.phase,
                processed: status.repositories_processed,
                failed: status.repositories_failed,
                swept: outcome.as_ref().ok().map(|s| s.sweep.deleted.len()),
                error: status.last_error.as_deref(),
            };
            if let Err(e) = history.record_run_finish(run_id, &finish) {
                warn!("Failed to record run finish: {:#}", e);
            }
        }

        debug!("Publishing final status for {} run", ticket.trigger);
        self.status.publish(status);
        outcome
    }

    async fn pipeline(&self, ticket: &RunTicket, outcomes: &mut Vec<RepoOutcome>) -> Result<SweepReport> {
        let root = &self.settings.working_root;

        self.store
            .verify_access()
            .await
            .context("Storage access check failed")?;

        let repositories = self
            .lister
            .list_repositories()
            .await
            .context("Failed to list repositories")?;
        info!("Backing up {} repositories", repositories.len());

        remove_if_exists(root).await?;
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("Failed to create working storage {}", root.display()))?;

        for repo in &repositories {
            let mut strategy = None;
            let result = self.process(repo, root, &mut strategy).await;

            let outcome = RepoOutcome {
                repository: repo.name.clone(),
                strategy: strategy.map(str::to_string),
                remote_id: result.as_ref().ok().map(|r| r.id.clone()),
                error: result.as_ref().err().map(|e| format!("{:#}", e)),
            };

            if let (Some(history), Some(run_id)) = (&self.history, ticket.run_id) {
                if let Err(e) = history.record_outcome(run_id, &outcome) {
                    warn!("Failed to record outcome for {}: {:#}", repo.name, e);
                }
            }
            outcomes.push(outcome);

            let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
            let failed = outcomes.len() - succeeded;
            self.status.update(|s| {
                s.repositories_processed = succeeded;
                s.repositories_failed = failed;
            });

            if let Err(e) = result {
                if is_credential_rejected(&e) {
                    return Err(e.context(format!("Aborting run while backing up {}", repo.name)));
                }
                warn!("Backup of {} failed: {:#}", repo.full_name(), e);
            }
        }

        retention::sweep(self.store.as_ref(), self.settings.retention, Utc::now(), false).await
    }

    /// fetch → archive → drop working copy → upload → drop archive
    async fn process(
        &self,
        repo: &Repository,
        root: &Path,
        strategy: &mut Option<&'static str>,
    ) -> Result<RemoteArchive> {
        let copy = self.fetcher.fetch(repo, root).await?;
        *strategy = Some(copy.strategy);

        let archived = self.archiver.archive(&repo.name, &copy, root).await;
        if let Err(e) = remove_if_exists(&copy.path).await {
            warn!("Failed to remove working copy of {}: {:#}", repo.name, e);
        }
        let archive_path = archived.with_context(|| format!("Failed to archive {}", repo.name))?;

        let remote = self.store.upload(&archive_path).await?;

        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            warn!("Failed to remove {}: {}", archive_path.display(), e);
        }

        info!("Backed up {} as {}", repo.full_name(), remote.name);
        Ok(remote)
    }
}

fn failure_summary(outcomes: &[RepoOutcome]) -> String {
    let failures: Vec<String> = outcomes
        .iter()
        .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.repository, e)))
        .collect();
    format!("{} repositories failed: {}", failures.len(), failures.join("; "))
}
