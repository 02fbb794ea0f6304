//! RepoVault - Scheduled GitHub repository backups to Google Drive
//!
//! RepoVault enumerates every repository of a GitHub account, packages each
//! one as a dated zip archive, uploads the archives to Google Drive and
//! deletes remote archives that have outlived the retention window.
//!
//! ## Core Features
//!
//! - **Repository Discovery**: Paginated listing through the GitHub API
//! - **Resilient Fetching**: Shallow clone with a zip-download fallback
//! - **Drive Uploads**: OAuth2 refresh-token flow with a single retry on auth errors
//! - **Retention**: Expired archives are swept after every run
//! - **Service Mode**: Interval scheduler plus an HTTP control surface
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`backup`]: The end-to-end run and its run lock
//! - [`github`]: GitHub API integration and authentication
//! - [`drive`]: Google Drive archive store
//! - [`server`]: HTTP control surface

pub mod archive;
pub mod backup;
pub mod config;
pub mod credentials;
pub mod daemon;
pub mod discovery;
pub mod drive;
pub mod error;
pub mod fetch;
pub mod git;
pub mod github;
pub mod health;
pub mod history;
pub mod retention;
pub mod server;
pub mod status;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use archive::Archiver;
pub use backup::{BackupError, BackupOrchestrator, BackupSummary, RepoOutcome};
pub use config::Config;
pub use daemon::Scheduler;
pub use discovery::{Repository, RepositoryLister};
pub use drive::DriveClient;
pub use error::DriveError;
pub use fetch::RepositoryFetcher;
pub use git::GitClient;
pub use github::GitHubClient;
pub use health::HealthCheck;
pub use history::RunHistory;
pub use status::{RunPhase, RunStatus, StatusHandle, TriggerSource};
pub use storage::{ArchiveStore, RemoteArchive};
