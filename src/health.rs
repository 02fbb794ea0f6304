//! System health checks for RepoVault
//!
//! Preflight checks run by `repovault doctor` to verify that git, both
//! providers and local storage are usable before the first backup.

use crate::drive::DriveClient;
use crate::git::GitClient;
use crate::history::RunHistory;
use crate::{Config, GitHubClient};
use std::path::Path;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// GitHub authentication status
    pub github_auth: CheckResult,
    /// Google Drive credential status
    pub drive_auth: CheckResult,
    /// Upload folder (warning only, uploads go to the Drive root without one)
    pub drive_folder: CheckResult,
    /// Working directory status
    pub working_dir: CheckResult,
    /// Run history database (warning only)
    pub history: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        Self {
            git: Self::check_git().await,
            github_auth: Self::check_github_auth(config).await,
            drive_auth: Self::check_drive_auth(config).await,
            drive_folder: Self::check_drive_folder(config),
            working_dir: Self::check_working_dir(config).await,
            history: Self::check_history(config),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, r)| r.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.is_warning)
            .collect()
    }

    async fn check_git() -> CheckResult {
        match GitClient::version().await {
            Ok(version) => CheckResult::ok_with_details("Git installed", version),
            Err(e) => CheckResult::error_with_details(
                format!("{}", e),
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    async fn check_github_auth(config: &Config) -> CheckResult {
        let client = match GitHubClient::new(config) {
            Ok(client) => client,
            Err(e) => {
                return CheckResult::error_with_details(
                    "GitHub authentication not configured",
                    format!("{:#}\nSet GITHUB_TOKEN or run: gh auth login", e),
                )
            }
        };

        match client.whoami().await {
            Ok(login) => match client.mismatched_account(&login) {
                Some(account) => CheckResult::warning_with_details(
                    "GitHub token belongs to a different account",
                    format!(
                        "Token user: {}\nConfigured account: {}\nRepositories of {} will be backed up",
                        login, account, login
                    ),
                ),
                None => CheckResult::ok_with_details(
                    "GitHub authentication successful",
                    format!("Username: {}", login),
                ),
            },
            Err(e) => CheckResult::error_with_details("GitHub authentication failed", format!("{:#}", e)),
        }
    }

    async fn check_drive_auth(config: &Config) -> CheckResult {
        let drive = match DriveClient::from_config(config) {
            Ok(drive) => drive,
            Err(e) => {
                return CheckResult::error_with_details(
                    "Google Drive credentials not configured",
                    format!("{:#}", e),
                )
            }
        };

        match drive.about().await {
            Ok(about) => {
                let user = &about["user"];
                let account = user["emailAddress"]
                    .as_str()
                    .or_else(|| user["displayName"].as_str())
                    .unwrap_or("unknown account");
                CheckResult::ok_with_details(
                    "Google Drive access verified",
                    format!("Account: {}", account),
                )
            }
            Err(e) => CheckResult::error_with_details(
                "Google Drive access failed",
                format!("{}\nCheck the client credentials and refresh token", e),
            ),
        }
    }

    fn check_drive_folder(config: &Config) -> CheckResult {
        match config.drive.folder_id.as_deref() {
            Some(folder) if !folder.is_empty() => {
                CheckResult::ok_with_details("Upload folder configured", folder.to_string())
            }
            _ => CheckResult::warning_with_details(
                "No upload folder configured",
                "Archives will be written to the Drive root. Set drive.folder_id or GOOGLE_DRIVE_FOLDER_ID",
            ),
        }
    }

    /// Working storage must be creatable and writable
    async fn check_working_dir(config: &Config) -> CheckResult {
        let dir = config.working_directory();
        let probe = dir.join(".repovault-probe");

        let result = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&probe, b"ok").await?;
            tokio::fs::remove_file(&probe).await
        }
        .await;

        match result {
            Ok(()) => CheckResult::ok_with_details("Working directory writable", dir.display().to_string()),
            Err(e) => CheckResult::error_with_details(
                "Working directory not writable",
                format!("{}: {}", dir.display(), e),
            ),
        }
    }

    fn check_history(config: &Config) -> CheckResult {
        if !config.history.enabled {
            return CheckResult::warning_with_details(
                "Run history disabled",
                "Enable history.enabled to keep a record of past runs",
            );
        }

        match RunHistory::open_at(Path::new(&config.history.database)) {
            Ok(history) => match history.last_unfinished_run() {
                Ok(Some(id)) => CheckResult::warning_with_details(
                    "Previous run did not finish",
                    format!("Run #{} has no recorded outcome", id),
                ),
                Ok(None) => CheckResult::ok("Run history available"),
                Err(e) => CheckResult::warning_with_details("Run history unreadable", format!("{:#}", e)),
            },
            Err(e) => CheckResult::warning_with_details(
                "Run history database unavailable",
                format!("{:#}", e),
            ),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 6] {
        [
            ("Git Installation", &self.git),
            ("GitHub Authentication", &self.github_auth),
            ("Google Drive Access", &self.drive_auth),
            ("Upload Folder", &self.drive_folder),
            ("Working Directory", &self.working_dir),
            ("Run History", &self.history),
        ]
    }
}
