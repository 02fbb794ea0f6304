//! In-memory doubles shared by unit tests

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::archive::Archiver;
use crate::backup::{BackupOrchestrator, BackupSettings};
use crate::discovery::{Repository, RepositoryLister};
use crate::error::DriveError;
use crate::fetch::{AcquisitionStrategy, RepositoryFetcher};
use crate::storage::{ArchiveStore, RemoteArchive};

pub fn repo(name: &str) -> Repository {
    Repository {
        name: name.to_string(),
        owner: "octocat".to_string(),
        clone_url: format!("https://github.com/octocat/{}.git", name),
        private: false,
        default_branch: None,
        updated_at: None,
    }
}

pub struct StaticLister(pub Vec<Repository>);

impl StaticLister {
    pub fn named(names: &[&str]) -> Self {
        Self(names.iter().map(|n| repo(n)).collect())
    }
}

#[async_trait]
impl RepositoryLister for StaticLister {
    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.0.clone())
    }
}

/// Writes a couple of files, or fails for the configured names
pub struct FakeStrategy {
    pub failing: HashSet<String>,
}

#[async_trait]
impl AcquisitionStrategy for FakeStrategy {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn acquire(&self, repo: &Repository, dest: &Path) -> Result<()> {
        if self.failing.contains(&repo.name) {
            return Err(anyhow!("cannot reach {}", repo.name));
        }
        std::fs::create_dir_all(dest.join("src"))?;
        std::fs::write(dest.join("README.md"), format!("# {}\n", repo.name))?;
        std::fs::write(dest.join("src/main.rs"), "fn main() {}\n")?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub archives: Mutex<Vec<RemoteArchive>>,
    pub uploads: Mutex<Vec<String>>,
    pub list_calls: AtomicUsize,
    pub reject_credentials_on: Option<String>,
}

impl MemoryStore {
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn verify_access(&self) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, path: &Path) -> Result<RemoteArchive> {
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        if let Some(prefix) = &self.reject_credentials_on {
            if name.starts_with(prefix.as_str()) {
                return Err(DriveError::CredentialRejected("invalid_grant".to_string()).into());
            }
        }
        assert!(path.is_file(), "archive must exist at upload time");

        let archive = RemoteArchive {
            id: format!("id-{}", name),
            name: name.clone(),
            modified_time: Some(Utc::now()),
            created_time: None,
        };
        self.uploads.lock().unwrap().push(name);
        self.archives.lock().unwrap().push(archive.clone());
        Ok(archive)
    }

    async fn list_archives(&self) -> Result<Vec<RemoteArchive>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.archives.lock().unwrap().clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.archives.lock().unwrap().retain(|a| a.id != id);
        Ok(())
    }
}

/// Orchestrator over a static lister, fake fetch strategy and the given store
pub fn orchestrator(
    work: &TempDir,
    lister: Arc<dyn RepositoryLister>,
    store: Arc<MemoryStore>,
    failing: &[&str],
) -> BackupOrchestrator {
    let settings = BackupSettings {
        working_root: work.path().join("work"),
        retention: Duration::from_secs(2 * 86_400),
    };
    let fetcher = RepositoryFetcher::new(vec![Box::new(FakeStrategy {
        failing: failing.iter().map(|s| s.to_string()).collect(),
    })]);
    BackupOrchestrator::new(settings, lister, fetcher, Archiver::default(), store)
}

/// Minimal `GET /user` payload octocrab accepts
pub fn github_user_json(login: &str) -> serde_json::Value {
    serde_json::json!({
        "login": login,
        "id": 1,
        "node_id": "MDQ6VXNlcjE=",
        "avatar_url": "https://github.com/images/error/octocat_happy.gif",
        "gravatar_id": "",
        "url": format!("https://api.github.com/users/{}", login),
        "html_url": format!("https://github.com/{}", login),
        "followers_url": format!("https://api.github.com/users/{}/followers", login),
        "following_url": format!("https://api.github.com/users/{}/following{{/other_user}}", login),
        "gists_url": format!("https://api.github.com/users/{}/gists{{/gist_id}}", login),
        "starred_url": format!("https://api.github.com/users/{}/starred{{/owner}}{{/repo}}", login),
        "subscriptions_url": format!("https://api.github.com/users/{}/subscriptions", login),
        "organizations_url": format!("https://api.github.com/users/{}/orgs", login),
        "repos_url": format!("https://api.github.com/users/{}/repos", login),
        "events_url": format!("https://api.github.com/users/{}/events{{/privacy}}", login),
        "received_events_url": format!("https://api.github.com/users/{}/received_events", login),
        "type": "User",
        "site_admin": false
    })
}
