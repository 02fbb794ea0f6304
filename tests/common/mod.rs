/// Common test utilities and helpers for RepoVault integration tests
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repovault::{ArchiveStore, RemoteArchive, Repository, RepositoryLister};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

/// Lister returning a fixed set of repositories
pub struct StaticLister(pub Vec<Repository>);

#[async_trait]
impl RepositoryLister for StaticLister {
    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.0.clone())
    }
}

pub fn repository(name: &str, clone_url: &str) -> Repository {
    Repository {
        name: name.to_string(),
        owner: "octocat".to_string(),
        clone_url: clone_url.to_string(),
        private: false,
        default_branch: Some("main".to_string()),
        updated_at: None,
    }
}

/// Archive store backed by a local directory
pub struct DirectoryStore {
    root: PathBuf,
    index: Mutex<Vec<RemoteArchive>>,
}

impl DirectoryStore {
    pub fn new(root: &Path) -> Self {
        std::fs::create_dir_all(root).expect("Failed to create store dir");
        Self {
            root: root.to_path_buf(),
            index: Mutex::new(Vec::new()),
        }
    }

    /// Place an archive with a chosen modification time
    pub fn seed(&self, name: &str, modified: DateTime<Utc>) {
        std::fs::write(self.root.join(name), b"old").expect("Failed to seed archive");
        self.index.lock().unwrap().push(RemoteArchive {
            id: name.to_string(),
            name: name.to_string(),
            modified_time: Some(modified),
            created_time: None,
        });
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.lock().unwrap().iter().map(|a| a.name.clone()).collect();
        names.sort();
        names
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl ArchiveStore for DirectoryStore {
    async fn verify_access(&self) -> Result<()> {
        anyhow::ensure!(self.root.is_dir(), "store directory missing");
        Ok(())
    }

    async fn upload(&self, path: &Path) -> Result<RemoteArchive> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("archive has no file name")?
            .to_string();
        std::fs::copy(path, self.root.join(&name))?;

        let archive = RemoteArchive {
            id: name.clone(),
            name,
            modified_time: Some(Utc::now()),
            created_time: None,
        };
        let mut index = self.index.lock().unwrap();
        index.retain(|a| a.name != archive.name);
        index.push(archive.clone());
        Ok(archive)
    }

    async fn list_archives(&self) -> Result<Vec<RemoteArchive>> {
        Ok(self.index.lock().unwrap().clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        std::fs::remove_file(self.root.join(id))?;
        self.index.lock().unwrap().retain(|a| a.id != id);
        Ok(())
    }
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=RepoVault Tests", "-c", "user.email=tests@example.com"])
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .status()
        .expect("Failed to run git");
    assert!(status.success(), "git {:?} failed", args);
}

/// Create a one-commit repository at `dir` and return its file:// URL
pub fn init_git_repo(dir: &Path, files: &[(&str, &str)]) -> String {
    std::fs::create_dir_all(dir).expect("Failed to create repo dir");
    git(dir, &["init", "-q"]);
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "initial"]);

    format!("file://{}", dir.display())
}

/// Minimal YAML configuration rooted in a temp directory
pub fn write_config(dir: &Path) -> PathBuf {
    let config_path = dir.join("config.yml");
    let content = format!(
        r#"
backup:
  working_directory: "{work}"
  retention: "2d"
history:
  enabled: true
  database: "{db}"
server:
  enabled: false
"#,
        work = dir.join("work").display(),
        db = dir.join("history.db").display(),
    );
    std::fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}
