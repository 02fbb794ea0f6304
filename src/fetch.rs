//! Materializes one repository's content on local working storage
//!
//! [`RepositoryFetcher`] walks an ordered list of [`AcquisitionStrategy`]
//! implementations (shallow clone first, source archive download second) and
//! reports which one produced the working copy.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::archive;
use crate::config::Config;
use crate::discovery::Repository;
use crate::git::{authenticated_url, redact, GitClient};

/// Directory holding one repository's files, plus the strategy that made it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingCopy {
    pub path: PathBuf,
    pub strategy: &'static str,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Populate `dest` with the repository's files; `dest` does not exist on entry
    async fn acquire(&self, repo: &Repository, dest: &Path) -> Result<()>;
}

/// `git clone --depth 1` of the default branch
pub struct ShallowClone {
    git: GitClient,
    token: Option<String>,
    keep_git_metadata: bool,
}

impl ShallowClone {
    pub fn new(git: GitClient, token: Option<String>, keep_git_metadata: bool) -> Self {
        Self {
            git,
            token,
            keep_git_metadata,
        }
    }
}

#[async_trait]
impl AcquisitionStrategy for ShallowClone {
    fn name(&self) -> &'static str {
        "shallow-clone"
    }

    async fn acquire(&self, repo: &Repository, dest: &Path) -> Result<()> {
        let url = match (&self.token, repo.private) {
            (Some(token), true) => authenticated_url(&repo.clone_url, token)?,
            _ => repo.clone_url.clone(),
        };

        self.git.shallow_clone(&url, dest).await?;

        if !self.keep_git_metadata {
            let git_dir = dest.join(".git");
            if git_dir.exists() {
                tokio::fs::remove_dir_all(&git_dir)
                    .await
                    .with_context(|| format!("Failed to remove {}", git_dir.display()))?;
            }
        }
        Ok(())
    }
}

/// Downloads `<web>/<owner>/<name>/archive/refs/heads/<branch>.zip` and unpacks it
pub struct ArchiveDownload {
    http: reqwest::Client,
    web_url: String,
    token: Option<String>,
    max_redirects: usize,
}

impl ArchiveDownload {
    pub fn new(web_url: impl Into<String>, token: Option<String>, max_redirects: usize, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            web_url: web_url.into().trim_end_matches('/').to_string(),
            token,
            max_redirects,
        })
    }

    pub fn archive_url(&self, repo: &Repository) -> String {
        format!(
            "{}/{}/{}/archive/refs/heads/{}.zip",
            self.web_url,
            repo.owner,
            repo.name,
            repo.branch()
        )
    }

    /// GET with manually followed redirects; the bearer token never leaves the original host
    async fn get_following_redirects(&self, url: &str) -> Result<reqwest::Response> {
        let origin = Url::parse(url).with_context(|| format!("Invalid archive URL: {}", url))?;
        let mut current = origin.clone();
        let mut hops = 0usize;

        loop {
            let mut request = self.http.get(current.clone());
            if let Some(token) = &self.token {
                if current.host_str() == origin.host_str() && current.port_or_known_default() == origin.port_or_known_default() {
                    request = request.bearer_auth(token);
                }
            }

            let response = request.send().await.context("Archive download request failed")?;
            let status = response.status();

            if matches!(
                status,
                StatusCode::MOVED_PERMANENTLY
                    | StatusCode::FOUND
                    | StatusCode::SEE_OTHER
                    | StatusCode::TEMPORARY_REDIRECT
                    | StatusCode::PERMANENT_REDIRECT
            ) {
                hops += 1;
                if hops > self.max_redirects {
                    bail!("Too many redirects (more than {})", self.max_redirects);
                }

                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| anyhow!("Redirect {} without a Location header", status))?;
                current = current
                    .join(location)
                    .with_context(|| format!("Invalid redirect location: {}", location))?;
                debug!("Following redirect to {}", current.host_str().unwrap_or_default());
                continue;
            }

            if !status.is_success() {
                bail!("Archive download failed with status {}", status);
            }
            return Ok(response);
        }
    }
}

/// Directory name the provider uses inside a branch archive
pub fn nested_directory_name(repo: &Repository) -> String {
    format!("{}-{}", repo.name, repo.branch().replace('/', "-"))
}

#[async_trait]
impl AcquisitionStrategy for ArchiveDownload {
    fn name(&self) -> &'static str {
        "archive-download"
    }

    async fn acquire(&self, repo: &Repository, dest: &Path) -> Result<()> {
        let root = dest
            .parent()
            .ok_or_else(|| anyhow!("Working copy has no parent: {}", dest.display()))?;
        tokio::fs::create_dir_all(root)
            .await
            .context("Failed to create working root")?;

        let download = root.join(format!("{}.download.zip", repo.name));
        let staging = root.join(format!("{}.extract", repo.name));

        let result = self.download_and_unpack(repo, dest, &download, &staging).await;

        let _ = tokio::fs::remove_file(&download).await;
        let _ = tokio::fs::remove_dir_all(&staging).await;
        result
    }
}

impl ArchiveDownload {
    async fn download_and_unpack(
        &self,
        repo: &Repository,
        dest: &Path,
        download: &Path,
        staging: &Path,
    ) -> Result<()> {
        let url = self.archive_url(repo);
        info!("Downloading source archive for {}", repo.full_name());

        let mut response = self.get_following_redirects(&url).await?;
        let mut file = tokio::fs::File::create(download)
            .await
            .with_context(|| format!("Failed to create {}", download.display()))?;

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.context("Archive download interrupted")? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        debug!("Downloaded {} bytes", written);

        if staging.exists() {
            tokio::fs::remove_dir_all(staging).await?;
        }
        archive::extract(download.to_path_buf(), staging.to_path_buf()).await?;

        let expected = staging.join(nested_directory_name(repo));
        let source = if expected.is_dir() {
            expected
        } else {
            single_top_level_dir(staging)?
        };

        tokio::fs::rename(&source, dest)
            .await
            .with_context(|| format!("Failed to move {} to {}", source.display(), dest.display()))?;
        Ok(())
    }
}

fn single_top_level_dir(dir: &Path) -> Result<PathBuf> {
    let mut entries = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect::<Vec<_>>();

    match (entries.pop(), entries.is_empty()) {
        (Some(only), true) if only.is_dir() => Ok(only),
        _ => bail!("Archive does not contain a single top-level directory"),
    }
}

/// Ordered strategies; the first success wins
pub struct RepositoryFetcher {
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
}

impl RepositoryFetcher {
    pub fn new(strategies: Vec<Box<dyn AcquisitionStrategy>>) -> Self {
        Self { strategies }
    }

    /// Production wiring: shallow clone, then source archive download
    pub fn from_config(config: &Config, token: Option<String>) -> Result<Self> {
        let git = GitClient::new(Duration::from_secs(config.backup.clone_timeout));
        let clone = ShallowClone::new(git, token.clone(), config.backup.keep_git_metadata);
        let download = ArchiveDownload::new(
            config.github.web_url.clone(),
            token,
            config.backup.max_redirects,
            Duration::from_secs(config.drive.request_timeout),
        )?;

        Ok(Self::new(vec![Box::new(clone), Box::new(download)]))
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn fetch(&self, repo: &Repository, root: &Path) -> Result<WorkingCopy> {
        let dest = root.join(&repo.name);
        let mut last_error = None;

        for strategy in &self.strategies {
            remove_if_exists(&dest).await?;

            match strategy.acquire(repo, &dest).await {
                Ok(()) => {
                    info!("Fetched {} via {}", repo.full_name(), strategy.name());
                    return Ok(WorkingCopy {
                        path: dest,
                        strategy: strategy.name(),
                    });
                }
                Err(e) => {
                    warn!(
                        "{} failed for {}: {}",
                        strategy.name(),
                        repo.full_name(),
                        redact(&format!("{:#}", e))
                    );
                    last_error = Some(e);
                }
            }
        }

        remove_if_exists(&dest).await?;
        match last_error {
            Some(e) => Err(e.context(format!("All acquisition strategies failed for {}", repo.full_name()))),
            None => bail!("No acquisition strategies configured"),
        }
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to clear {}", path.display())),
    }
}
