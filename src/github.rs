use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{Repository, RepositoryLister};

/// Hard stop for providers that never return a short page
pub const MAX_PAGES: u32 = 1000;

/// GitHub client wrapper with authentication management
pub struct GitHubClient {
    client: Octocrab,
    account: Option<String>,
    token: String,
    web_url: String,
    page_size: u32,
}

/// GitHub authentication strategies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Token from the config file or GITHUB_TOKEN
    ConfiguredToken,
    /// Use GitHub CLI authentication
    GitHubCLI,
}

#[derive(Serialize)]
struct ListParams {
    per_page: u32,
    page: u32,
    sort: &'static str,
    direction: &'static str,
    affiliation: &'static str,
}

#[derive(Debug, Deserialize)]
struct RepoPayload {
    name: String,
    owner: Option<OwnerPayload>,
    clone_url: Option<String>,
    #[serde(default)]
    private: bool,
    default_branch: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct OwnerPayload {
    login: String,
}

impl GitHubClient {
    /// Create a new GitHub client, resolving the token from config, env or gh CLI
    pub fn new(config: &Config) -> Result<Self> {
        let (auth_strategy, token) = Self::detect_authentication(config)?;
        info!("Using authentication strategy: {:?}", auth_strategy);

        let client = Octocrab::builder()
            .base_uri(config.github.api_url.as_str())
            .context("Invalid GitHub API URL")?
            .personal_token(token.clone())
            .build()
            .context("Failed to create GitHub client")?;

        Ok(Self::from_parts(client, config, token))
    }

    /// Assemble a client around an already-built octocrab instance
    pub fn from_parts(client: Octocrab, config: &Config, token: String) -> Self {
        Self {
            client,
            account: config.github.account.clone(),
            token,
            web_url: config.github.web_url.trim_end_matches('/').to_string(),
            page_size: config.github.page_size.clamp(1, 100),
        }
    }

    /// Detect and obtain GitHub authentication
    pub fn detect_authentication(config: &Config) -> Result<(AuthStrategy, String)> {
        let configured = config
            .github
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        match config.github.auth_method.as_str() {
            "auto" => {
                if let Some(token) = configured {
                    Ok((AuthStrategy::ConfiguredToken, token))
                } else if let Ok(token) = Self::try_github_cli() {
                    Ok((AuthStrategy::GitHubCLI, token))
                } else {
                    Err(anyhow!(
                        "No GitHub authentication found. Please either:\n\
                         1. Set GITHUB_TOKEN or github.token in the config file\n\
                         2. Install and authenticate GitHub CLI: gh auth login"
                    ))
                }
            }
            "gh_cli" => {
                let token = Self::try_github_cli()
                    .context("GitHub CLI authentication failed. Run: gh auth login")?;
                Ok((AuthStrategy::GitHubCLI, token))
            }
            "token" => {
                let token = configured
                    .context("github.token is not set and GITHUB_TOKEN is not in the environment")?;
                Ok((AuthStrategy::ConfiguredToken, token))
            }
            other => Err(anyhow!("Unknown auth method: {}", other)),
        }
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> Result<String> {
        debug!("Attempting GitHub CLI authentication");

        let token_output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("GitHub CLI (gh) is not installed")?;

        if !token_output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&token_output.stderr).trim()
            ));
        }

        let token = String::from_utf8(token_output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        debug!("Successfully obtained token from GitHub CLI");
        Ok(token)
    }

    /// Token used for private clones and archive downloads
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn web_url(&self) -> &str {
        &self.web_url
    }

    /// Login of the account the token belongs to
    pub async fn whoami(&self) -> Result<String> {
        let user = self
            .client
            .current()
            .user()
            .await
            .context("Failed to get current user information. Check your authentication.")?;
        Ok(user.login)
    }

    /// Configured account when it differs from the token's login
    pub fn mismatched_account(&self, login: &str) -> Option<&str> {
        self.account
            .as_deref()
            .filter(|account| !account.eq_ignore_ascii_case(login))
    }

    /// Listing always covers the token owner, so flag a different configured account
    async fn warn_on_account_mismatch(&self) {
        if self.account.is_none() {
            return;
        }
        match self.whoami().await {
            Ok(login) => {
                if let Some(account) = self.mismatched_account(&login) {
                    warn!(
                        "GitHub token belongs to '{}' but the configured account is '{}'; backing up '{}'",
                        login, account, login
                    );
                }
            }
            Err(e) => debug!("Could not confirm the token owner: {:#}", e),
        }
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<Repository>> {
        let params = ListParams {
            per_page: self.page_size,
            page,
            sort: "updated",
            direction: "desc",
            affiliation: "owner",
        };

        let payload: Vec<RepoPayload> = self
            .client
            .get("/user/repos", Some(&params))
            .await
            .with_context(|| format!("Failed to fetch repositories page {}", page))?;

        debug!("Page {} returned {} repositories", page, payload.len());
        Ok(payload.into_iter().map(|p| self.to_repository(p)).collect())
    }

    fn to_repository(&self, payload: RepoPayload) -> Repository {
        let owner = payload
            .owner
            .map(|o| o.login)
            .or_else(|| self.account.clone())
            .unwrap_or_default();
        let clone_url = payload
            .clone_url
            .unwrap_or_else(|| format!("{}/{}/{}.git", self.web_url, owner, payload.name));

        Repository {
            name: payload.name,
            owner,
            clone_url,
            private: payload.private,
            default_branch: payload.default_branch,
            updated_at: payload.updated_at,
        }
    }
}

#[async_trait]
impl RepositoryLister for GitHubClient {
    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        debug!(
            "Fetching repositories for: {}",
            self.account.as_deref().unwrap_or("authenticated user")
        );

        self.warn_on_account_mismatch().await;

        let repositories = paginate(self.page_size, MAX_PAGES, |page| self.fetch_page(page)).await?;

        info!("Found {} repositories", repositories.len());
        Ok(repositories)
    }
}

/// Collect pages starting at 1 until one comes back shorter than `page_size`
///
/// Provider order is preserved. The first failing page aborts the whole listing.
pub async fn paginate<T, F, Fut>(page_size: u32, max_pages: u32, mut fetch_page: F) -> Result<Vec<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let page_size = page_size.max(1) as usize;
    let mut items = Vec::new();
    let mut page = 1u32;

    loop {
        let batch = fetch_page(page).await?;
        let short = batch.len() < page_size;
        items.extend(batch);

        if short {
            break;
        }
        if page >= max_pages {
            warn!("Reached maximum pagination limit ({} pages)", max_pages);
            break;
        }
        page += 1;
    }

    Ok(items)
}
