//! Repository enumeration abstraction
//!
//! The backup pipeline only needs a fully materialized list of repositories
//! for the configured account. Providers implement [`RepositoryLister`]; the
//! GitHub implementation lives in [`crate::github`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Branch assumed when the provider reports no default branch
pub const FALLBACK_BRANCH: &str = "main";

/// One repository of the backed-up account
///
/// Sourced fresh on every listing call and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    /// Repository name (e.g., "repovault")
    pub name: String,

    /// Owning account (e.g., "MKSG-MugunthKumar")
    pub owner: String,

    /// HTTPS clone URL
    pub clone_url: String,

    pub private: bool,

    pub default_branch: Option<String>,

    pub updated_at: Option<DateTime<Utc>>,
}

impl Repository {
    /// Get display name (owner/name format)
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Default branch, or `main` when the provider did not report one
    pub fn branch(&self) -> &str {
        self.default_branch
            .as_deref()
            .filter(|b| !b.is_empty())
            .unwrap_or(FALLBACK_BRANCH)
    }
}

/// Trait for enumerating the repositories that a run backs up
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryLister: Send + Sync {
    /// List every repository, preserving provider order
    ///
    /// Any page failure aborts the listing; partial results are never returned.
    async fn list_repositories(&self) -> Result<Vec<Repository>>;
}
