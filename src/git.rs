use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

/// Thin wrapper around the `git` binary for shallow clones
#[derive(Debug, Clone)]
pub struct GitClient {
    timeout: Duration,
}

impl GitClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// `git clone --depth 1 --single-branch <url> <target>`
    ///
    /// The child is killed if the timeout elapses. Errors never contain the
    /// credentials embedded in `url`.
    pub async fn shallow_clone(&self, url: &str, target: &Path) -> Result<()> {
        info!("Cloning {} -> {}", redact(url), target.display());

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create parent directory")?;
        }

        let child = AsyncCommand::new("git")
            .args(["clone", "--depth", "1", "--single-branch", "--quiet"])
            .arg(url)
            .arg(target)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to execute git clone")?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("git clone timed out after {}s", self.timeout.as_secs()))?
            .context("Failed to wait for git clone")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Git clone failed: {}", redact(stderr.trim())));
        }

        debug!("Clone finished: {}", target.display());
        Ok(())
    }

    /// Installed git version, e.g. "git version 2.43.0"
    pub async fn version() -> Result<String> {
        let output = AsyncCommand::new("git")
            .arg("--version")
            .output()
            .await
            .context("Git not found in PATH")?;

        if !output.status.success() {
            return Err(anyhow!("Git command failed"));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Embed a token into an HTTPS clone URL as `x-access-token:<token>@host`
pub fn authenticated_url(clone_url: &str, token: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(clone_url)
        .with_context(|| format!("Invalid clone URL: {}", clone_url))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(anyhow!("Cannot embed credentials in {} URL", url.scheme()));
    }

    url.set_username("x-access-token")
        .map_err(|_| anyhow!("Cannot set username on clone URL"))?;
    url.set_password(Some(token))
        .map_err(|_| anyhow!("Cannot set password on clone URL"))?;

    Ok(url.to_string())
}

/// Replace `user:secret@` userinfo in any URL within `text`
pub fn redact(text: &str) -> String {
    static USERINFO: OnceLock<Option<Regex>> = OnceLock::new();

    match USERINFO.get_or_init(|| Regex::new(r"(?P<scheme>[a-zA-Z][a-zA-Z0-9+.-]*://)[^/@\s]+@").ok()) {
        Some(re) => re.replace_all(text, "${scheme}***@").into_owned(),
        None => text.to_string(),
    }
}
