//! OAuth2 credential broker for the storage provider
//!
//! Holds the immutable refresh token from configuration and a short-lived
//! access token that is cached in memory and persisted to a plain-text file so
//! restarts do not force an exchange. Refreshes are serialized; a caller that
//! was rejected with a token somebody else already replaced gets the new token
//! without a second exchange.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DriveError, DriveResult};

/// Client registration and long-lived grant
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub redirect_uri: Option<String>,
    pub token_url: String,
}

impl OAuthSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let drive = &config.drive;
        Ok(Self {
            client_id: drive
                .client_id
                .clone()
                .context("drive.client_id is not set (GOOGLE_CLIENT_ID)")?,
            client_secret: drive
                .client_secret
                .clone()
                .context("drive.client_secret is not set (GOOGLE_CLIENT_SECRET)")?,
            refresh_token: drive
                .refresh_token
                .clone()
                .context("drive.refresh_token is not set (GOOGLE_REFRESH_TOKEN)")?,
            redirect_uri: drive.redirect_uri.clone(),
            token_url: drive.token_url.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct CredentialBroker {
    http: reqwest::Client,
    settings: OAuthSettings,
    token_file: PathBuf,
    access_token: RwLock<Option<String>>,
    refresh_lock: Mutex<()>,
}

impl CredentialBroker {
    pub fn new(http: reqwest::Client, settings: OAuthSettings, token_file: impl Into<PathBuf>) -> Self {
        Self {
            http,
            settings,
            token_file: token_file.into(),
            access_token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config, http: reqwest::Client) -> Result<Self> {
        let settings = OAuthSettings::from_config(config)?;
        Ok(Self::new(http, settings, &config.drive.token_file))
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    pub fn token_file(&self) -> &Path {
        &self.token_file
    }

    /// Current access token: memory, then the token file, then a fresh exchange
    pub async fn access_token(&self) -> DriveResult<String> {
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(token);
        }

        if let Some(token) = self.load_persisted().await {
            debug!("Loaded access token from {}", self.token_file.display());
            *self.access_token.write().await = Some(token.clone());
            return Ok(token);
        }

        info!("No access token available, requesting one");
        self.refresh_replacing(None).await
    }

    /// Exchange the refresh token for a new access token and persist it
    pub async fn refresh(&self) -> DriveResult<String> {
        self.refresh_replacing(None).await
    }

    /// Refresh unless the rejected token was already replaced by a concurrent caller
    async fn refresh_replacing(&self, rejected: Option<&str>) -> DriveResult<String> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(rejected) = rejected {
            if let Some(current) = self.access_token.read().await.as_deref() {
                if current != rejected {
                    debug!("Access token already refreshed by another caller");
                    return Ok(current.to_string());
                }
            }
        }

        let token = self.exchange().await?;
        self.persist(&token).await?;
        *self.access_token.write().await = Some(token.clone());

        info!("Access token refreshed");
        Ok(token)
    }

    async fn exchange(&self) -> DriveResult<String> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("refresh_token", self.settings.refresh_token.as_str()),
        ];
        if let Some(redirect_uri) = self.settings.redirect_uri.as_deref() {
            form.push(("redirect_uri", redirect_uri));
        }

        let response = self
            .http
            .post(&self.settings.token_url)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::CredentialRejected(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::Api {
                status,
                message: body,
            });
        }

        // A rotated refresh token in the response is not stored
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| DriveError::Decode(format!("token response: {}", e)))?;

        if let Some(expires_in) = body.expires_in {
            debug!("New access token expires in {}s", expires_in);
        }
        Ok(body.access_token)
    }

    async fn load_persisted(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.token_file).await {
            Ok(content) => {
                let token = content.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read token file {}: {}", self.token_file.display(), e);
                None
            }
        }
    }

    /// Overwrite the token file through a temp file and rename
    async fn persist(&self, token: &str) -> DriveResult<()> {
        if let Some(parent) = self.token_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = self.token_file.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        // A leftover temp file would keep its old mode
        match tokio::fs::remove_file(&tmp).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await?;
        file.write_all(token.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.token_file).await?;
        Ok(())
    }

    /// Run a read-only probe; refresh once if it reports an auth error
    ///
    /// Any other probe failure is logged and the current token is kept.
    pub async fn validate<F, Fut>(&self, probe: F) -> DriveResult<()>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = DriveResult<()>>,
    {
        let token = self.access_token().await?;

        match probe(token.clone()).await {
            Ok(()) => {
                debug!("Access token validated");
                Ok(())
            }
            Err(e) if e.is_auth() => {
                info!("Access token rejected by probe, refreshing");
                self.refresh_replacing(Some(&token)).await.map(|_| ())
            }
            Err(e) => {
                warn!("Credential probe failed, keeping current token: {}", e);
                Ok(())
            }
        }
    }

    /// Run `op` with the current token; on an auth error refresh once and replay once
    pub async fn with_auth_retry<T, F, Fut>(&self, mut op: F) -> DriveResult<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = DriveResult<T>>,
    {
        let token = self.access_token().await?;

        match op(token.clone()).await {
            Err(e) if e.is_auth() => {
                warn!("Request unauthorized, refreshing access token and retrying: {}", e);
                let fresh = self.refresh_replacing(Some(&token)).await?;
                op(fresh).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use reqwest::StatusCode;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server: &MockServer) -> OAuthSettings {
        OAuthSettings {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "refresh-1".to_string(),
            redirect_uri: None,
            token_url: format!("{}/token", server.uri()),
        }
    }

    fn broker(server: &MockServer, dir: &TempDir) -> CredentialBroker {
        CredentialBroker::new(
            reqwest::Client::new(),
            settings(server),
            dir.path().join("state").join("access_token"),
        )
    }

    async fn mount_token(server: &MockServer, token: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "expires_in": 3599,
                "refresh_token": "rotated-refresh",
                "token_type": "Bearer"
            })))
            .expect(times)
            .mount(server)
            .await;
    }

    fn unauthorized() -> DriveError {
        DriveError::from_status(StatusCode::UNAUTHORIZED, "expired".to_string())
    }

    #[tokio::test]
    async fn test_refresh_persists_token_and_keeps_refresh_token() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_token(&server, "access-1", 1).await;

        let broker = broker(&server, &dir);
        let token = broker.refresh().await.unwrap();

        assert_eq!(token, "access-1");
        assert_eq!(std::fs::read_to_string(broker.token_file()).unwrap(), "access-1");
        assert_eq!(broker.settings().refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn test_refresh_overwrites_previous_token() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_token(&server, "access-2", 1).await;

        let broker = broker(&server, &dir);
        std::fs::create_dir_all(broker.token_file().parent().unwrap()).unwrap();
        std::fs::write(broker.token_file(), "a-much-longer-stale-access-token").unwrap();

        broker.refresh().await.unwrap();
        assert_eq!(std::fs::read_to_string(broker.token_file()).unwrap(), "access-2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_token(&server, "access-3", 1).await;

        let broker = broker(&server, &dir);
        std::fs::create_dir_all(broker.token_file().parent().unwrap()).unwrap();

        // Stale temp file from an interrupted write, readable by everyone
        let mut tmp = broker.token_file().as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, "leftover").unwrap();
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).unwrap();

        broker.refresh().await.unwrap();

        let mode = std::fs::metadata(broker.token_file()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(broker.token_file()).unwrap(), "access-3");
        assert!(!std::path::Path::new(&tmp).exists());
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_is_distinct_error() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let broker = broker(&server, &dir);
        let err = broker.refresh().await.unwrap_err();

        assert_matches!(err, DriveError::CredentialRejected(body) if body.contains("invalid_grant"));
        assert!(!broker.token_file().exists());
    }

    #[tokio::test]
    async fn test_access_token_uses_persisted_file() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_token(&server, "never", 0).await;

        let broker = broker(&server, &dir);
        std::fs::create_dir_all(broker.token_file().parent().unwrap()).unwrap();
        std::fs::write(broker.token_file(), "persisted\n").unwrap();

        assert_eq!(broker.access_token().await.unwrap(), "persisted");
    }

    #[tokio::test]
    async fn test_access_token_refreshes_when_nothing_cached() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_token(&server, "first", 1).await;

        let broker = broker(&server, &dir);
        assert_eq!(broker.access_token().await.unwrap(), "first");
        // Second call is served from memory
        assert_eq!(broker.access_token().await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_auth_retry_refreshes_exactly_once() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_token(&server, "fresh", 1).await;

        let broker = broker(&server, &dir);
        std::fs::create_dir_all(broker.token_file().parent().unwrap()).unwrap();
        std::fs::write(broker.token_file(), "stale").unwrap();

        let calls = AtomicUsize::new(0);
        let result = broker
            .with_auth_retry(|token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if token == "stale" {
                        Err(unauthorized())
                    } else {
                        Ok(token)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_retry_second_failure_propagates() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        // Initial exchange plus the single retry refresh
        mount_token(&server, "fresh", 2).await;

        let broker = broker(&server, &dir);
        let calls = AtomicUsize::new(0);

        let result: DriveResult<()> = broker
            .with_auth_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(unauthorized()) }
            })
            .await;

        assert_matches!(result, Err(DriveError::Unauthorized { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_retry_does_not_retry_other_errors() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_token(&server, "token", 1).await;

        let broker = broker(&server, &dir);
        let calls = AtomicUsize::new(0);

        let result: DriveResult<()> = broker
            .with_auth_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(DriveError::from_status(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "boom".to_string(),
                    ))
                }
            })
            .await;

        assert_matches!(result, Err(DriveError::Api { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validate_refreshes_on_auth_error() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_token(&server, "fresh", 1).await;

        let broker = broker(&server, &dir);
        std::fs::create_dir_all(broker.token_file().parent().unwrap()).unwrap();
        std::fs::write(broker.token_file(), "stale").unwrap();

        broker.validate(|_| async { Err(unauthorized()) }).await.unwrap();

        assert_eq!(broker.access_token().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_validate_keeps_token_on_transient_error() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_token(&server, "unused", 0).await;

        let broker = broker(&server, &dir);
        std::fs::create_dir_all(broker.token_file().parent().unwrap()).unwrap();
        std::fs::write(broker.token_file(), "current").unwrap();

        broker
            .validate(|_| async {
                Err(DriveError::from_status(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "try later".to_string(),
                ))
            })
            .await
            .unwrap();

        assert_eq!(broker.access_token().await.unwrap(), "current");
    }

    #[test]
    fn test_settings_require_refresh_token() {
        let mut config = Config::default();
        config.drive.client_id = Some("id".to_string());
        config.drive.client_secret = Some("secret".to_string());

        let err = OAuthSettings::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("refresh_token"));
    }
}
