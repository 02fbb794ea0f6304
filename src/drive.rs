//! Google Drive v3 implementation of [`ArchiveStore`]

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Body;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::Config;
use crate::credentials::CredentialBroker;
use crate::error::{DriveError, DriveResult};
use crate::storage::{ArchiveStore, RemoteArchive};

const ZIP_MIME: &str = "application/zip";
const FILE_FIELDS: &str = "id,name,modifiedTime,createdTime";
const MULTIPART_BOUNDARY: &str = "repovault-multipart-boundary";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteArchive>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Permission {
    id: String,
}

pub struct DriveClient {
    http: reqwest::Client,
    broker: Arc<CredentialBroker>,
    api_url: String,
    folder_id: Option<String>,
}

impl DriveClient {
    pub fn new(
        http: reqwest::Client,
        broker: Arc<CredentialBroker>,
        api_url: impl Into<String>,
        folder_id: Option<String>,
    ) -> Self {
        Self {
            http,
            broker,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            folder_id,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.drive.request_timeout))
            .build()
            .context("Failed to build HTTP client")?;

        let broker = Arc::new(CredentialBroker::from_config(config, http.clone())?);

        Ok(Self::new(
            http,
            broker,
            config.drive.api_url.clone(),
            config.drive.folder_id.clone(),
        ))
    }

    pub fn broker(&self) -> &Arc<CredentialBroker> {
        &self.broker
    }

    /// Account the current access token belongs to
    pub async fn about(&self) -> DriveResult<serde_json::Value> {
        let url = format!("{}/drive/v3/about", self.api_url);
        self.broker
            .with_auth_retry(|token| {
                let request = self
                    .http
                    .get(&url)
                    .query(&[("fields", "user")])
                    .bearer_auth(token);
                async move { decode(check(request.send().await?).await?).await }
            })
            .await
    }

    /// Share a remote file with a user
    pub async fn grant_permission(&self, file_id: &str, email: &str, role: &str) -> DriveResult<String> {
        let url = format!("{}/drive/v3/files/{}/permissions", self.api_url, file_id);
        let body = json!({
            "type": "user",
            "role": role,
            "emailAddress": email,
        });

        let permission: Permission = self
            .broker
            .with_auth_retry(|token| {
                let request = self.http.post(&url).bearer_auth(token).json(&body);
                async move { decode(check(request.send().await?).await?).await }
            })
            .await?;

        info!("Granted {} on {} to {}", role, file_id, email);
        Ok(permission.id)
    }

    fn list_query(&self) -> String {
        let mut q = format!("mimeType='{}' and trashed=false", ZIP_MIME);
        if let Some(folder) = &self.folder_id {
            q.push_str(&format!(" and '{}' in parents", folder));
        }
        q
    }

    async fn list_page(&self, page_token: Option<&str>) -> DriveResult<FileList> {
        let url = format!("{}/drive/v3/files", self.api_url);
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let q = self.list_query();

        self.broker
            .with_auth_retry(|token| {
                let mut request = self
                    .http
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("q", q.as_str()), ("fields", fields.as_str()), ("pageSize", "100")]);
                if let Some(page_token) = page_token {
                    request = request.query(&[("pageToken", page_token)]);
                }
                async move { decode(check(request.send().await?).await?).await }
            })
            .await
    }
}

/// `multipart/related` framing: the JSON metadata part and archive part header,
/// then the closing boundary that follows the archive bytes
fn multipart_envelope(metadata: &serde_json::Value) -> (Bytes, Bytes) {
    let head = format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{b}\r\nContent-Type: {mime}\r\n\r\n",
        b = MULTIPART_BOUNDARY,
        metadata = metadata,
        mime = ZIP_MIME,
    );
    let tail = format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY);

    (Bytes::from(head), Bytes::from(tail))
}

/// Stream the envelope around the archive without buffering the file
async fn multipart_stream(path: &Path, head: Bytes, tail: Bytes) -> DriveResult<Body> {
    let file = tokio::fs::File::open(path).await?;
    let parts = stream::iter([Ok::<_, std::io::Error>(head)])
        .chain(ReaderStream::new(file))
        .chain(stream::iter([Ok(tail)]));

    Ok(Body::wrap_stream(parts))
}

async fn check(response: reqwest::Response) -> DriveResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DriveError::from_status(status, body))
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> DriveResult<T> {
    response
        .json()
        .await
        .map_err(|e| DriveError::Decode(e.to_string()))
}

#[async_trait]
impl ArchiveStore for DriveClient {
    async fn verify_access(&self) -> Result<()> {
        let url = format!("{}/drive/v3/about", self.api_url);

        self.broker
            .validate(|token| {
                let request = self
                    .http
                    .get(&url)
                    .query(&[("fields", "user")])
                    .bearer_auth(token);
                async move {
                    check(request.send().await?).await?;
                    Ok(())
                }
            })
            .await
            .context("Failed to verify Google Drive access")
    }

    async fn upload(&self, path: &Path) -> Result<RemoteArchive> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Invalid archive path: {}", path.display()))?
            .to_string();

        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to read archive {}", path.display()))?
            .len();

        let mut metadata = json!({ "name": name, "mimeType": ZIP_MIME });
        if let Some(folder) = &self.folder_id {
            metadata["parents"] = json!([folder]);
        }
        let (head, tail) = multipart_envelope(&metadata);
        let length = head.len() as u64 + size + tail.len() as u64;
        let content_type = format!("multipart/related; boundary={}", MULTIPART_BOUNDARY);
        let url = format!("{}/upload/drive/v3/files", self.api_url);

        debug!("Uploading {} ({} bytes)", name, size);

        let archive: RemoteArchive = self
            .broker
            .with_auth_retry(|token| {
                // The file is reopened on every attempt so a retry resends it
                let request = self
                    .http
                    .post(&url)
                    .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
                    .bearer_auth(token)
                    .header(CONTENT_TYPE, content_type.as_str())
                    .header(CONTENT_LENGTH, length);
                let (head, tail) = (head.clone(), tail.clone());
                async move {
                    let body = multipart_stream(path, head, tail).await?;
                    decode(check(request.body(body).send().await?).await?).await
                }
            })
            .await
            .with_context(|| format!("Failed to upload {}", name))?;

        info!("Uploaded {} as {}", archive.name, archive.id);
        Ok(archive)
    }

    async fn list_archives(&self) -> Result<Vec<RemoteArchive>> {
        let mut archives = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .list_page(page_token.as_deref())
                .await
                .context("Failed to list remote archives")?;
            archives.extend(page.files);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!("Listed {} remote archives", archives.len());
        Ok(archives)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let url = format!("{}/drive/v3/files/{}", self.api_url, id);

        self.broker
            .with_auth_retry(|token| {
                let request = self.http.delete(&url).bearer_auth(token);
                async move {
                    check(request.send().await?).await?;
                    Ok(())
                }
            })
            .await
            .with_context(|| format!("Failed to delete remote archive {}", id))
    }
}
