//! Google Drive v3 client implementing `RemoteStore`.
//!
//! Only object-level calls are used: the engine never needs Drive's own
//! revision or sharing features. Uploads go through the multipart endpoint so
//! name and content are sent in one request.

use async_trait::async_trait;
use drive_sync_core::remote::{RemoteError, RemoteFile, RemoteStore, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

pub const API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,modifiedTime";
const MULTIPART_BOUNDARY: &str = "drive-sync-part-boundary";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    modified_time: Option<String>,
}

impl From<DriveFile> for RemoteFile {
    fn from(file: DriveFile) -> Self {
        RemoteFile {
            id: file.id,
            name: file.name,
            modified_time: file.modified_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct DriveClient {
    http: Client,
    token: String,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    /// Client authorized with an OAuth access token.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_urls(token, API_BASE, UPLOAD_BASE)
    }

    pub fn with_base_urls(
        token: impl Into<String>,
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
    ) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(RemoteError::Auth("no access token configured".into()));
        }
        let http = Client::builder()
            .user_agent(concat!("drive-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| transport("build_client", e))?;
        Ok(Self {
            http,
            token,
            api_base: api_base.into(),
            upload_base: upload_base.into(),
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Response> {
        let response = request
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|e| transport(operation, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(operation, status, &body))
    }

    async fn json<T: for<'de> Deserialize<'de>>(
        operation: &'static str,
        response: Response,
    ) -> Result<T> {
        response.json::<T>().await.map_err(|e| transport(operation, e))
    }

    async fn find_folder(&self, name: &str) -> Result<Option<String>> {
        let query = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            escape_query(name),
            FOLDER_MIME
        );
        let request = self
            .http
            .get(format!("{}/files", self.api_base))
            .query(&[("q", query.as_str()), ("fields", "files(id,name)"), ("spaces", "drive")]);
        let list: FileList = Self::json("find_folder", self.send("find_folder", request).await?).await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }
}

fn transport(operation: &str, err: reqwest::Error) -> RemoteError {
    RemoteError::Transport {
        operation: operation.to_string(),
        message: err.to_string(),
    }
}

/// Map a failed Drive response to a `RemoteError`.
///
/// Drive reports per-user rate limiting as 403 with a `rateLimitExceeded`
/// reason; that is treated like 429 so it gets retried.
pub fn classify(operation: &str, status: StatusCode, body: &str) -> RemoteError {
    let code = status.as_u16();
    if code == 403 && (body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded")) {
        return RemoteError::Status {
            operation: operation.to_string(),
            status: 429,
            message: body.to_string(),
        };
    }
    RemoteError::from_status(operation, code, body)
}

/// Escape a value for use inside a single-quoted Drive query string.
pub fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// `multipart/related` body with JSON metadata followed by the raw content.
pub fn multipart_body(metadata: &serde_json::Value, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    body
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn find_or_create_folder(&self, name: &str) -> Result<String> {
        if let Some(id) = self.find_folder(name).await? {
            return Ok(id);
        }

        debug!("Creating Drive folder {}", name);
        let request = self
            .http
            .post(format!("{}/files", self.api_base))
            .query(&[("fields", "id")])
            .json(&serde_json::json!({ "name": name, "mimeType": FOLDER_MIME }));
        let folder: DriveFile =
            Self::json("create_folder", self.send("create_folder", request).await?).await?;
        Ok(folder.id)
    }

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>> {
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{}/files", self.api_base))
                .query(&[
                    ("q", query.as_str()),
                    ("fields", fields.as_str()),
                    ("pageSize", "1000"),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: FileList = Self::json("list_files", self.send("list_files", request).await?).await?;
            files.extend(page.files.into_iter().map(RemoteFile::from));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!("Listed {} remote object(s)", files.len());
        Ok(files)
    }

    async fn upload_file(&self, folder_id: &str, name: &str, content: &[u8]) -> Result<RemoteFile> {
        let metadata = serde_json::json!({ "name": name, "parents": [folder_id] });
        let request = self
            .http
            .post(format!("{}/files", self.upload_base))
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(multipart_body(&metadata, content));
        let file: DriveFile = Self::json("upload_file", self.send("upload_file", request).await?).await?;
        Ok(file.into())
    }

    async fn update_file(&self, file_id: &str, content: &[u8]) -> Result<RemoteFile> {
        let request = self
            .http
            .patch(format!("{}/files/{}", self.upload_base, file_id))
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(content.to_vec());
        let file: DriveFile = Self::json("update_file", self.send("update_file", request).await?).await?;
        Ok(file.into())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let request = self
            .http
            .get(format!("{}/files/{}", self.api_base, file_id))
            .query(&[("alt", "media")]);
        let response = self.send("download_file", request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport("download_file", e))?;
        Ok(bytes.to_vec())
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let request = self.http.delete(format!("{}/files/{}", self.api_base, file_id));
        self.send("delete_file", request).await?;
        Ok(())
    }
}
