//! Remote object store abstraction.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing
//! - `DriveClient` (in drive-sync) - Google Drive v3 over reqwest
//!
//! [`RetryingRemote`] wraps any store and retries transient failures
//! (rate limiting, server errors, transport errors) with exponential backoff.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("{operation} failed with status {status}: {message}")]
    Status {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("{operation} failed: {message}")]
    Transport { operation: String, message: String },

    #[error("Remote object not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    /// Classify a failed HTTP-style response.
    pub fn from_status(operation: &str, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => RemoteError::Auth(message),
            404 => RemoteError::NotFound(message),
            _ => RemoteError::Status {
                operation: operation.to_string(),
                status,
                message,
            },
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            RemoteError::Transport { .. } => true,
            RemoteError::Auth(_) | RemoteError::NotFound(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// A remote object as reported by a listing or upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    /// RFC 3339 modification time, if the store reports one
    pub modified_time: Option<String>,
}

/// Remote object store holding encrypted blobs in a single folder.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Find the folder called `name`, creating it if it doesn't exist.
    async fn find_or_create_folder(&self, name: &str) -> Result<String>;

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>>;

    async fn upload_file(&self, folder_id: &str, name: &str, content: &[u8]) -> Result<RemoteFile>;

    async fn update_file(&self, file_id: &str, content: &[u8]) -> Result<RemoteFile>;

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>>;

    async fn delete_file(&self, file_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    async fn find_or_create_folder(&self, name: &str) -> Result<String> {
        (**self).find_or_create_folder(name).await
    }

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>> {
        (**self).list_files(folder_id).await
    }

    async fn upload_file(&self, folder_id: &str, name: &str, content: &[u8]) -> Result<RemoteFile> {
        (**self).upload_file(folder_id, name, content).await
    }

    async fn update_file(&self, file_id: &str, content: &[u8]) -> Result<RemoteFile> {
        (**self).update_file(file_id, content).await
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        (**self).download_file(file_id).await
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        (**self).delete_file(file_id).await
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(with = "millis", default = "default_initial_delay")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    #[serde(with = "millis", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            max_attempts: default_max_attempts(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Delay before retry number `attempt` (1-based) using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Run `op`, retrying transient failures up to `config.max_attempts` in total.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let delay = calculate_backoff(attempt, config);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation, attempt, config.max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Store wrapper that retries every call on transient failure.
pub struct RetryingRemote<R> {
    inner: R,
    config: RetryConfig,
}

impl<R: RemoteStore> RetryingRemote<R> {
    pub fn new(inner: R, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: RemoteStore> RemoteStore for RetryingRemote<R> {
    async fn find_or_create_folder(&self, name: &str) -> Result<String> {
        with_retry(&self.config, "find_or_create_folder", || {
            self.inner.find_or_create_folder(name)
        })
        .await
    }

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>> {
        with_retry(&self.config, "list_files", || self.inner.list_files(folder_id)).await
    }

    async fn upload_file(&self, folder_id: &str, name: &str, content: &[u8]) -> Result<RemoteFile> {
        with_retry(&self.config, "upload_file", || {
            self.inner.upload_file(folder_id, name, content)
        })
        .await
    }

    async fn update_file(&self, file_id: &str, content: &[u8]) -> Result<RemoteFile> {
        with_retry(&self.config, "update_file", || self.inner.update_file(file_id, content)).await
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        with_retry(&self.config, "download_file", || self.inner.download_file(file_id)).await
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        with_retry(&self.config, "delete_file", || self.inner.delete_file(file_id)).await
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    folder_id: String,
    name: String,
    content: Vec<u8>,
    version: u64,
}

#[derive(Default)]
struct RemoteState {
    folders: BTreeMap<String, String>,
    objects: BTreeMap<String, StoredObject>,
    next_id: u64,
    /// Status codes returned by the next calls, in order
    injected_failures: Vec<u16>,
    calls: BTreeMap<&'static str, usize>,
}

impl RemoteState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn enter(&mut self, operation: &'static str) -> Result<()> {
        *self.calls.entry(operation).or_default() += 1;
        if self.injected_failures.is_empty() {
            return Ok(());
        }
        let status = self.injected_failures.remove(0);
        Err(RemoteError::from_status(operation, status, "injected failure"))
    }
}

/// In-memory object store for testing
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next calls fail with the given HTTP statuses, in order.
    pub fn fail_next(&self, statuses: &[u16]) {
        self.state.lock().unwrap().injected_failures.extend_from_slice(statuses);
    }

    /// Number of times `operation` was called.
    pub fn call_count(&self, operation: &str) -> usize {
        self.state.lock().unwrap().calls.get(operation).copied().unwrap_or(0)
    }

    /// Names of all objects in a folder.
    pub fn object_names(&self, folder_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .values()
            .filter(|o| o.folder_id == folder_id)
            .map(|o| o.name.clone())
            .collect()
    }

    /// Raw stored bytes of an object.
    pub fn raw_content(&self, file_id: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.objects.get(file_id).map(|o| o.content.clone())
    }

    /// Overwrite an object's bytes without going through the store API.
    pub fn set_raw_content(&self, file_id: &str, content: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(file_id) {
            object.content = content;
        }
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    fn describe(id: &str, object: &StoredObject) -> RemoteFile {
        RemoteFile {
            id: id.to_string(),
            name: object.name.clone(),
            modified_time: Some(format!("v{}", object.version)),
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn find_or_create_folder(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.enter("find_or_create_folder")?;
        if let Some(id) = state.folders.get(name) {
            return Ok(id.clone());
        }
        let id = state.next_id("folder");
        state.folders.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>> {
        let mut state = self.state.lock().unwrap();
        state.enter("list_files")?;
        Ok(state
            .objects
            .iter()
            .filter(|(_, o)| o.folder_id == folder_id)
            .map(|(id, o)| Self::describe(id, o))
            .collect())
    }

    async fn upload_file(&self, folder_id: &str, name: &str, content: &[u8]) -> Result<RemoteFile> {
        let mut state = self.state.lock().unwrap();
        state.enter("upload_file")?;
        let id = state.next_id("file");
        let object = StoredObject {
            folder_id: folder_id.to_string(),
            name: name.to_string(),
            content: content.to_vec(),
            version: 1,
        };
        let info = Self::describe(&id, &object);
        state.objects.insert(id, object);
        Ok(info)
    }

    async fn update_file(&self, file_id: &str, content: &[u8]) -> Result<RemoteFile> {
        let mut state = self.state.lock().unwrap();
        state.enter("update_file")?;
        let object = state
            .objects
            .get_mut(file_id)
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))?;
        object.content = content.to_vec();
        object.version += 1;
        Ok(Self::describe(file_id, object))
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.enter("download_file")?;
        state
            .objects
            .get(file_id)
            .map(|o| o.content.clone())
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.enter("delete_file")?;
        state
            .objects
            .remove(file_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))
    }
}
