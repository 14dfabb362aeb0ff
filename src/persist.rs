use crate::catalog::Category;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistError {
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("public url resolution failed: {0}")]
    PublicUrl(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object storage is not configured")]
    NotConfigured,
    #[error("storage request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, PersistError>;
}

/// Durable blob store: write-once objects plus public url resolution.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError>;

    async fn public_url(&self, path: &str) -> Result<String, StorageError>;
}

/// Stand-in used when no storage backend is configured; every upload fails per image.
pub struct DisabledStore;

#[async_trait]
impl ObjectStore for DisabledStore {
    async fn upload(&self, _: &str, _: Vec<u8>, _: &str) -> Result<StoredObject, StorageError> {
        Err(StorageError::NotConfigured)
    }

    async fn public_url(&self, _: &str) -> Result<String, StorageError> {
        Err(StorageError::NotConfigured)
    }
}

pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, PersistError> {
        if let Some(inline) = url.strip_prefix("data:") {
            return decode_data_uri(inline);
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| PersistError::DownloadFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PersistError::DownloadFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| PersistError::DownloadFailed(err.to_string()))?;
        Ok(FetchedImage {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

// Synchronous-mode generation returns `data:<mime>;base64,<payload>` instead of a url.
fn decode_data_uri(inline: &str) -> Result<FetchedImage, PersistError> {
    let (meta, payload) = inline
        .split_once(',')
        .ok_or_else(|| PersistError::DownloadFailed("malformed data uri".into()))?;
    let Some(mime) = meta.strip_suffix(";base64") else {
        return Err(PersistError::DownloadFailed(
            "data uri is not base64 encoded".into(),
        ));
    };
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|err| PersistError::DownloadFailed(err.to_string()))?;
    Ok(FetchedImage {
        bytes,
        content_type: Some(mime.to_string()).filter(|m| !m.is_empty()),
    })
}

/// Where a batch of results for one product lands in the bucket.
#[derive(Debug, Clone)]
pub struct PersistTarget {
    pub product_id: String,
    pub product_slug: String,
    pub category: Category,
    /// Base photograph; results for blog imagery are stored next to it.
    pub base_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedImage {
    pub path: String,
    pub public_url: String,
}

#[derive(Clone)]
pub struct ResultPersister {
    fetcher: Arc<dyn ImageFetcher>,
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ResultPersister {
    pub fn new(fetcher: Arc<dyn ImageFetcher>, store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self {
            fetcher,
            store,
            bucket,
        }
    }

    pub async fn persist(
        &self,
        source_url: &str,
        target: &PersistTarget,
        label: &str,
    ) -> Result<PersistedImage, PersistError> {
        let fetched = self.fetcher.fetch(source_url).await?;
        let ext = extension_for(source_url, fetched.content_type.as_deref());
        let content_type = fetched
            .content_type
            .clone()
            .unwrap_or_else(|| format!("image/{ext}"));
        let folder = self.folder_for(target);
        let path = object_path(&folder, label, &target.product_id, &ext, Utc::now(), Uuid::new_v4());

        let stored = self
            .store
            .upload(&path, fetched.bytes, &content_type)
            .await
            .map_err(|err| PersistError::UploadFailed(err.to_string()))?;
        let public_url = self
            .store
            .public_url(&stored.key)
            .await
            .map_err(|err| PersistError::PublicUrl(err.to_string()))?;

        info!(target = "compose.persist", path = %stored.key, label, "result stored");
        Ok(PersistedImage {
            path: stored.key,
            public_url,
        })
    }

    fn folder_for(&self, target: &PersistTarget) -> String {
        if let Some(folder) = target
            .base_image_url
            .as_deref()
            .and_then(|url| blog_folder(url, &self.bucket))
        {
            return folder;
        }
        let tree = if target.category.is_goods() {
            "goods"
        } else {
            "products"
        };
        format!(
            "originals/{tree}/{}/gallery",
            sanitize_segment(&target.product_slug)
        )
    }
}

fn blog_folder(base_image_url: &str, bucket: &str) -> Option<String> {
    let marker = format!("{bucket}/");
    let start = base_image_url.find(&marker)? + marker.len();
    let raw = base_image_url[start..].split(['?', '#']).next()?;
    let decoded = match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(err) => {
            warn!(target = "compose.persist", error = %err, "undecodable base image path");
            return None;
        }
    };
    let (folder, _file) = decoded.rsplit_once('/')?;
    folder
        .starts_with("originals/blog/")
        .then(|| folder.to_string())
}

/// Gallery objects are grouped by day; blog folders are already dated.
fn object_path(
    folder: &str,
    label: &str,
    product_id: &str,
    ext: &str,
    now: DateTime<Utc>,
    nonce: Uuid,
) -> String {
    let file = format!(
        "{}-{}-{}-{}.{ext}",
        sanitize_segment(label),
        sanitize_segment(product_id),
        now.timestamp_millis(),
        &nonce.simple().to_string()[..8],
    );
    if folder.starts_with("originals/blog/") {
        format!("{folder}/{file}")
    } else {
        format!("{folder}/{}/{file}", now.format("%Y-%m-%d"))
    }
}

fn extension_for(source_url: &str, content_type: Option<&str>) -> String {
    if !source_url.starts_with("data:") {
        let path = source_url.split(['?', '#']).next().unwrap_or_default();
        let last = path.rsplit('/').next().unwrap_or_default();
        if let Some((_, ext)) = last.rsplit_once('.')
            && !ext.is_empty()
            && ext.len() <= 5
            && ext.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return ext.to_ascii_lowercase();
        }
    }
    content_type
        .and_then(|ct| ct.split(';').next())
        .and_then(|ct| ct.trim().strip_prefix("image/"))
        .filter(|sub| !sub.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "png".to_string())
}

fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
