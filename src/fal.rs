use crate::config::FalConfig;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompositionMethod {
    #[default]
    NanoBananaPro,
    NanoBanana,
}

impl CompositionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompositionMethod::NanoBananaPro => "nano-banana-pro",
            CompositionMethod::NanoBanana => "nano-banana",
        }
    }

    pub fn model_path(&self) -> &'static str {
        match self {
            CompositionMethod::NanoBananaPro => "fal-ai/nano-banana-pro/edit",
            CompositionMethod::NanoBanana => "fal-ai/nano-banana/edit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EditRequest {
    pub method: CompositionMethod,
    pub instruction: String,
    pub image_urls: Vec<Url>,
    pub num_images: u32,
    pub aspect_ratio: String,
    pub output_format: String,
    pub resolution: String,
}

#[derive(Debug, Clone, Default)]
pub struct EditResponse {
    pub images: Vec<String>,
    pub description: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("generation credential is not configured")]
    MissingCredentials,
    #[error("http error: {0}")]
    Http(String),
    #[error("generation service rejected the request: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// The external generative image-edit service.
#[async_trait]
pub trait ImageEditor: Send + Sync {
    async fn edit(&self, request: &EditRequest) -> Result<EditResponse, CapabilityError>;
}

pub struct FalClient {
    http: Client,
    config: FalConfig,
}

impl FalClient {
    pub fn new(http: Client, config: FalConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ImageEditor for FalClient {
    async fn edit(&self, request: &EditRequest) -> Result<EditResponse, CapabilityError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or(CapabilityError::MissingCredentials)?;

        let body = FalEditInput {
            prompt: &request.instruction,
            image_urls: request.image_urls.iter().map(Url::as_str).collect(),
            num_images: request.num_images,
            aspect_ratio: &request.aspect_ratio,
            output_format: &request.output_format,
            resolution: &request.resolution,
        };
        let endpoint = format!("{}/{}", self.config.base_url, request.method.model_path());
        info!(
            target = "compose.fal",
            model = request.method.model_path(),
            images_in = body.image_urls.len(),
            num_images = request.num_images,
            "submitting edit request"
        );

        let response = self
            .http
            .post(&endpoint)
            .header("Authorization", format!("Key {key}"))
            .json(&body)
            .send()
            .await
            .map_err(|err| CapabilityError::Http(err.to_string()))?;

        let status = response.status();
        let request_id = response
            .headers()
            .get("x-fal-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Rejected(format!(
                "HTTP {status}: {}",
                error_detail(&text)
            )));
        }

        let payload: FalEditOutput = response
            .json()
            .await
            .map_err(|err| CapabilityError::InvalidResponse(err.to_string()))?;
        debug!(
            target = "compose.fal",
            images_out = payload.images.len(),
            request_id = request_id.as_deref().unwrap_or("-"),
            "edit response received"
        );

        Ok(EditResponse {
            images: payload.images.into_iter().map(|img| img.url).collect(),
            description: payload.description.filter(|d| !d.trim().is_empty()),
            request_id,
        })
    }
}

/// Pulls a readable message out of the service's error body, whatever shape it takes.
fn error_detail(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.chars().take(300).collect();
    };
    for key in ["detail", "message", "error"] {
        match value.get(key) {
            Some(Value::String(s)) => return s.clone(),
            Some(other) if !other.is_null() => return other.to_string(),
            _ => {}
        }
    }
    value.to_string()
}

#[derive(Debug, Serialize)]
struct FalEditInput<'a> {
    prompt: &'a str,
    image_urls: Vec<&'a str>,
    num_images: u32,
    aspect_ratio: &'a str,
    output_format: &'a str,
    resolution: &'a str,
}

#[derive(Debug, Deserialize)]
struct FalEditOutput {
    #[serde(default)]
    images: Vec<FalImage>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FalImage {
    url: String,
}
