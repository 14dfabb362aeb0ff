use crate::catalog::{Category, CompositionTarget, DriverPart};
use crate::fal::CompositionMethod;
use crate::prompt::Background;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Body of `POST /compose`. Required fields are optional here so that their
/// absence surfaces as a validation error rather than a decode failure.
///
/// Older admin clients send the person photograph as `modelImageUrl` and use
/// `baseImageUrl` only as a storage-placement hint; see [`ComposeRequest::photo_url`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeRequest {
    #[serde(default)]
    pub base_image_url: Option<String>,
    #[serde(default)]
    pub model_image_url: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub product_image_url: Option<String>,
    #[serde(default)]
    pub composition_method: CompositionMethod,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default = "default_num_images")]
    pub num_images: u32,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default)]
    pub composition_target: Option<CompositionTarget>,
    #[serde(default)]
    pub driver_part: DriverPart,
    #[serde(default)]
    pub composition_background: Background,
    #[serde(default)]
    pub product_only_mode: bool,
    #[serde(default)]
    pub replace_logo: bool,
    #[serde(default)]
    pub change_product_color: bool,
    #[serde(default)]
    pub product_color: Option<String>,
    #[serde(default = "default_true")]
    pub use_reference_images: bool,
}

impl ComposeRequest {
    #[cfg(test)]
    pub fn new(base_image_url: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            base_image_url: Some(base_image_url.into()),
            model_image_url: None,
            product_id: Some(product_id.into()),
            product_image_url: None,
            composition_method: CompositionMethod::default(),
            prompt: None,
            num_images: default_num_images(),
            resolution: default_resolution(),
            aspect_ratio: default_aspect_ratio(),
            output_format: default_output_format(),
            composition_target: None,
            driver_part: DriverPart::default(),
            composition_background: Background::default(),
            product_only_mode: false,
            replace_logo: false,
            change_product_color: false,
            product_color: None,
            use_reference_images: true,
        }
    }

    /// The person photograph: `modelImageUrl` when sent, else `baseImageUrl`.
    pub fn photo_url(&self) -> Option<&str> {
        non_blank(self.model_image_url.as_deref()).or_else(|| non_blank(self.base_image_url.as_deref()))
    }

    /// Where results are stored next to: `baseImageUrl` when sent, else the photograph.
    pub fn placement_hint(&self) -> Option<&str> {
        non_blank(self.base_image_url.as_deref()).or_else(|| non_blank(self.model_image_url.as_deref()))
    }

    /// Colour override, only when the caller switched it on and named a colour.
    pub fn color_override(&self) -> Option<String> {
        if !self.change_product_color {
            return None;
        }
        self.product_color
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn default_num_images() -> u32 {
    1
}

fn default_resolution() -> String {
    "1K".to_string()
}

fn default_aspect_ratio() -> String {
    "auto".to_string()
}

fn default_output_format() -> String {
    "png".to_string()
}

fn default_true() -> bool {
    true
}

/// One requested output image. `error` never clears a present `external_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub external_url: String,
    pub persisted_url: Option<String>,
    pub path: Option<String>,
    pub error: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComposedImage {
    /// Durable url when stored, otherwise the capability's ephemeral url.
    pub image_url: String,
    pub path: Option<String>,
    pub original_url: String,
    pub error: Option<String>,
}

impl From<GenerationResult> for ComposedImage {
    fn from(result: GenerationResult) -> Self {
        Self {
            image_url: result
                .persisted_url
                .unwrap_or_else(|| result.external_url.clone()),
            path: result.path,
            original_url: result.external_url,
            error: result.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub category: Category,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeMetadata {
    pub composed_at: DateTime<Utc>,
    pub method: CompositionMethod,
    pub processing_time_ms: u64,
    pub description: Option<String>,
    pub prompt: String,
    pub image_urls: Vec<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeResponse {
    pub success: bool,
    pub images: Vec<ComposedImage>,
    pub product: ProductSummary,
    pub metadata: ComposeMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPreview {
    pub prompt: String,
    pub image_urls: Vec<String>,
    pub product: ProductSummary,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub success: bool,
    pub error: String,
    pub stage: Option<String>,
    pub processing_time_ms: Option<u64>,
}

impl ApiError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            stage: None,
            processing_time_ms: None,
        }
    }
}
