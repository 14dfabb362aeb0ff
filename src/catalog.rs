use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Driver,
    Hat,
    Apparel,
    Accessory,
    Goods,
    #[serde(other)]
    Other,
}

impl Category {
    /// Hats, accessories and other merchandise are stored under the goods tree.
    pub fn is_goods(&self) -> bool {
        matches!(self, Category::Hat | Category::Accessory | Category::Goods)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionTarget {
    Hands,
    Head,
    Body,
    Accessory,
    #[serde(other)]
    Other,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DriverPart {
    Crown,
    Sole,
    Face,
    #[default]
    Full,
}

impl DriverPart {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverPart::Crown => "crown",
            DriverPart::Sole => "sole",
            DriverPart::Face => "face",
            DriverPart::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HatType {
    Bucket,
    Baseball,
    Visor,
    #[serde(other)]
    Other,
}

impl HatType {
    /// Label used by the catalog (Korean storefront).
    pub fn catalog_label(&self) -> &'static str {
        match self {
            HatType::Bucket => "버킷햇",
            HatType::Baseball => "야구모자",
            HatType::Visor => "비저",
            HatType::Other => "모자",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub category: Category,
    pub composition_target: CompositionTarget,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub reference_images: Vec<String>,
    #[serde(default)]
    pub driver_parts: BTreeMap<DriverPart, Vec<String>>,
    #[serde(default)]
    pub hat_type: Option<HatType>,
}

impl ProductRecord {
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.name)
    }

    pub fn matches(&self, id_or_slug: &str) -> bool {
        self.id == id_or_slug || self.slug == id_or_slug
    }

    /// Images for one driver part; empty when the product has none for it.
    pub fn part_images(&self, part: DriverPart) -> &[String] {
        self.driver_parts
            .get(&part)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Catalog assets were re-encoded from PNG to WebP; stale `.png` paths are rewritten.
    pub fn with_webp_assets(mut self) -> Self {
        self.image_url = self.image_url.map(|url| png_to_webp(&url));
        self.reference_images = self
            .reference_images
            .iter()
            .map(|url| png_to_webp(url))
            .collect();
        self
    }
}

fn png_to_webp(url: &str) -> String {
    match url.strip_suffix(".png") {
        Some(stem) => format!("{stem}.webp"),
        None => url.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(String),
    #[error("invalid catalog response: {0}")]
    Deserialize(String),
    #[error("catalog file could not be loaded: {0}")]
    Load(String),
}

/// Read-only product source, queried fresh on every request.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn find_product(&self, id_or_slug: &str) -> Result<Option<ProductRecord>, CatalogError>;
}

/// In-memory catalog, loaded from a YAML file when no catalog backend is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    products: Vec<ProductRecord>,
}

#[derive(Deserialize)]
struct CatalogFile {
    products: Vec<ProductRecord>,
}

impl StaticCatalog {
    pub fn new(products: Vec<ProductRecord>) -> Self {
        Self { products }
    }

    pub fn from_yaml(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            serde_yaml::from_str(raw).map_err(|err| CatalogError::Load(err.to_string()))?;
        Ok(Self::new(file.products))
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| CatalogError::Load(format!("{}: {err}", path.display())))?;
        let catalog = Self::from_yaml(&raw)?;
        info!(
            target = "compose.catalog",
            path = %path.display(),
            products = catalog.products.len(),
            "loaded static product catalog"
        );
        Ok(catalog)
    }
}

#[async_trait]
impl ProductCatalog for StaticCatalog {
    async fn find_product(&self, id_or_slug: &str) -> Result<Option<ProductRecord>, CatalogError> {
        Ok(self
            .products
            .iter()
            .find(|p| p.matches(id_or_slug))
            .cloned()
            .map(ProductRecord::with_webp_assets))
    }
}

/// Remote catalog with a local file consulted for products the remote does not know.
/// Remote failures are surfaced, never masked by the fallback.
pub struct LayeredCatalog {
    primary: Arc<dyn ProductCatalog>,
    fallback: Arc<dyn ProductCatalog>,
}

impl LayeredCatalog {
    pub fn new(primary: Arc<dyn ProductCatalog>, fallback: Arc<dyn ProductCatalog>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ProductCatalog for LayeredCatalog {
    async fn find_product(&self, id_or_slug: &str) -> Result<Option<ProductRecord>, CatalogError> {
        if let Some(product) = self.primary.find_product(id_or_slug).await? {
            return Ok(Some(product));
        }
        debug!(target = "compose.catalog", id_or_slug, "falling back to local catalog");
        self.fallback.find_product(id_or_slug).await
    }
}
