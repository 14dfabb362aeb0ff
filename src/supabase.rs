use crate::catalog::{
    CatalogError, Category, CompositionTarget, DriverPart, HatType, ProductCatalog, ProductRecord,
};
use crate::config::SupabaseConfig;
use crate::persist::{ObjectStore, StorageError, StoredObject};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use uuid::Uuid;

/// PostgREST catalog reads and Storage writes against one Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    config: SupabaseConfig,
    http: Client,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig, http: Client) -> Self {
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config.url.as_str().trim_end_matches('/')
    }

    fn product_query_url(&self, id_or_slug: &str) -> String {
        // `id` is a uuid column; comparing it against a slug is a PostgREST error
        let filter = match Uuid::parse_str(id_or_slug) {
            Ok(id) => format!("id=eq.{id}"),
            Err(_) => format!("slug=eq.{}", urlencoding::encode(id_or_slug)),
        };
        format!(
            "{}/rest/v1/{}?{filter}&is_active=eq.true&select=*&limit=1",
            self.base_url(),
            self.config.product_table
        )
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url(),
            self.config.bucket,
            encode_path(path)
        )
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl ProductCatalog for SupabaseClient {
    async fn find_product(&self, id_or_slug: &str) -> Result<Option<ProductRecord>, CatalogError> {
        let response = self
            .http
            .get(self.product_query_url(id_or_slug))
            .header("apikey", &self.config.service_key)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.service_key),
            )
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let mut rows: Vec<ProductRow> = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        debug!(target = "compose.catalog", id_or_slug, rows = rows.len(), "product lookup");
        Ok(rows.pop().map(ProductRow::into_record))
    }
}

#[async_trait]
impl ObjectStore for SupabaseClient {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let response = self
            .http
            .post(self.object_url(path))
            .header("apikey", &self.config.service_key)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.service_key),
            )
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|err| StorageError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Request(format!(
                "HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(StoredObject {
            key: path.to_string(),
        })
    }

    async fn public_url(&self, path: &str) -> Result<String, StorageError> {
        Ok(format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url(),
            self.config.bucket,
            encode_path(path)
        ))
    }
}

/// Row shape of the product table (snake_case columns, nullable extras).
#[derive(Debug, Deserialize)]
struct ProductRow {
    id: String,
    #[serde(default)]
    slug: Option<String>,
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    category: Category,
    #[serde(default)]
    composition_target: Option<CompositionTarget>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    reference_images: Option<Vec<String>>,
    #[serde(default)]
    driver_parts: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    hat_type: Option<HatType>,
}

impl ProductRow {
    fn into_record(self) -> ProductRecord {
        let composition_target = self.composition_target.unwrap_or(match self.category {
            Category::Driver => CompositionTarget::Hands,
            Category::Hat => CompositionTarget::Head,
            _ => CompositionTarget::Other,
        });
        let driver_parts = self
            .driver_parts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, images)| match parse_part(&key) {
                Some(part) => Some((part, images)),
                None => {
                    warn!(target = "compose.catalog", product = %self.id, part = %key, "ignoring unknown driver part");
                    None
                }
            })
            .collect::<BTreeMap<_, _>>();
        ProductRecord {
            slug: self.slug.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            name: self.name,
            display_name: self.display_name,
            category: self.category,
            composition_target,
            image_url: self.image_url,
            reference_images: self.reference_images.unwrap_or_default(),
            driver_parts,
            hat_type: self.hat_type,
        }
        .with_webp_assets()
    }
}

fn parse_part(key: &str) -> Option<DriverPart> {
    match key.trim().to_ascii_lowercase().as_str() {
        "crown" => Some(DriverPart::Crown),
        "sole" => Some(DriverPart::Sole),
        "face" => Some(DriverPart::Face),
        "full" => Some(DriverPart::Full),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    fn client() -> SupabaseClient {
        SupabaseClient::new(
            SupabaseConfig {
                url: Url::parse("https://abc.supabase.co/").unwrap(),
                service_key: "service".into(),
                bucket: "blog-images".into(),
                product_table: "product_composition".into(),
            },
            Client::new(),
        )
    }

    #[test]
    fn query_filters_by_uuid_or_slug() {
        let c = client();
        let by_id = c.product_query_url("6f1c1a2e-3b4d-4e5f-8a9b-0c1d2e3f4a5b");
        assert!(by_id.contains("id=eq.6f1c1a2e-3b4d-4e5f-8a9b-0c1d2e3f4a5b"));
        let by_slug = c.product_query_url("gold weapon4");
        assert!(by_slug.starts_with("https://abc.supabase.co/rest/v1/product_composition?"));
        assert!(by_slug.contains("slug=eq.gold%20weapon4&is_active=eq.true"));
    }

    #[tokio::test]
    async fn public_url_encodes_segments() {
        let url = client()
            .public_url("originals/blog/2025-01/487/모델.png")
            .await
            .unwrap();
        assert_eq!(
            url,
            "https://abc.supabase.co/storage/v1/object/public/blog-images/originals/blog/2025-01/487/%EB%AA%A8%EB%8D%B8.png"
        );
    }

    #[test]
    fn rows_map_to_records() {
        let row: ProductRow = serde_json::from_value(serde_json::json!({
            "id": "6f1c1a2e-3b4d-4e5f-8a9b-0c1d2e3f4a5b",
            "slug": "gold2-sapphire",
            "name": "Gold2 Sapphire",
            "display_name": "골드2 사파이어",
            "category": "driver",
            "composition_target": null,
            "image_url": "originals/products/gold2-sapphire/main.png",
            "reference_images": null,
            "driver_parts": { "crown": ["c.webp"], "toe": ["t.webp"] },
            "hat_type": null,
            "is_active": true
        }))
        .unwrap();
        let record = row.into_record();
        assert_eq!(record.composition_target, CompositionTarget::Hands);
        assert_eq!(
            record.image_url.as_deref(),
            Some("originals/products/gold2-sapphire/main.webp")
        );
        assert!(record.reference_images.is_empty());
        assert_eq!(record.driver_parts.len(), 1);
        assert_eq!(record.part_images(DriverPart::Crown), ["c.webp".to_string()]);
    }
}
