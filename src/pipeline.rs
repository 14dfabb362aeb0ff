use crate::catalog::{CatalogError, LayeredCatalog, ProductCatalog, ProductRecord, StaticCatalog};
use crate::config::AppConfig;
use crate::fal::{EditRequest, EditResponse, FalClient, ImageEditor};
use crate::guard::{UnresolvableUrl, UrlGuard};
use crate::http::{build_client, build_streaming_client};
use crate::models::{
    ComposeMetadata, ComposeRequest, ComposeResponse, ComposedImage, GenerationResult,
    ProductSummary, PromptPreview,
};
use crate::persist::{
    DisabledStore, HttpFetcher, ObjectStore, PersistError, PersistTarget, ResultPersister,
};
use crate::prompt::{self, CompositionMode, PromptModifiers};
use crate::supabase::SupabaseClient;
use chrono::Utc;
use reqwest::Url;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::{task::JoinSet, time::Duration};
use tracing::{info, warn};

#[derive(Clone)]
pub struct Pipeline {
    catalog: Arc<dyn ProductCatalog>,
    editor: Arc<dyn ImageEditor>,
    persister: ResultPersister,
    guard: UrlGuard,
    generation_timeout: Duration,
}

/// Everything decided before the capability is called.
struct CompositionPlan {
    product: ProductRecord,
    prompt: String,
    image_urls: Vec<Url>,
    target: PersistTarget,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<dyn ProductCatalog>,
        editor: Arc<dyn ImageEditor>,
        persister: ResultPersister,
        guard: UrlGuard,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            editor,
            persister,
            guard,
            generation_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, CatalogError> {
        let http = build_client(&config.http);
        let supabase = config
            .supabase
            .clone()
            .map(|cfg| SupabaseClient::new(cfg, http.clone()));

        let local = match &config.catalog_path {
            Some(path) => Some(StaticCatalog::from_path(path)?),
            None => None,
        };
        let catalog: Arc<dyn ProductCatalog> = match (&supabase, local) {
            (Some(client), Some(local)) => {
                Arc::new(LayeredCatalog::new(Arc::new(client.clone()), Arc::new(local)))
            }
            (Some(client), None) => Arc::new(client.clone()),
            (None, Some(local)) => Arc::new(local),
            (None, None) => {
                warn!(target = "compose.pipeline", "no product catalog configured; every lookup will miss");
                Arc::new(StaticCatalog::default())
            }
        };

        let store: Arc<dyn ObjectStore> = match &supabase {
            Some(client) => Arc::new(client.clone()),
            None => {
                warn!(target = "compose.pipeline", "object storage not configured; results will not be persisted");
                Arc::new(DisabledStore)
            }
        };
        let bucket = config
            .supabase
            .as_ref()
            .map(|cfg| cfg.bucket.clone())
            .unwrap_or_else(|| "blog-images".to_string());

        if config.fal.api_key.is_none() {
            warn!(target = "compose.pipeline", "FAL_KEY is not set; generation calls will fail");
        }
        let editor = Arc::new(FalClient::new(
            build_streaming_client(&config.http),
            config.fal.clone(),
        ));

        Ok(Self::new(
            catalog,
            editor,
            ResultPersister::new(Arc::new(HttpFetcher::new(http)), store, bucket),
            UrlGuard::new(config.public_asset_base_url.clone()),
            config.generation_timeout,
        ))
    }

    pub async fn run(&self, request: ComposeRequest) -> Result<ComposeResponse, PipelineError> {
        let started = Instant::now();
        let plan = self.plan(&request).await?;

        let generated = self
            .capture_stage("generate", self.generate(&request, &plan))
            .await?;

        let results = self
            .capture_stage("persist", async {
                Ok(self.persist_all(&generated.images, &plan.target).await)
            })
            .await?;

        let failed = results.iter().filter(|r| r.error.is_some()).count();
        info!(
            target = "compose.pipeline",
            product = %plan.product.id,
            images = results.len(),
            persist_failures = failed,
            "composition finished"
        );

        Ok(ComposeResponse {
            success: true,
            images: results.into_iter().map(ComposedImage::from).collect(),
            product: summarize(&plan.product),
            metadata: ComposeMetadata {
                composed_at: Utc::now(),
                method: request.composition_method,
                processing_time_ms: started.elapsed().as_millis() as u64,
                description: generated.description,
                prompt: plan.prompt,
                image_urls: plan.image_urls.iter().map(Url::to_string).collect(),
                request_id: generated.request_id,
            },
        })
    }

    /// Validation, lookup, prompt and image list without calling the capability.
    pub async fn preview(&self, request: &ComposeRequest) -> Result<PromptPreview, PipelineError> {
        let plan = self.plan(request).await?;
        Ok(PromptPreview {
            product: summarize(&plan.product),
            image_urls: plan.image_urls.iter().map(Url::to_string).collect(),
            prompt: plan.prompt,
        })
    }

    async fn plan(&self, request: &ComposeRequest) -> Result<CompositionPlan, PipelineError> {
        let product_id = non_blank(request.product_id.as_deref())
            .ok_or_else(|| PipelineError::invalid_request("validate", "productId is required"))?;
        let base_image = request.photo_url();
        if base_image.is_none() && !request.product_only_mode {
            return Err(PipelineError::invalid_request(
                "validate",
                "baseImageUrl (or modelImageUrl) is required",
            ));
        }

        let product = self
            .capture_stage("resolve_product", self.resolve_product(product_id))
            .await?;

        let mode = CompositionMode::resolve(
            &product,
            request.composition_target,
            request.driver_part,
            request.product_only_mode,
            request.use_reference_images,
        );
        let modifiers = PromptModifiers {
            background: request.composition_background,
            replace_logo: request.replace_logo,
            color: request.color_override(),
        };
        let prompt = match non_blank(request.prompt.as_deref()) {
            Some(custom) => prompt::with_override(custom, &product, &mode, &modifiers),
            None => prompt::build_prompt(&product, &mode, &modifiers),
        };
        info!(
            target = "compose.pipeline",
            product = %product.id,
            mode = ?mode,
            driver_part = request.driver_part.as_str(),
            prompt = %truncate(&prompt, 120),
            "prompt built"
        );

        let image_urls = self
            .assemble_images(request, &product, &mode, base_image)
            .map_err(|err| PipelineError::unresolvable("resolve_images", err))?;
        if image_urls.is_empty() {
            return Err(PipelineError::invalid_request(
                "resolve_images",
                "no product or reference images available to compose",
            ));
        }
        self.guard
            .validate_all(&image_urls)
            .map_err(|err| PipelineError::unresolvable("resolve_images", err))?;

        let target = PersistTarget {
            product_id: product_id.to_string(),
            product_slug: product.slug.clone(),
            category: product.category,
            base_image_url: request.placement_hint().map(str::to_string),
        };

        Ok(CompositionPlan {
            product,
            prompt,
            image_urls,
            target,
        })
    }

    async fn resolve_product(&self, product_id: &str) -> Result<ProductRecord, PipelineError> {
        self.catalog
            .find_product(product_id)
            .await
            .map_err(|err| PipelineError::internal("resolve_product", err.to_string()))?
            .ok_or_else(|| {
                PipelineError::product_not_found(
                    "resolve_product",
                    format!("product not found: {product_id}"),
                )
            })
    }

    /// Base photograph first, then the product (or driver-part) image, then
    /// reference angles. Each url passes the guard as it is added.
    fn assemble_images(
        &self,
        request: &ComposeRequest,
        product: &ProductRecord,
        mode: &CompositionMode,
        base_image: Option<&str>,
    ) -> Result<Vec<Url>, UnresolvableUrl> {
        let mut urls: Vec<Url> = Vec::new();
        let mut push = |url: Url| {
            if !urls.contains(&url) {
                urls.push(url);
            }
        };

        if !request.product_only_mode
            && let Some(base) = base_image
        {
            push(self.guard.resolve(base)?);
        }

        let part_images = mode
            .driver_part()
            .map(|part| product.part_images(part))
            .unwrap_or_default();
        let main_images: Vec<&str> = match non_blank(request.product_image_url.as_deref()) {
            Some(explicit) => vec![explicit],
            None if !part_images.is_empty() => part_images.iter().map(String::as_str).collect(),
            None => product.image_url.as_deref().into_iter().collect(),
        };
        for candidate in &main_images {
            push(self.guard.resolve(candidate)?);
        }

        if request.use_reference_images {
            let main_keys: Vec<String> = main_images.iter().map(|m| comparable(m)).collect();
            for reference in &product.reference_images {
                if reference.trim().is_empty() || main_keys.contains(&comparable(reference)) {
                    continue;
                }
                push(self.guard.resolve(reference)?);
            }
        }

        Ok(urls)
    }

    async fn generate(
        &self,
        request: &ComposeRequest,
        plan: &CompositionPlan,
    ) -> Result<EditResponse, PipelineError> {
        self.guard
            .validate_all(&plan.image_urls)
            .map_err(|err| PipelineError::unresolvable("generate", err))?;
        let edit = EditRequest {
            method: request.composition_method,
            instruction: plan.prompt.clone(),
            image_urls: plan.image_urls.clone(),
            num_images: request.num_images,
            aspect_ratio: request.aspect_ratio.clone(),
            output_format: request.output_format.clone(),
            resolution: request.resolution.clone(),
        };

        match tokio::time::timeout(self.generation_timeout, self.editor.edit(&edit)).await {
            Err(_) => Err(PipelineError::generation_failed(
                "generate",
                format!(
                    "generation timed out after {}s",
                    self.generation_timeout.as_secs_f64()
                ),
            )),
            Ok(Err(err)) => Err(PipelineError::generation_failed("generate", err.to_string())),
            Ok(Ok(response)) if response.images.is_empty() => Err(PipelineError::generation_failed(
                "generate",
                "generation returned no images",
            )),
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// Persists every generated image concurrently. Each result is written into
    /// the slot of its source index, so the output keeps the capability's order.
    async fn persist_all(&self, images: &[String], target: &PersistTarget) -> Vec<GenerationResult> {
        let mut slots: Vec<Option<GenerationResult>> = vec![None; images.len()];
        let mut tasks = JoinSet::new();
        for (idx, url) in images.iter().enumerate() {
            let persister = self.persister.clone();
            let target = target.clone();
            let url = url.clone();
            tasks.spawn(async move {
                let label = format!("composed-{}", idx + 1);
                let outcome = persister.persist(&url, &target, &label).await;
                (idx, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    slots[idx] = Some(generation_result(&images[idx], outcome));
                }
                Err(err) => {
                    warn!(target = "compose.pipeline", error = %err, "persist task aborted");
                }
            }
        }

        slots
            .into_iter()
            .zip(images)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| GenerationResult {
                    external_url: url.clone(),
                    persisted_url: None,
                    path: None,
                    error: Some("persist task aborted".to_string()),
                })
            })
            .collect()
    }

    async fn capture_stage<T, Fut>(&self, name: &'static str, fut: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        if let Err(err) = &outcome {
            warn!(target = "compose.pipeline", stage = name, elapsed_ms = elapsed_ms as u64, error = %err, "stage failed");
        }
        outcome
    }
}

fn generation_result(
    external_url: &str,
    outcome: Result<crate::persist::PersistedImage, PersistError>,
) -> GenerationResult {
    crate::metrics::persist_outcome(outcome.is_ok());
    match outcome {
        Ok(stored) => GenerationResult {
            external_url: external_url.to_string(),
            persisted_url: Some(stored.public_url),
            path: Some(stored.path),
            error: None,
        },
        Err(err) => {
            warn!(target = "compose.pipeline", url = external_url, error = %err, "result kept unpersisted");
            GenerationResult {
                external_url: external_url.to_string(),
                persisted_url: None,
                path: None,
                error: Some(err.to_string()),
            }
        }
    }
}

fn summarize(product: &ProductRecord) -> ProductSummary {
    ProductSummary {
        id: product.id.clone(),
        name: product.name.clone(),
        display_name: product.display_name().to_string(),
        category: product.category,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn comparable(path: &str) -> String {
    path.trim().trim_start_matches('/').to_lowercase()
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        value.chars().take(max).collect::<String>() + "…"
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidRequest,
    ProductNotFound,
    UnresolvableUrl,
    GenerationFailed,
    Internal,
}

impl PipelineErrorKind {
    /// Local rejections the caller can fix, as opposed to upstream failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineErrorKind::InvalidRequest
                | PipelineErrorKind::ProductNotFound
                | PipelineErrorKind::UnresolvableUrl
        )
    }
}

impl PipelineError {
    fn new(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_request(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::InvalidRequest)
    }

    pub fn product_not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::ProductNotFound)
    }

    pub fn unresolvable(stage: &'static str, err: UnresolvableUrl) -> Self {
        Self::new(stage, err.to_string(), PipelineErrorKind::UnresolvableUrl)
    }

    pub fn generation_failed(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::GenerationFailed)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Internal)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::{Category, CompositionTarget, DriverPart, HatType};
    use crate::fal::CapabilityError;
    use crate::persist::{FetchedImage, ImageFetcher, StorageError, StoredObject};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    pub(crate) struct FakeEditor {
        pub outcome: Result<Vec<String>, String>,
        pub delay: Duration,
        pub calls: AtomicUsize,
        pub last: Mutex<Option<EditRequest>>,
    }

    impl FakeEditor {
        pub(crate) fn returning(images: &[&str]) -> Self {
            Self {
                outcome: Ok(images.iter().map(|s| s.to_string()).collect()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                outcome: Err(message.to_string()),
                ..Self::returning(&[])
            }
        }
    }

    #[async_trait]
    impl ImageEditor for FakeEditor {
        async fn edit(&self, request: &EditRequest) -> Result<EditResponse, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().await = Some(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.outcome {
                Ok(images) => Ok(EditResponse {
                    images: images.clone(),
                    description: Some("composited".into()),
                    request_id: Some("req-1".into()),
                }),
                Err(message) => Err(CapabilityError::Rejected(message.clone())),
            }
        }
    }

    /// Fails downloads for urls containing `fail`; earlier indices finish last.
    pub(crate) struct ScriptedFetcher;

    #[async_trait]
    impl ImageFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedImage, PersistError> {
            let idx: u64 = url
                .rsplit('/')
                .next()
                .and_then(|file| file.trim_start_matches(|c: char| !c.is_ascii_digit()).split('.').next())
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(idx * 8))).await;
            if url.contains("fail") {
                return Err(PersistError::DownloadFailed("HTTP 404 Not Found".into()));
            }
            Ok(FetchedImage {
                bytes: vec![0xFF],
                content_type: Some("image/png".into()),
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn upload(
            &self,
            path: &str,
            _bytes: Vec<u8>,
            _content_type: &str,
        ) -> Result<StoredObject, StorageError> {
            self.paths.lock().await.push(path.to_string());
            Ok(StoredObject {
                key: path.to_string(),
            })
        }

        async fn public_url(&self, path: &str) -> Result<String, StorageError> {
            Ok(format!("https://store.example.com/blog-images/{path}"))
        }
    }

    pub(crate) fn driver() -> ProductRecord {
        let mut parts = BTreeMap::new();
        parts.insert(
            DriverPart::Crown,
            vec!["originals/products/v3/crown-1.webp".to_string()],
        );
        ProductRecord {
            id: "d-1".into(),
            slug: "v3".into(),
            name: "Secret Force V3".into(),
            display_name: Some("시크리트포스 V3".into()),
            category: Category::Driver,
            composition_target: CompositionTarget::Hands,
            image_url: Some("originals/products/v3/main.webp".into()),
            reference_images: vec![
                "/originals/products/v3/main.webp".into(),
                "originals/products/v3/side.webp".into(),
            ],
            driver_parts: parts,
            hat_type: None,
        }
    }

    fn bucket_hat() -> ProductRecord {
        ProductRecord {
            id: "h-1".into(),
            slug: "massgoo-bucket".into(),
            name: "MASSGOO Bucket".into(),
            display_name: None,
            category: Category::Hat,
            composition_target: CompositionTarget::Head,
            image_url: Some("originals/goods/massgoo-bucket/main.webp".into()),
            reference_images: vec![],
            driver_parts: BTreeMap::new(),
            hat_type: Some(HatType::Bucket),
        }
    }

    pub(crate) fn pipeline_with(editor: Arc<FakeEditor>, store: Arc<MemoryStore>) -> Pipeline {
        Pipeline::new(
            Arc::new(StaticCatalog::new(vec![driver(), bucket_hat()])),
            editor,
            ResultPersister::new(Arc::new(ScriptedFetcher), store, "blog-images".into()),
            UrlGuard::new(Some(
                Url::parse("https://abc.supabase.co/storage/v1/object/public/blog-images/")
                    .unwrap(),
            )),
            Duration::from_secs(5),
        )
    }

    const BASE: &str = "https://abc.supabase.co/storage/v1/object/public/blog-images/originals/models/m1.png";

    #[tokio::test]
    async fn scenario_a_bucket_hat_prompt() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let pipeline = pipeline_with(editor.clone(), Arc::default());
        let preview = pipeline
            .preview(&ComposeRequest::new(BASE, "massgoo-bucket"))
            .await
            .expect("preview");
        assert!(preview.prompt.contains("버킷햇"));
        assert!(!preview.prompt.contains(prompt::ANGLE_CLAUSE));
        assert_eq!(preview.image_urls.len(), 2);
        assert_eq!(editor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scenario_b_crown_uses_part_image_and_crown_clause() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let pipeline = pipeline_with(editor.clone(), Arc::default());
        let mut request = ComposeRequest::new(BASE, "d-1");
        request.driver_part = DriverPart::Crown;
        pipeline.run(request).await.expect("run");

        let sent = editor.last.lock().await.clone().expect("edit request");
        assert!(sent.instruction.contains("ONLY the crown"));
        assert!(sent.instruction.contains("Keep the sole, the face"));
        let urls: Vec<String> = sent.image_urls.iter().map(Url::to_string).collect();
        assert_eq!(urls[0], BASE);
        assert!(urls[1].ends_with("originals/products/v3/crown-1.webp"));
        assert!(urls.iter().all(|u| u.starts_with("https://")));
    }

    #[tokio::test]
    async fn scenario_c_localhost_base_never_reaches_capability() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let pipeline = pipeline_with(editor.clone(), Arc::default());
        let err = pipeline
            .run(ComposeRequest::new("http://localhost:3000/x.png", "d-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::UnresolvableUrl);
        assert!(err.kind().is_client_error());
        assert_eq!(editor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scenario_d_one_persist_failure_keeps_both_results() {
        let editor = Arc::new(FakeEditor::returning(&[
            "https://v3.fal.media/out/1.png",
            "https://v3.fal.media/fail/2.png",
        ]));
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline_with(editor, store.clone());
        let mut request = ComposeRequest::new(BASE, "d-1");
        request.num_images = 2;
        let response = pipeline.run(request).await.expect("run");

        assert!(response.success);
        assert_eq!(response.images.len(), 2);
        assert!(response.images[0].error.is_none());
        assert!(response.images[0].image_url.starts_with("https://store.example.com/"));
        assert!(response.images[1].error.is_some());
        assert_eq!(response.images[1].image_url, "https://v3.fal.media/fail/2.png");
        assert_eq!(response.images[1].original_url, "https://v3.fal.media/fail/2.png");
        assert_eq!(response.product.id, "d-1");
        assert_eq!(response.metadata.description.as_deref(), Some("composited"));
        assert_eq!(store.paths.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn results_keep_capability_order_under_out_of_order_completion() {
        let urls = [
            "https://v3.fal.media/out/0.png",
            "https://v3.fal.media/fail/1.png",
            "https://v3.fal.media/out/2.png",
            "https://v3.fal.media/fail/3.png",
            "https://v3.fal.media/out/4.png",
        ];
        let editor = Arc::new(FakeEditor::returning(&urls));
        let pipeline = pipeline_with(editor, Arc::default());
        let mut request = ComposeRequest::new(BASE, "d-1");
        request.num_images = 5;
        let response = pipeline.run(request).await.expect("run");

        assert_eq!(response.images.len(), 5);
        for (idx, image) in response.images.iter().enumerate() {
            assert_eq!(image.original_url, urls[idx]);
            assert_eq!(image.error.is_some(), idx == 1 || idx == 3, "index {idx}");
        }
        for (idx, label) in [(0, "/composed-1-"), (2, "/composed-3-"), (4, "/composed-5-")] {
            let path = response.images[idx].path.as_deref().expect("stored");
            assert!(path.contains(label), "{path}");
        }
    }

    #[tokio::test]
    async fn all_persist_failures_still_succeed_at_batch_level() {
        let editor = Arc::new(FakeEditor::returning(&[
            "https://v3.fal.media/fail/1.png",
            "https://v3.fal.media/fail/2.png",
        ]));
        let pipeline = pipeline_with(editor, Arc::default());
        let response = pipeline
            .run(ComposeRequest::new(BASE, "d-1"))
            .await
            .expect("run");
        assert!(response.success);
        assert!(response.images.iter().all(|i| i.error.is_some()));
    }

    #[tokio::test]
    async fn missing_fields_fail_before_any_external_call() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let pipeline = pipeline_with(editor.clone(), Arc::default());

        let mut no_product = ComposeRequest::new(BASE, "d-1");
        no_product.product_id = Some("  ".into());
        let err = pipeline.run(no_product).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidRequest);

        let mut no_base = ComposeRequest::new(BASE, "d-1");
        no_base.base_image_url = None;
        let err = pipeline.run(no_base).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::InvalidRequest);
        assert_eq!(err.stage(), "validate");

        assert_eq!(editor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_product_is_reported() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let pipeline = pipeline_with(editor.clone(), Arc::default());
        let err = pipeline
            .run(ComposeRequest::new(BASE, "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::ProductNotFound);
        assert!(err.detail().contains("nope"));
        assert_eq!(editor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn capability_failures_fail_the_whole_request() {
        let store = Arc::new(MemoryStore::default());
        let rejecting = pipeline_with(Arc::new(FakeEditor::failing("quota exceeded")), store.clone());
        let err = rejecting
            .run(ComposeRequest::new(BASE, "d-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::GenerationFailed);
        assert!(err.detail().contains("quota exceeded"));

        let empty = pipeline_with(Arc::new(FakeEditor::returning(&[])), store.clone());
        let err = empty.run(ComposeRequest::new(BASE, "d-1")).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::GenerationFailed);
        assert!(!err.kind().is_client_error());
        assert!(store.paths.lock().await.is_empty());
    }

    #[tokio::test]
    async fn generation_timeout_is_a_generation_failure() {
        let mut slow = FakeEditor::returning(&["https://v3.fal.media/out/1.png"]);
        slow.delay = Duration::from_secs(2);
        let mut pipeline = pipeline_with(Arc::new(slow), Arc::default());
        pipeline.generation_timeout = Duration::from_millis(50);
        let err = pipeline
            .run(ComposeRequest::new(BASE, "d-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::GenerationFailed);
        assert!(err.detail().contains("timed out"));
    }

    #[tokio::test]
    async fn reference_images_are_deduplicated_against_main_image() {
        let pipeline = pipeline_with(Arc::new(FakeEditor::returning(&[])), Arc::default());
        let preview = pipeline
            .preview(&ComposeRequest::new(BASE, "v3"))
            .await
            .expect("preview");
        assert_eq!(preview.image_urls.len(), 3);
        assert!(preview.image_urls[1].ends_with("/main.webp"));
        assert!(preview.image_urls[2].ends_with("/side.webp"));

        let mut without_refs = ComposeRequest::new(BASE, "v3");
        without_refs.use_reference_images = false;
        let preview = pipeline.preview(&without_refs).await.expect("preview");
        assert_eq!(preview.image_urls.len(), 2);
    }

    #[tokio::test]
    async fn explicit_prompt_and_product_image_take_precedence() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let pipeline = pipeline_with(editor.clone(), Arc::default());
        let mut request = ComposeRequest::new(BASE, "d-1");
        request.prompt = Some("Swap the club.".into());
        request.product_image_url = Some("https://cdn.example.com/v3-hero.webp".into());
        request.replace_logo = true;
        pipeline.run(request).await.expect("run");

        let sent = editor.last.lock().await.clone().unwrap();
        assert!(sent.instruction.starts_with("Swap the club."));
        assert!(sent.instruction.contains("MASSGOO logo"));
        assert_eq!(sent.image_urls[1].as_str(), "https://cdn.example.com/v3-hero.webp");
    }

    #[tokio::test]
    async fn product_only_mode_needs_no_base_image() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let pipeline = pipeline_with(editor.clone(), Arc::default());
        let mut request = ComposeRequest::new(BASE, "d-1");
        request.base_image_url = None;
        request.product_only_mode = true;
        let response = pipeline.run(request).await.expect("run");
        assert!(response.metadata.prompt.starts_with("Product-only shot"));
        assert!(response.metadata.image_urls.iter().all(|u| u.as_str() != BASE));
        assert!(response.images[0].path.as_deref().unwrap().starts_with("originals/products/v3/gallery/"));
    }

    #[tokio::test]
    async fn non_public_product_image_is_a_guard_error() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let pipeline = pipeline_with(editor.clone(), Arc::default());
        let mut request = ComposeRequest::new(BASE, "d-1");
        request.product_image_url = Some("https://127.0.0.1/v3.png".into());
        let err = pipeline.run(request).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::UnresolvableUrl);
        assert_eq!(err.stage(), "resolve_images");
        assert_eq!(editor.calls.load(Ordering::SeqCst), 0);
    }
    #[tokio::test]
    async fn model_photo_is_sent_and_blog_hint_places_results() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline_with(editor.clone(), store.clone());
        let blog = "https://abc.supabase.co/storage/v1/object/public/blog-images/originals/blog/2025-01/487/x.png";
        let mut request = ComposeRequest::new(blog, "d-1");
        request.model_image_url = Some(BASE.into());
        let response = pipeline.run(request).await.expect("run");

        let sent = editor.last.lock().await.clone().expect("edit request");
        assert_eq!(sent.image_urls[0].as_str(), BASE);
        assert!(sent.image_urls.iter().all(|u| u.as_str() != blog));
        let path = response.images[0].path.as_deref().expect("stored path");
        assert!(path.starts_with("originals/blog/2025-01/487/composed-1-"), "{path}");
        assert_eq!(store.paths.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn generate_rechecks_image_urls_before_the_capability() {
        let editor = Arc::new(FakeEditor::returning(&["https://v3.fal.media/out/1.png"]));
        let pipeline = pipeline_with(editor.clone(), Arc::default());
        let plan = CompositionPlan {
            product: driver(),
            prompt: "p".into(),
            image_urls: vec![
                Url::parse(BASE).unwrap(),
                Url::parse("http://127.0.0.1/x.png").unwrap(),
            ],
            target: PersistTarget {
                product_id: "d-1".into(),
                product_slug: "v3".into(),
                category: Category::Driver,
                base_image_url: None,
            },
        };
        let err = pipeline
            .generate(&ComposeRequest::new(BASE, "d-1"), &plan)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::UnresolvableUrl);
        assert_eq!(err.stage(), "generate");
        assert_eq!(editor.calls.load(Ordering::SeqCst), 0);
    }
}
