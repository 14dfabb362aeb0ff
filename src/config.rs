use eyre::{Result, WrapErr};
use reqwest::Url;
use std::{env, path::PathBuf, time::Duration};

/// Process-wide settings, read once at startup and handed to every component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub fal: FalConfig,
    pub supabase: Option<SupabaseConfig>,
    pub public_asset_base_url: Option<Url>,
    pub catalog_path: Option<PathBuf>,
    pub generation_timeout: Duration,
    pub http: HttpConfig,
    pub request_max_bytes: usize,
    pub admin_keys: String,
    pub rate_limit: RateLimitConfig,
    pub queue_capacity: usize,
    pub redis_url: Option<String>,
    pub idempotency_ttl_secs: u64,
    pub job_ttl: Duration,
    pub metrics_key: Option<String>,
    pub openapi_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FalConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: Url,
    pub service_key: String,
    pub bucket: String,
    pub product_table: String,
}

impl SupabaseConfig {
    /// Public prefix of the storage bucket, always ending in `/`.
    pub fn public_bucket_url(&self) -> Result<Url> {
        let base = self.url.as_str().trim_end_matches('/');
        Url::parse(&format!(
            "{base}/storage/v1/object/public/{}/",
            self.bucket
        ))
        .wrap_err("building public bucket url")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub rate_per_sec: f64,
    pub capacity: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            fal: FalConfig {
                api_key: None,
                base_url: "https://fal.run".to_string(),
            },
            supabase: None,
            public_asset_base_url: None,
            catalog_path: None,
            generation_timeout: Duration::from_secs(600),
            http: HttpConfig {
                timeout: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(5),
            },
            request_max_bytes: 256 * 1024,
            admin_keys: String::new(),
            rate_limit: RateLimitConfig {
                rate_per_sec: 1.0,
                capacity: 5.0,
            },
            queue_capacity: 16,
            redis_url: None,
            idempotency_ttl_secs: 3600,
            job_ttl: Duration::from_secs(3600),
            metrics_key: None,
            openapi_key: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let supabase = match (env::var("SUPABASE_URL").ok(), service_key_from_env()) {
            (Some(raw), Some(service_key)) => Some(SupabaseConfig {
                url: Url::parse(raw.trim()).wrap_err("SUPABASE_URL is not a valid url")?,
                service_key,
                bucket: non_empty_var("STORAGE_BUCKET").unwrap_or_else(|| "blog-images".into()),
                product_table: non_empty_var("PRODUCT_TABLE")
                    .unwrap_or_else(|| "product_composition".into()),
            }),
            _ => None,
        };

        let public_asset_base_url = match non_empty_var("PUBLIC_ASSET_BASE_URL") {
            Some(raw) => Some(
                Url::parse(&with_trailing_slash(&raw))
                    .wrap_err("PUBLIC_ASSET_BASE_URL is not a valid url")?,
            ),
            None => match &supabase {
                Some(cfg) => Some(cfg.public_bucket_url()?),
                None => None,
            },
        };

        Ok(Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            fal: FalConfig {
                api_key: non_empty_var("FAL_KEY").or_else(|| non_empty_var("FAL_API_KEY")),
                base_url: non_empty_var("FAL_API_BASE")
                    .map(|v| v.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.fal.base_url),
            },
            supabase,
            public_asset_base_url,
            catalog_path: non_empty_var("PRODUCT_CATALOG_PATH").map(PathBuf::from),
            generation_timeout: seconds_var("GENERATION_TIMEOUT_SECS")
                .unwrap_or(defaults.generation_timeout),
            http: HttpConfig {
                timeout: seconds_var("HTTP_TIMEOUT_SECS").unwrap_or(defaults.http.timeout),
                connect_timeout: seconds_var("HTTP_CONNECT_TIMEOUT_SECS")
                    .unwrap_or(defaults.http.connect_timeout),
            },
            request_max_bytes: parsed_var::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.request_max_bytes),
            admin_keys: env::var("ADMIN_API_KEYS").unwrap_or_default(),
            rate_limit: RateLimitConfig {
                rate_per_sec: parsed_var::<f64>("RATE_LIMIT_PER_SEC")
                    .filter(|v| *v > 0.0)
                    .unwrap_or(defaults.rate_limit.rate_per_sec),
                capacity: parsed_var::<f64>("RATE_LIMIT_CAPACITY")
                    .filter(|v| *v >= 1.0)
                    .unwrap_or(defaults.rate_limit.capacity),
            },
            queue_capacity: parsed_var::<usize>("QUEUE_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.queue_capacity),
            redis_url: non_empty_var("REDIS_URL"),
            idempotency_ttl_secs: parsed_var::<u64>("IDEMPOTENCY_TTL_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.idempotency_ttl_secs),
            job_ttl: seconds_var("JOB_TTL_SECS").unwrap_or(defaults.job_ttl),
            metrics_key: non_empty_var("METRICS_KEY"),
            openapi_key: non_empty_var("OPENAPI_KEY"),
        })
    }
}

fn service_key_from_env() -> Option<String> {
    non_empty_var("SUPABASE_SERVICE_ROLE_KEY")
        .or_else(|| non_empty_var("SUPABASE_SERVICE_KEY"))
        .or_else(|| non_empty_var("SUPABASE_KEY"))
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    non_empty_var(key).and_then(|v| v.parse::<T>().ok())
}

/// Whole seconds from the environment; zero falls back to the default.
fn seconds_var(key: &str) -> Option<Duration> {
    nonzero_secs(parsed_var(key))
}

fn nonzero_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|v| *v > 0).map(Duration::from_secs)
}

fn with_trailing_slash(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}
