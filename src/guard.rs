use reqwest::Url;
use std::net::IpAddr;
use thiserror::Error;
use tracing::debug;

/// The image-edit capability fetches every input itself, so anything it cannot reach
/// from the public internet is rejected here instead of failing remotely.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unresolvable image url `{url}`: {reason}")]
pub struct UnresolvableUrl {
    pub url: String,
    pub reason: GuardReason,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum GuardReason {
    #[error("empty or placeholder value")]
    Empty,
    #[error("relative path and no public base url configured")]
    RelativeWithoutBase,
    #[error("malformed url")]
    Malformed,
    #[error("loopback or private host is not publicly reachable")]
    NonPublicHost,
    #[error("only https urls are accepted")]
    NotHttps,
}

#[derive(Debug, Clone, Default)]
pub struct UrlGuard {
    base: Option<Url>,
}

impl UrlGuard {
    pub fn new(base: Option<Url>) -> Self {
        Self { base }
    }

    pub fn resolve(&self, candidate: &str) -> Result<Url, UnresolvableUrl> {
        self.resolve_with(candidate, None)
    }

    /// Makes `candidate` absolute (against `base_override`, else the configured base)
    /// and checks that the result is a public `https` url.
    pub fn resolve_with(
        &self,
        candidate: &str,
        base_override: Option<&Url>,
    ) -> Result<Url, UnresolvableUrl> {
        let trimmed = candidate.trim();
        if trimmed.is_empty() || trimmed == "-" || trimmed.len() < 3 {
            return Err(reject(candidate, GuardReason::Empty));
        }

        let resolved = match Url::parse(trimmed) {
            Ok(absolute) => absolute,
            Err(_) if !has_scheme(trimmed) => {
                let Some(base) = base_override.or(self.base.as_ref()) else {
                    return Err(reject(trimmed, GuardReason::RelativeWithoutBase));
                };
                let path = storage_path(trimmed);
                let joined = base
                    .join(&path)
                    .map_err(|_| reject(trimmed, GuardReason::Malformed))?;
                debug!(target = "compose.guard", from = trimmed, to = %joined, "resolved relative image path");
                joined
            }
            Err(_) => return Err(reject(trimmed, GuardReason::Malformed)),
        };

        check_public(trimmed, &resolved)?;
        Ok(resolved)
    }

    /// Re-checks a fully assembled outbound list right before it leaves the process.
    pub fn validate_all(&self, urls: &[Url]) -> Result<(), UnresolvableUrl> {
        for url in urls {
            check_public(url.as_str(), url)?;
        }
        Ok(())
    }
}

fn has_scheme(raw: &str) -> bool {
    match raw.find(':') {
        Some(idx) => {
            let scheme = &raw[..idx];
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn reject(url: &str, reason: GuardReason) -> UnresolvableUrl {
    UnresolvableUrl {
        url: url.to_string(),
        reason,
    }
}

/// Legacy `/main/products/...` paths predate the storage bucket layout.
fn storage_path(relative: &str) -> String {
    if let Some(rest) = relative.strip_prefix("/main/products/") {
        let path = format!("originals/products/{rest}");
        return match path.strip_prefix("originals/products/goods/") {
            Some(goods) => format!("originals/goods/{goods}"),
            None => path,
        };
    }
    relative.trim_start_matches('/').to_string()
}

fn check_public(raw: &str, url: &Url) -> Result<(), UnresolvableUrl> {
    let lowered = raw.to_ascii_lowercase();
    if lowered.contains("localhost") || lowered.contains("127.0.0.1") {
        return Err(reject(raw, GuardReason::NonPublicHost));
    }
    let Some(host) = url.host_str() else {
        return Err(reject(raw, GuardReason::Malformed));
    };
    if is_private_host(host) {
        return Err(reject(raw, GuardReason::NonPublicHost));
    }
    if url.scheme() != "https" {
        return Err(reject(raw, GuardReason::NotHttps));
    }
    Ok(())
}

fn is_private_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Ok(IpAddr::V6(ip)) => {
            ip.is_loopback() || ip.is_unspecified() || (ip.segments()[0] & 0xfe00) == 0xfc00
        }
        Err(_) => false,
    }
}
