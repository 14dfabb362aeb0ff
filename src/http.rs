use crate::config::HttpConfig;
use reqwest::Client;

/// Shared client for downloads, storage and catalog calls. The generation call
/// is bounded separately by the orchestrator's own timeout.
pub fn build_client(config: &HttpConfig) -> Client {
    Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Client without a whole-request timeout, used for the long-running capability call.
pub fn build_streaming_client(config: &HttpConfig) -> Client {
    Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}
