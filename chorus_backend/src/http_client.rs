use anyhow::{Context, Result};

/// Build the shared HTTP client. System proxy discovery is opt-in via
/// `CHORUS_ENABLE_SYSTEM_PROXY`; if it fails we retry without a proxy.
pub fn build_http_client() -> Result<reqwest::Client> {
    if system_proxy_enabled() {
        match reqwest::Client::builder().build() {
            Ok(client) => return Ok(client),
            Err(e) => tracing::warn!(
                "HTTP client initialization with system proxy failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    reqwest::Client::builder()
        .no_proxy()
        .build()
        .context("Failed to initialize HTTP client")
}

fn system_proxy_enabled() -> bool {
    std::env::var("CHORUS_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
