//! Page rendering boundary.
//!
//! The pipeline never fetches pages directly; it goes through the
//! [`Renderer`] trait so a JavaScript-rendering engine can be dropped in.
//! [`HttpRenderer`] is the shipped implementation: a plain HTTP fetch over
//! reqwest, sufficient for server-rendered storefronts.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("Shelfscrape/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum response body size we accept (10 MB).
const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Render outcome types
// ---------------------------------------------------------------------------

/// A fully rendered page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// URL after redirects.
    pub final_url: Url,
    /// Full page HTML.
    pub html: String,
    /// HTTP status code.
    pub status: u16,
    /// SHA-256 hash of the body.
    pub content_hash: String,
    /// When the page was fetched.
    pub fetched_at: DateTime<Utc>,
}

/// Rendering failure, classified for retry policy.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The request timed out — transient, worth retrying.
    #[error("render timeout for {url}")]
    Timeout { url: String },

    /// Navigation failed (connection error, HTTP error status, bad body).
    #[error("navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },

    /// The target refused or is disallowed (4xx block, oversized body,
    /// private address). Not retryable.
    #[error("blocked: {url}: {reason}")]
    Blocked { url: String, reason: String },
}

impl RenderError {
    /// Whether the orchestrator should retry this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Navigation { .. } => true,
            Self::Blocked { .. } => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Renderer trait
// ---------------------------------------------------------------------------

/// Renders a URL into final HTML. Implementations own their transport.
#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    /// Fetch and render a page.
    async fn render(&self, url: &Url) -> Result<RenderedPage, RenderError>;
}

// ---------------------------------------------------------------------------
// HttpRenderer
// ---------------------------------------------------------------------------

/// HTTP-only renderer over reqwest.
pub struct HttpRenderer {
    client: Client,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpRenderer {
    /// Create a renderer with default settings.
    pub fn new() -> Result<Self, RenderError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a renderer with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, RenderError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .map_err(|e| RenderError::Navigation {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs (integration tests only).
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }
}

#[async_trait::async_trait]
impl Renderer for HttpRenderer {
    async fn render(&self, url: &Url) -> Result<RenderedPage, RenderError> {
        if !self.allow_localhost && is_private_target(url) {
            return Err(RenderError::Blocked {
                url: url.to_string(),
                reason: "private or loopback address".into(),
            });
        }

        debug!(%url, "fetching page");

        let response = self.client.get(url.as_str()).send().await.map_err(|e| {
            if e.is_timeout() {
                RenderError::Timeout {
                    url: url.to_string(),
                }
            } else {
                RenderError::Navigation {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let final_url = response.url().clone();

        if status.is_client_error() {
            return Err(RenderError::Blocked {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(RenderError::Navigation {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        if let Some(len) = response.content_length() {
            if len > MAX_BODY_BYTES {
                return Err(RenderError::Blocked {
                    url: url.to_string(),
                    reason: format!("body too large ({len} bytes, max {MAX_BODY_BYTES})"),
                });
            }
        }

        let status_code = status.as_u16();
        let html = response.text().await.map_err(|e| RenderError::Navigation {
            url: url.to_string(),
            reason: format!("body read failed: {e}"),
        })?;

        Ok(RenderedPage {
            final_url,
            content_hash: compute_hash(&html),
            status: status_code,
            html,
            fetched_at: Utc::now(),
        })
    }
}

/// Check if a URL targets a loopback/private address.
fn is_private_target(url: &Url) -> bool {
    if let Some(host) = url.host_str() {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return match ip {
                IpAddr::V4(v4) => {
                    v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
                }
                IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
            };
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }
    false
}

/// Compute SHA-256 hash of content.
fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        let hash = compute_hash("hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn private_targets_detected() {
        for raw in [
            "http://127.0.0.1:8080/",
            "http://10.0.0.1/",
            "http://192.168.1.1/admin",
            "http://localhost:3000/",
        ] {
            assert!(is_private_target(&Url::parse(raw).unwrap()), "{raw}");
        }
        assert!(!is_private_target(
            &Url::parse("https://shop.example.com/").unwrap()
        ));
    }

    #[tokio::test]
    async fn renders_page_with_mock_server() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/cat/shoes"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_string("<html><body><h1>Shoes</h1></body></html>"),
            )
            .mount(&server)
            .await;

        let renderer = HttpRenderer::new().unwrap().allow_localhost();
        let url = Url::parse(&format!("{}/cat/shoes", server.uri())).unwrap();
        let page = renderer.render(&url).await.unwrap();

        assert_eq!(page.status, 200);
        assert!(page.html.contains("Shoes"));
        assert_eq!(page.content_hash.len(), 64);
    }

    #[tokio::test]
    async fn client_error_is_blocked_not_retryable() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/gone"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let renderer = HttpRenderer::new().unwrap().allow_localhost();
        let url = Url::parse(&format!("{}/gone", server.uri())).unwrap();
        let err = renderer.render(&url).await.unwrap_err();

        assert!(matches!(err, RenderError::Blocked { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/flaky"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let renderer = HttpRenderer::new().unwrap().allow_localhost();
        let url = Url::parse(&format!("{}/flaky", server.uri())).unwrap();
        let err = renderer.render(&url).await.unwrap_err();

        assert!(matches!(err, RenderError::Navigation { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn private_target_blocked_by_default() {
        let renderer = HttpRenderer::new().unwrap();
        let url = Url::parse("http://127.0.0.1:1/").unwrap();
        let err = renderer.render(&url).await.unwrap_err();
        assert!(matches!(err, RenderError::Blocked { .. }));
    }
}
