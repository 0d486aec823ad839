//! Model boundary: every LLM interaction goes through the [`ModelClient`]
//! trait so tests can substitute a scripted client.
//!
//! [`OpenRouterClient`] is the shipped implementation, speaking the
//! OpenAI-compatible chat-completions API with a different model per task.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use shelfscrape_shared::{OpenRouterConfig, ProductCandidate, SchemaDefinition};

/// A candidate link submitted for category classification.
#[derive(Debug, Clone, Serialize)]
pub struct LinkCandidate {
    /// Absolute normalized URL.
    pub url: String,
    /// Cleaned anchor HTML the link came from, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_html: Option<String>,
}

/// Model-call failure, classified for retry policy.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Transport or non-success HTTP status.
    #[error("model request failed: {0}")]
    Http(String),

    /// The provider asked us to back off.
    #[error("model rate limited")]
    RateLimited,

    /// The response arrived but could not be parsed as the expected JSON.
    #[error("malformed model response: {0}")]
    Malformed(String),

    /// The response carried no content at all.
    #[error("empty model response")]
    Empty,
}

impl ModelError {
    /// Whether the caller should retry this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited => true,
            Self::Malformed(_) | Self::Empty => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ModelClient trait
// ---------------------------------------------------------------------------

/// The three model-backed operations of the pipeline.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    /// From a batch of candidate links, return the URLs that are product
    /// category pages. The returned URLs are a subset of the input batch.
    async fn classify_links(
        &self,
        domain: &str,
        candidates: &[LinkCandidate],
    ) -> Result<Vec<String>, ModelError>;

    /// Generate an extraction schema from a reduced listing-page sample.
    async fn generate_schema(
        &self,
        domain: &str,
        sample_html: &str,
    ) -> Result<SchemaDefinition, ModelError>;

    /// Extract product records directly from reduced listing-page HTML.
    /// Fallback path for when no schema applies.
    async fn extract_products(&self, html: &str) -> Result<Vec<ProductCandidate>, ModelError>;
}

// ---------------------------------------------------------------------------
// OpenRouter client
// ---------------------------------------------------------------------------

const CLASSIFY_SYSTEM: &str = "You classify links from an e-commerce site. \
A category page lists multiple products for sale (e.g. /mens/shoes, /sale, \
/collections/lamps). Not category pages: informational pages, account/cart, \
blog posts, individual product pages, legal pages. \
Respond with JSON: {\"category_urls\": [\"...\"]} containing only URLs from \
the given list that are product category pages.";

const SCHEMA_SYSTEM: &str = "You derive a CSS extraction schema from \
e-commerce listing-page HTML. Find the repeating product container and \
selectors for its fields. Respond with JSON: \
{\"base_selector\": \"...\", \"fields\": [{\"name\": \"...\", \
\"selector\": \"...\", \"kind\": \"text\"} | {\"name\": \"...\", \
\"selector\": \"...\", \"kind\": \"attribute\", \"attribute\": \"href\"}]}. \
Selectors are relative to the base container. Field names to use when \
present: name, price, original_price, discount, image_url, url.";

const EXTRACT_SYSTEM: &str = "You extract products from e-commerce \
listing-page HTML. Respond with JSON: {\"products\": [{\"name\": \"...\", \
\"price\": \"...\", \"original_price\": null, \"discount\": null, \
\"image_url\": null, \"url\": null}]}. Copy prices exactly as displayed, \
including currency symbols. Omit nothing you can see; invent nothing you \
cannot.";

/// OpenRouter-backed [`ModelClient`].
pub struct OpenRouterClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    classify_model: String,
    schema_model: String,
    extract_model: String,
}

impl OpenRouterClient {
    /// Build a client from config plus the resolved API key.
    pub fn new(config: &OpenRouterConfig, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            classify_model: config.classify_model.clone(),
            schema_model: config.schema_model.clone(),
            extract_model: config.extract_model.clone(),
        }
    }

    /// One chat-completion round trip; returns the raw message content.
    async fn complete(&self, model: &str, system: &str, user: &str) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "response_format": {"type": "json_object"},
            "temperature": 0.0,
        });

        debug!(model, bytes = user.len(), "sending model request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Http(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ModelError::RateLimited);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ModelError::Http(format!("HTTP {status}: {detail}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(content)
    }
}

#[async_trait::async_trait]
impl ModelClient for OpenRouterClient {
    async fn classify_links(
        &self,
        domain: &str,
        candidates: &[LinkCandidate],
    ) -> Result<Vec<String>, ModelError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let listing = serde_json::to_string_pretty(candidates)
            .map_err(|e| ModelError::Malformed(e.to_string()))?;
        let user = format!("Site: {domain}\n\nCandidate links:\n{listing}");

        let content = self
            .complete(&self.classify_model, CLASSIFY_SYSTEM, &user)
            .await?;
        let reply: ClassifyReply = parse_json_content(&content)?;

        // Keep only URLs the model did not invent.
        let accepted = reply
            .category_urls
            .into_iter()
            .filter(|u| candidates.iter().any(|c| &c.url == u))
            .collect();
        Ok(accepted)
    }

    async fn generate_schema(
        &self,
        domain: &str,
        sample_html: &str,
    ) -> Result<SchemaDefinition, ModelError> {
        let user = format!("Site: {domain}\n\nListing page HTML:\n{sample_html}");
        let content = self
            .complete(&self.schema_model, SCHEMA_SYSTEM, &user)
            .await?;
        parse_json_content(&content)
    }

    async fn extract_products(&self, html: &str) -> Result<Vec<ProductCandidate>, ModelError> {
        let user = format!("Listing page HTML:\n{html}");
        let content = self
            .complete(&self.extract_model, EXTRACT_SYSTEM, &user)
            .await?;
        let reply: ExtractReply = parse_json_content(&content)?;
        Ok(reply.products)
    }
}

// ---------------------------------------------------------------------------
// Wire types and content parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ClassifyReply {
    #[serde(default)]
    category_urls: Vec<String>,
}

#[derive(Deserialize)]
struct ExtractReply {
    #[serde(default)]
    products: Vec<ProductCandidate>,
}

/// Parse message content as JSON, tolerating markdown code fences some
/// models wrap around their output despite the response_format hint.
fn parse_json_content<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, ModelError> {
    let stripped = strip_code_fence(content);
    serde_json::from_str(stripped).map_err(|e| ModelError::Malformed(e.to_string()))
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag on the fence line, then the closing fence.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}
