//! Core domain types for the Shelfscrape crawl pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Id
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for entity identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub Uuid);

impl Id {
    /// Generate a new time-sortable identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Id {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

/// A distinct site being scraped, keyed by registrable domain name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Unique identifier.
    pub id: String,
    /// Registrable domain name (e.g. `example.com`), unique.
    pub name: String,
    /// When the domain was first sighted.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CategoryLink
// ---------------------------------------------------------------------------

/// A discovered category-page URL and its crawl state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryLink {
    /// Unique identifier.
    pub id: String,
    /// Owning domain.
    pub domain_id: String,
    /// Absolute category-page URL, unique per domain.
    pub url: String,
    /// Cleaned source anchor HTML the link was discovered from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_html: Option<String>,
    /// Discovery timestamp.
    pub found_at: DateTime<Utc>,
    /// Null until the first extraction attempt completes (success or
    /// exhausted retries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_crawled_at: Option<DateTime<Utc>>,
    /// Set when the link exhausted retries on collaborator errors.
    #[serde(default)]
    pub failed: bool,
}

/// Crawl state of a [`CategoryLink`].
///
/// `Crawling` exists only in memory while a worker holds the link; it is
/// never persisted, so a crash mid-fetch leaves the link `Discovered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Discovered,
    Crawling,
    Done,
    Failed,
}

impl CategoryLink {
    /// Persisted state derived from the crawl-state columns.
    pub fn state(&self) -> LinkState {
        match (self.last_crawled_at.is_some(), self.failed) {
            (false, _) => LinkState::Discovered,
            (true, false) => LinkState::Done,
            (true, true) => LinkState::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Extraction schema
// ---------------------------------------------------------------------------

/// How a field value is pulled from a matched element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Concatenated text content of the first match.
    Text,
    /// A named attribute of the first match (e.g. `href`, `src`).
    Attribute { attribute: String },
    /// A nested group of fields scoped to the first match.
    Nested { fields: Vec<FieldSpec> },
}

/// A single named field in an extraction schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name (e.g. `name`, `price`, `image_url`).
    pub name: String,
    /// CSS selector relative to the base container.
    pub selector: String,
    /// Extraction kind.
    #[serde(flatten)]
    pub kind: FieldKind,
}

/// A structural extraction recipe for one domain: a repeating base
/// container selector plus named field selectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Selector matching each repeated product container.
    pub base_selector: String,
    /// Field selectors evaluated inside each container.
    pub fields: Vec<FieldSpec>,
}

impl SchemaDefinition {
    /// Structural validity: a non-empty base selector and at least one field.
    pub fn is_valid(&self) -> bool {
        !self.base_selector.trim().is_empty()
            && !self.fields.is_empty()
            && self.fields.iter().all(field_valid)
    }
}

fn field_valid(f: &FieldSpec) -> bool {
    if f.name.trim().is_empty() || f.selector.trim().is_empty() {
        return false;
    }
    match &f.kind {
        FieldKind::Text => true,
        FieldKind::Attribute { attribute } => !attribute.trim().is_empty(),
        FieldKind::Nested { fields } => !fields.is_empty() && fields.iter().all(field_valid),
    }
}

/// A cached schema row: definition plus cache metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSchemaRecord {
    /// Unique identifier.
    pub id: String,
    /// Owning domain.
    pub domain_id: String,
    /// The recipe itself.
    pub definition: SchemaDefinition,
    /// Generation timestamp (drives the refresh-interval cache).
    pub generated_at: DateTime<Utc>,
    /// Whether this is the domain's current schema. Superseded rows are
    /// retained for audit with `current = false`.
    pub current: bool,
}

// ---------------------------------------------------------------------------
// Product
// ---------------------------------------------------------------------------

/// A raw product record as produced by either extraction strategy, before
/// validation. Price fields are opaque site-formatted strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductCandidate {
    #[serde(default, alias = "title")]
    pub name: String,
    #[serde(default)]
    pub price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A validated, persisted product record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    /// Unique identifier.
    pub id: String,
    /// Owning domain (denormalized for query convenience).
    pub domain_id: String,
    /// Owning category link.
    pub category_link_id: String,
    /// Product name.
    pub name: String,
    /// Displayed price, site-formatted.
    pub price: String,
    /// Pre-discount price, if shown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<String>,
    /// Discount label, if shown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<String>,
    /// Absolute product image URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Absolute product page URL.
    pub url: String,
    /// Extraction timestamp.
    pub found_at: DateTime<Utc>,
}
