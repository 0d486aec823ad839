//! Product extraction: apply a domain's cached CSS schema to listing-page
//! HTML, falling back to direct model extraction when the schema yields
//! nothing or cannot be produced at all.
//!
//! Candidates from either path go through the same validation, in-page
//! dedup, and idempotent persistence. Prices are stored exactly as the
//! site displays them.

mod schema;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument, warn};
use url::Url;

use shelfscrape_model::ModelClient;
use shelfscrape_reduce::{ReduceMode, reduce};
use shelfscrape_shared::{
    CategoryLink, DomainRecord, FieldKind, FieldSpec, Id, LinkPolicy, Product, ProductCandidate,
    Result, SchemaDefinition, ShelfscrapeError,
};
use shelfscrape_storage::Storage;

pub use schema::SchemaManager;

/// Which extraction path produced a page's products.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    /// The cached CSS schema matched.
    Schema,
    /// The schema yielded nothing; the model extracted directly.
    ModelFallback,
}

/// Outcome of extracting one category page.
#[derive(Debug, Clone)]
pub struct PageExtraction {
    /// Valid candidates found (after validation and in-page dedup).
    pub found: usize,
    /// Rows newly inserted (found minus already-known).
    pub inserted: usize,
    /// Which path produced the candidates.
    pub method: ExtractionMethod,
    /// Whether this page's zero yield tipped the schema into invalidation.
    pub schema_invalidated: bool,
}

// ---------------------------------------------------------------------------
// ProductExtractor
// ---------------------------------------------------------------------------

/// Extracts and persists products from rendered category pages.
pub struct ProductExtractor {
    policy: LinkPolicy,
    max_model_bytes: usize,
}

impl ProductExtractor {
    pub fn new(policy: LinkPolicy, max_model_bytes: usize) -> Self {
        Self {
            policy,
            max_model_bytes,
        }
    }

    /// Extract products from one rendered category page and persist them.
    #[instrument(skip_all, fields(url = %link.url))]
    pub async fn extract_page(
        &self,
        storage: &Storage,
        model: &dyn ModelClient,
        schemas: &SchemaManager,
        domain: &DomainRecord,
        link: &CategoryLink,
        page_html: &str,
    ) -> Result<PageExtraction> {
        let base_url = Url::parse(&link.url)
            .map_err(|e| ShelfscrapeError::parse(format!("bad link url {}: {e}", link.url)))?;

        // A page is never lost to a broken schema: generation failures and
        // invalid definitions degrade to the model-direct path.
        let definition = match schemas.get_or_create(storage, model, domain, page_html).await {
            Ok(definition) => Some(definition),
            Err(e @ (ShelfscrapeError::Model { .. } | ShelfscrapeError::Validation { .. })) => {
                warn!(error = %e, "schema unavailable, extracting via model directly");
                None
            }
            Err(e) => return Err(e),
        };

        let (mut candidates, schema_invalidated) = match &definition {
            Some(definition) => {
                let candidates = apply_schema(definition, page_html);
                let invalidated = schemas
                    .record_page_yield(storage, &domain.id, candidates.len())
                    .await?;
                (candidates, invalidated)
            }
            None => (Vec::new(), false),
        };
        let mut method = ExtractionMethod::Schema;

        if candidates.is_empty() {
            debug!("no schema yield, falling back to model extraction");
            let reduced = reduce(page_html, ReduceMode::Extraction);
            let sample = clamp_bytes(&reduced, self.max_model_bytes);
            candidates = match model.extract_products(sample).await {
                Ok(candidates) => candidates,
                // Transient failures surface so the orchestrator can retry
                // the page; unusable output means zero products, not a
                // failed link.
                Err(e) if e.is_retryable() => {
                    return Err(ShelfscrapeError::model(e.to_string(), true));
                }
                Err(e) => {
                    warn!(error = %e, "fallback extraction unusable, treating page as empty");
                    Vec::new()
                }
            };
            method = ExtractionMethod::ModelFallback;
        }

        let mut seen = HashSet::new();
        let mut found = 0usize;
        let mut inserted = 0usize;

        for candidate in candidates {
            let Some((name, url, image_url)) = self.validate(&candidate, &base_url) else {
                continue;
            };
            if !seen.insert((name.clone(), url.clone())) {
                continue;
            }
            found += 1;

            let product = Product {
                id: Id::new().to_string(),
                domain_id: domain.id.clone(),
                category_link_id: link.id.clone(),
                name,
                price: candidate.price.trim().to_string(),
                original_price: trimmed_opt(&candidate.original_price),
                discount: trimmed_opt(&candidate.discount),
                image_url,
                url,
                found_at: Utc::now(),
            };
            if storage.insert_product(&product).await? {
                inserted += 1;
            }
        }

        Ok(PageExtraction {
            found,
            inserted,
            method,
            schema_invalidated,
        })
    }

    /// A candidate survives with a non-empty name and a same-site product
    /// URL. Returns the cleaned `(name, url, image_url)`.
    fn validate(&self, candidate: &ProductCandidate, base_url: &Url) -> Option<(String, String, Option<String>)> {
        let name = candidate.name.trim();
        if name.is_empty() {
            return None;
        }

        let raw_url = candidate.url.as_deref()?;
        let url = match self.policy.normalize(base_url, raw_url) {
            Ok(url) => url,
            Err(reason) => {
                debug!(raw_url, %reason, "rejected product url");
                return None;
            }
        };

        // A bad image URL costs the image, not the product.
        let image_url = candidate
            .image_url
            .as_deref()
            .and_then(|raw| base_url.join(raw.trim()).ok())
            .map(|u| u.to_string());

        Some((name.to_string(), url.to_string(), image_url))
    }
}

fn trimmed_opt(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Schema application
// ---------------------------------------------------------------------------

/// Apply an extraction schema to page HTML. Pure; selector parse failures
/// cost the field (or the whole page for the base selector), never panic.
pub fn apply_schema(definition: &SchemaDefinition, html: &str) -> Vec<ProductCandidate> {
    let Ok(base_selector) = Selector::parse(&definition.base_selector) else {
        warn!(selector = %definition.base_selector, "unparseable base selector");
        return Vec::new();
    };

    let doc = Html::parse_document(html);
    let mut candidates = Vec::new();

    for container in doc.select(&base_selector) {
        let mut values = HashMap::new();
        collect_fields(container, &definition.fields, "", &mut values);
        if !values.is_empty() {
            candidates.push(candidate_from_values(&values));
        }
    }
    candidates
}

/// Evaluate fields inside one container, flattening nested groups into
/// dotted keys (`seller.name`).
fn collect_fields(
    scope: ElementRef<'_>,
    fields: &[FieldSpec],
    prefix: &str,
    out: &mut HashMap<String, String>,
) {
    for field in fields {
        let Ok(selector) = Selector::parse(&field.selector) else {
            warn!(selector = %field.selector, "unparseable field selector, skipping");
            continue;
        };
        let Some(element) = scope.select(&selector).next() else {
            continue;
        };

        let key = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{prefix}.{}", field.name)
        };

        match &field.kind {
            FieldKind::Text => {
                let text = element.text().collect::<Vec<_>>().join(" ");
                let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !text.is_empty() {
                    out.insert(key, text);
                }
            }
            FieldKind::Attribute { attribute } => {
                if let Some(value) = element.value().attr(attribute) {
                    let value = value.trim();
                    if !value.is_empty() {
                        out.insert(key, value.to_string());
                    }
                }
            }
            FieldKind::Nested { fields } => {
                collect_fields(element, fields, &key, out);
            }
        }
    }
}

/// Map flattened field values onto a candidate by the final key segment.
fn candidate_from_values(values: &HashMap<String, String>) -> ProductCandidate {
    let mut candidate = ProductCandidate::default();
    for (key, value) in values {
        let leaf = key.rsplit('.').next().unwrap_or(key);
        match leaf {
            "name" | "title" => candidate.name = value.clone(),
            "price" => candidate.price = value.clone(),
            "original_price" => candidate.original_price = Some(value.clone()),
            "discount" => candidate.discount = Some(value.clone()),
            "image_url" | "image" => candidate.image_url = Some(value.clone()),
            "url" | "link" | "href" => candidate.url = Some(value.clone()),
            _ => {}
        }
    }
    candidate
}

/// Clamp a string to at most `max` bytes without splitting a character.
pub(crate) fn clamp_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfscrape_model::ModelError;
    use std::sync::{Arc, Mutex};

    fn listing_page(n: usize) -> String {
        let tiles: String = (0..n)
            .map(|i| {
                format!(
                    r#"<li class="product">
                       <a class="tile-link" href="/p/item-{i}">
                         <img src="/img/item-{i}.jpg">
                         <span class="title">Item {i}</span>
                         <span class="price">$1{i}.99</span>
                       </a>
                     </li>"#
                )
            })
            .collect();
        format!("<html><body><ul class=\"grid\">{tiles}</ul></body></html>")
    }

    fn tile_schema() -> SchemaDefinition {
        SchemaDefinition {
            base_selector: "li.product".into(),
            fields: vec![
                FieldSpec {
                    name: "name".into(),
                    selector: "span.title".into(),
                    kind: FieldKind::Text,
                },
                FieldSpec {
                    name: "price".into(),
                    selector: "span.price".into(),
                    kind: FieldKind::Text,
                },
                FieldSpec {
                    name: "url".into(),
                    selector: "a.tile-link".into(),
                    kind: FieldKind::Attribute {
                        attribute: "href".into(),
                    },
                },
                FieldSpec {
                    name: "image_url".into(),
                    selector: "img".into(),
                    kind: FieldKind::Attribute {
                        attribute: "src".into(),
                    },
                },
            ],
        }
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        assert_eq!(clamp_bytes("hello", 10), "hello");
        assert_eq!(clamp_bytes("hello", 3), "hel");
        // '€' is 3 bytes; clamping mid-char backs off to the boundary
        assert_eq!(clamp_bytes("a€b", 2), "a");
        assert_eq!(clamp_bytes("a€b", 4), "a€");
    }

    #[test]
    fn apply_schema_extracts_each_container() {
        let candidates = apply_schema(&tile_schema(), &listing_page(5));
        assert_eq!(candidates.len(), 5);
        assert_eq!(candidates[0].name, "Item 0");
        assert_eq!(candidates[0].price, "$10.99");
        assert_eq!(candidates[0].url.as_deref(), Some("/p/item-0"));
        assert_eq!(candidates[0].image_url.as_deref(), Some("/img/item-0.jpg"));
    }

    #[test]
    fn apply_schema_with_nested_fields() {
        let html = r#"<div class="card">
            <div class="info"><span class="n">Lamp</span><a href="/p/lamp">go</a></div>
            <b class="p">$5.00</b>
        </div>"#;
        let definition = SchemaDefinition {
            base_selector: "div.card".into(),
            fields: vec![
                FieldSpec {
                    name: "info".into(),
                    selector: "div.info".into(),
                    kind: FieldKind::Nested {
                        fields: vec![
                            FieldSpec {
                                name: "name".into(),
                                selector: "span.n".into(),
                                kind: FieldKind::Text,
                            },
                            FieldSpec {
                                name: "url".into(),
                                selector: "a".into(),
                                kind: FieldKind::Attribute {
                                    attribute: "href".into(),
                                },
                            },
                        ],
                    },
                },
                FieldSpec {
                    name: "price".into(),
                    selector: "b.p".into(),
                    kind: FieldKind::Text,
                },
            ],
        };

        let candidates = apply_schema(&definition, html);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "Lamp");
        assert_eq!(candidates[0].url.as_deref(), Some("/p/lamp"));
        assert_eq!(candidates[0].price, "$5.00");
    }

    #[test]
    fn bad_base_selector_yields_nothing() {
        let definition = SchemaDefinition {
            base_selector: "li..".into(),
            fields: tile_schema().fields,
        };
        assert!(apply_schema(&definition, &listing_page(3)).is_empty());
    }

    #[test]
    fn validation_requires_name_and_same_site_url() {
        let extractor = ProductExtractor::new(LinkPolicy::default(), 1000);
        let base = Url::parse("https://shop.test/cat/shoes").unwrap();

        let ok = ProductCandidate {
            name: " Runner ".into(),
            price: "$9.99".into(),
            url: Some("/p/runner".into()),
            ..Default::default()
        };
        let (name, url, _) = extractor.validate(&ok, &base).unwrap();
        assert_eq!(name, "Runner");
        assert_eq!(url, "https://shop.test/p/runner");

        let unnamed = ProductCandidate {
            name: "  ".into(),
            url: Some("/p/x".into()),
            ..Default::default()
        };
        assert!(extractor.validate(&unnamed, &base).is_none());

        let no_url = ProductCandidate {
            name: "Lamp".into(),
            ..Default::default()
        };
        assert!(extractor.validate(&no_url, &base).is_none());

        let cross_site = ProductCandidate {
            name: "Lamp".into(),
            url: Some("https://cdn.other.test/p/lamp".into()),
            ..Default::default()
        };
        assert!(extractor.validate(&cross_site, &base).is_none());
    }

    // -----------------------------------------------------------------------
    // Pipeline tests with scripted model + temp storage
    // -----------------------------------------------------------------------

    struct ScriptedModel {
        schema: SchemaDefinition,
        schema_error: Option<fn() -> ModelError>,
        fallback: Vec<ProductCandidate>,
        fallback_error: Option<fn() -> ModelError>,
        schema_calls: Mutex<usize>,
        extract_calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(schema: SchemaDefinition) -> Self {
            Self {
                schema,
                schema_error: None,
                fallback: Vec::new(),
                fallback_error: None,
                schema_calls: Mutex::new(0),
                extract_calls: Mutex::new(0),
            }
        }

        fn with_fallback(mut self, fallback: Vec<ProductCandidate>) -> Self {
            self.fallback = fallback;
            self
        }

        fn with_schema_error(mut self, make: fn() -> ModelError) -> Self {
            self.schema_error = Some(make);
            self
        }

        fn with_fallback_error(mut self, make: fn() -> ModelError) -> Self {
            self.fallback_error = Some(make);
            self
        }
    }

    #[async_trait::async_trait]
    impl ModelClient for ScriptedModel {
        async fn classify_links(
            &self,
            _domain: &str,
            _candidates: &[shelfscrape_model::LinkCandidate],
        ) -> std::result::Result<Vec<String>, ModelError> {
            unimplemented!("not used in extraction tests")
        }

        async fn generate_schema(
            &self,
            _domain: &str,
            _sample_html: &str,
        ) -> std::result::Result<SchemaDefinition, ModelError> {
            *self.schema_calls.lock().unwrap() += 1;
            // Generation is slow enough for concurrent callers to overlap.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Some(make) = self.schema_error {
                return Err(make());
            }
            Ok(self.schema.clone())
        }

        async fn extract_products(
            &self,
            _html: &str,
        ) -> std::result::Result<Vec<ProductCandidate>, ModelError> {
            *self.extract_calls.lock().unwrap() += 1;
            if let Some(make) = self.fallback_error {
                return Err(make());
            }
            Ok(self.fallback.clone())
        }
    }

    async fn test_fixture() -> (Storage, DomainRecord, CategoryLink) {
        let tmp = std::env::temp_dir().join(format!("ss_ext_{}.db", uuid::Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open test db");
        let domain = storage.get_or_create_domain("shop.test").await.unwrap();
        let link = CategoryLink {
            id: Id::new().to_string(),
            domain_id: domain.id.clone(),
            url: "https://shop.test/cat/shoes".into(),
            anchor_html: None,
            found_at: Utc::now(),
            last_crawled_at: None,
            failed: false,
        };
        storage.insert_category_link(&link).await.unwrap();
        (storage, domain, link)
    }

    #[tokio::test]
    async fn schema_path_extracts_and_persists() {
        let (storage, domain, link) = test_fixture().await;
        let model = ScriptedModel::new(tile_schema());
        let schemas = SchemaManager::new(3600, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        let outcome = extractor
            .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(5))
            .await
            .unwrap();

        assert_eq!(outcome.method, ExtractionMethod::Schema);
        assert_eq!(outcome.found, 5);
        assert_eq!(outcome.inserted, 5);
        assert!(!outcome.schema_invalidated);

        let products = storage.list_products(&domain.id, 100).await.unwrap();
        assert_eq!(products.len(), 5);
        assert!(products.iter().all(|p| p.url.starts_with("https://shop.test/p/")));
    }

    #[tokio::test]
    async fn schema_is_generated_once_across_pages() {
        let (storage, domain, link) = test_fixture().await;
        let model = ScriptedModel::new(tile_schema());
        let schemas = SchemaManager::new(3600, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        for _ in 0..3 {
            extractor
                .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(2))
                .await
                .unwrap();
        }
        assert_eq!(*model.schema_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_schema_is_regenerated() {
        let (storage, domain, link) = test_fixture().await;
        let model = ScriptedModel::new(tile_schema());
        // refresh_secs = 0: every page sees the cached schema as stale
        let schemas = SchemaManager::new(0, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        for _ in 0..2 {
            extractor
                .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(2))
                .await
                .unwrap();
        }
        assert_eq!(*model.schema_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn zero_yield_falls_back_to_model() {
        let (storage, domain, link) = test_fixture().await;
        // Schema that matches nothing on this page.
        let schema = SchemaDefinition {
            base_selector: "li.stale-tile".into(),
            fields: tile_schema().fields,
        };
        let model = ScriptedModel::new(schema).with_fallback(vec![ProductCandidate {
            name: "Fallback Lamp".into(),
            price: "$7.00".into(),
            url: Some("/p/lamp".into()),
            ..Default::default()
        }]);
        let schemas = SchemaManager::new(3600, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        let outcome = extractor
            .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(4))
            .await
            .unwrap();

        assert_eq!(outcome.method, ExtractionMethod::ModelFallback);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(*model.extract_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_generated_schema_falls_back() {
        let (storage, domain, link) = test_fixture().await;
        // Structurally invalid: no base selector survives validation.
        let invalid = SchemaDefinition {
            base_selector: " ".into(),
            fields: Vec::new(),
        };
        let model = ScriptedModel::new(invalid).with_fallback(vec![ProductCandidate {
            name: "Fallback Lamp".into(),
            price: "$7.00".into(),
            url: Some("/p/lamp".into()),
            ..Default::default()
        }]);
        let schemas = SchemaManager::new(3600, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        let outcome = extractor
            .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(4))
            .await
            .unwrap();

        assert_eq!(outcome.method, ExtractionMethod::ModelFallback);
        assert_eq!(outcome.inserted, 1);
        assert!(storage.current_schema(&domain.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn schema_generation_failure_falls_back() {
        let (storage, domain, link) = test_fixture().await;
        let model = ScriptedModel::new(tile_schema())
            .with_schema_error(|| ModelError::Malformed("not a schema".into()))
            .with_fallback(vec![ProductCandidate {
                name: "Fallback Lamp".into(),
                price: "$7.00".into(),
                url: Some("/p/lamp".into()),
                ..Default::default()
            }]);
        let schemas = SchemaManager::new(3600, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        let outcome = extractor
            .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(4))
            .await
            .unwrap();

        assert_eq!(outcome.method, ExtractionMethod::ModelFallback);
        assert_eq!(outcome.found, 1);
    }

    #[tokio::test]
    async fn malformed_fallback_yields_zero_products() {
        let (storage, domain, link) = test_fixture().await;
        let schema = SchemaDefinition {
            base_selector: "li.stale-tile".into(),
            fields: tile_schema().fields,
        };
        let model = ScriptedModel::new(schema)
            .with_fallback_error(|| ModelError::Malformed("not json".into()));
        let schemas = SchemaManager::new(3600, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        let outcome = extractor
            .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(4))
            .await
            .unwrap();

        assert_eq!(outcome.method, ExtractionMethod::ModelFallback);
        assert_eq!(outcome.found, 0);
        assert_eq!(outcome.inserted, 0);
    }

    #[tokio::test]
    async fn rate_limited_fallback_surfaces_for_retry() {
        let (storage, domain, link) = test_fixture().await;
        let schema = SchemaDefinition {
            base_selector: "li.stale-tile".into(),
            fields: tile_schema().fields,
        };
        let model = ScriptedModel::new(schema).with_fallback_error(|| ModelError::RateLimited);
        let schemas = SchemaManager::new(3600, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        let err = extractor
            .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(4))
            .await
            .unwrap_err();

        assert!(matches!(err, ShelfscrapeError::Model { retryable: true, .. }));
    }

    #[tokio::test]
    async fn concurrent_cache_miss_generates_once() {
        let (storage, domain, _link) = test_fixture().await;
        let storage = Arc::new(storage);
        let model = Arc::new(ScriptedModel::new(tile_schema()));
        let schemas = Arc::new(SchemaManager::new(3600, 3, 120_000));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let storage = storage.clone();
            let model = model.clone();
            let schemas = schemas.clone();
            let domain = domain.clone();
            handles.push(tokio::spawn(async move {
                schemas
                    .get_or_create(&storage, model.as_ref(), &domain, &listing_page(2))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), tile_schema());
        }

        // One generation, one persisted current row.
        assert_eq!(*model.schema_calls.lock().unwrap(), 1);
        assert!(storage.current_schema(&domain.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn drift_invalidates_then_regenerates() {
        let (storage, domain, link) = test_fixture().await;
        let schema = SchemaDefinition {
            base_selector: "li.stale-tile".into(),
            fields: tile_schema().fields,
        };
        let model = ScriptedModel::new(schema);
        let schemas = SchemaManager::new(3600, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        let mut invalidated_on = None;
        for page in 1..=3 {
            let outcome = extractor
                .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(4))
                .await
                .unwrap();
            if outcome.schema_invalidated {
                invalidated_on = Some(page);
            }
        }
        // Third consecutive zero-yield page tips the threshold.
        assert_eq!(invalidated_on, Some(3));
        assert!(storage.current_schema(&domain.id).await.unwrap().is_none());

        // Next page regenerates.
        extractor
            .extract_page(&storage, &model, &schemas, &domain, &link, &listing_page(4))
            .await
            .unwrap();
        assert_eq!(*model.schema_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn in_page_duplicates_collapse() {
        let (storage, domain, link) = test_fixture().await;
        // Two identical tiles on the page.
        let page = format!(
            "<html><body><ul>{}{}</ul></body></html>",
            r#"<li class="product"><a class="tile-link" href="/p/same"><span class="title">Same</span><span class="price">$1.00</span></a></li>"#,
            r#"<li class="product"><a class="tile-link" href="/p/same"><span class="title">Same</span><span class="price">$1.00</span></a></li>"#,
        );
        let model = ScriptedModel::new(tile_schema());
        let schemas = SchemaManager::new(3600, 3, 120_000);
        let extractor = ProductExtractor::new(LinkPolicy::default(), 120_000);

        let outcome = extractor
            .extract_page(&storage, &model, &schemas, &domain, &link, &page)
            .await
            .unwrap();
        assert_eq!(outcome.found, 1);
        assert_eq!(outcome.inserted, 1);
    }
}
