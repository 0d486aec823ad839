//! End-to-end crawl pipeline: homepage → category discovery → concurrent
//! per-link extraction → persisted products.
//!
//! The orchestrator owns retry policy and crawl-state commits. A link's
//! in-flight state lives only in memory; the database sees either the
//! pending row or the terminal stamp, so an interrupted run re-attempts
//! cleanly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use url::Url;

use shelfscrape_discovery::{CategoryDiscoverer, DiscoverySummary};
use shelfscrape_extract::{ExtractionMethod, PageExtraction, ProductExtractor, SchemaManager};
use shelfscrape_fetch::{RenderError, RenderedPage, Renderer};
use shelfscrape_model::ModelClient;
use shelfscrape_shared::{
    CategoryLink, DomainRecord, LinkPolicy, Result, RunConfig, ShelfscrapeError, url_base_domain,
};
use shelfscrape_storage::Storage;

use crate::report::DomainReport;

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a category link reaches a terminal state.
    fn link_done(&self, url: &str, failed: bool, inserted: usize);
    /// Called when the run completes.
    fn done(&self, report: &DomainReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn link_done(&self, _url: &str, _failed: bool, _inserted: usize) {}
    fn done(&self, _report: &DomainReport) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives discovery and extraction for one domain at a time.
pub struct Orchestrator {
    config: RunConfig,
    renderer: Arc<dyn Renderer>,
    model: Arc<dyn ModelClient>,
    discoverer: CategoryDiscoverer,
    schemas: Arc<SchemaManager>,
    extractor: Arc<ProductExtractor>,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        config: RunConfig,
        renderer: Arc<dyn Renderer>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        let policy = LinkPolicy {
            allowed_hosts: config.allowed_subdomains.clone(),
        };
        let discoverer = CategoryDiscoverer::new(policy.clone(), config.classify_batch);
        let schemas = Arc::new(SchemaManager::new(
            config.schema_refresh_secs,
            config.drift_threshold,
            config.max_model_bytes,
        ));
        let extractor = Arc::new(ProductExtractor::new(policy, config.max_model_bytes));

        Self {
            config,
            renderer,
            model,
            discoverer,
            schemas,
            extractor,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation flag: setting it stops the run at the next
    /// link dispatch; in-flight links finish and commit.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Full pipeline: discover categories from the entry page, then extract
    /// products from every pending link.
    #[instrument(skip_all, fields(entry_url = %entry_url))]
    pub async fn run(
        &self,
        storage: &Arc<Storage>,
        entry_url: &Url,
        progress: &dyn ProgressReporter,
    ) -> Result<(DiscoverySummary, DomainReport)> {
        let (domain, summary) = self.discover_categories(storage, entry_url, progress).await?;
        let report = self.extract_domain(storage, &domain, progress).await?;
        Ok((summary, report))
    }

    /// Render the entry page and persist the category links found on it.
    #[instrument(skip_all, fields(entry_url = %entry_url))]
    pub async fn discover_categories(
        &self,
        storage: &Storage,
        entry_url: &Url,
        progress: &dyn ProgressReporter,
    ) -> Result<(DomainRecord, DiscoverySummary)> {
        let domain_name = url_base_domain(entry_url);
        if domain_name.is_empty() {
            return Err(ShelfscrapeError::validation(format!(
                "entry URL has no host: {entry_url}"
            )));
        }
        let domain = storage.get_or_create_domain(domain_name).await?;

        progress.phase("Rendering entry page");
        let page = render_with_retry(
            self.renderer.as_ref(),
            entry_url,
            self.config.max_retries,
            self.config.retry_backoff_ms,
        )
        .await
        .map_err(|e| ShelfscrapeError::Render(e.to_string()))?;

        progress.phase("Discovering categories");
        let summary = self
            .discoverer
            .discover(storage, self.model.as_ref(), &domain, &page.final_url, &page.html)
            .await?;

        Ok((domain, summary))
    }

    /// Extract products from every pending category link of a domain,
    /// `concurrency` links at a time.
    #[instrument(skip_all, fields(domain = %domain.name))]
    pub async fn extract_domain(
        &self,
        storage: &Arc<Storage>,
        domain: &DomainRecord,
        progress: &dyn ProgressReporter,
    ) -> Result<DomainReport> {
        let start = Instant::now();
        let pending = storage.list_pending_links(&domain.id).await?;

        let mut report = DomainReport {
            domain: domain.name.clone(),
            ..DomainReport::default()
        };

        info!(
            pending = pending.len(),
            concurrency = self.config.concurrency,
            "starting extraction run"
        );
        progress.phase("Extracting products");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));
        let mut handles = Vec::new();
        let mut undispatched = 0usize;

        for link in pending {
            if self.cancel.load(Ordering::Relaxed) {
                undispatched += 1;
                continue;
            }

            let storage = storage.clone();
            let renderer = self.renderer.clone();
            let model = self.model.clone();
            let schemas = self.schemas.clone();
            let extractor = self.extractor.clone();
            let domain = domain.clone();
            let sem = semaphore.clone();
            let max_retries = self.config.max_retries;
            let backoff_ms = self.config.retry_backoff_ms;

            let url = link.url.clone();
            handles.push((
                url,
                tokio::spawn(async move {
                    let _permit = sem.acquire_owned().await.expect("semaphore closed");
                    crawl_link(
                        storage, renderer, model, schemas, extractor, domain, link, max_retries,
                        backoff_ms,
                    )
                    .await
                }),
            ));
        }

        report.links_attempted = handles.len();
        report.cancelled = undispatched;

        for (url, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "link worker panicked");
                    report.links_failed += 1;
                    report.failed_urls.push(url);
                    continue;
                }
            };

            progress.link_done(
                &outcome.url,
                outcome.failed,
                outcome.extraction.as_ref().map_or(0, |e| e.inserted),
            );

            if outcome.failed {
                report.links_failed += 1;
                report.failed_urls.push(outcome.url.clone());
            } else {
                report.links_done += 1;
            }
            if let Some(extraction) = outcome.extraction {
                report.products_found += extraction.found;
                report.products_inserted += extraction.inserted;
                if extraction.method == ExtractionMethod::ModelFallback {
                    report.fallback_pages += 1;
                }
                if extraction.schema_invalidated {
                    report.schema_invalidations += 1;
                }
            }
        }

        report.elapsed = start.elapsed();
        info!(
            done = report.links_done,
            failed = report.links_failed,
            products = report.products_inserted,
            "extraction run complete"
        );
        progress.done(&report);
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Per-link worker
// ---------------------------------------------------------------------------

struct LinkOutcome {
    url: String,
    failed: bool,
    extraction: Option<PageExtraction>,
}

/// Crawl one category link to a terminal state. Always stamps the link as
/// done or failed before returning.
#[allow(clippy::too_many_arguments)]
async fn crawl_link(
    storage: Arc<Storage>,
    renderer: Arc<dyn Renderer>,
    model: Arc<dyn ModelClient>,
    schemas: Arc<SchemaManager>,
    extractor: Arc<ProductExtractor>,
    domain: DomainRecord,
    link: CategoryLink,
    max_retries: u32,
    backoff_ms: u64,
) -> LinkOutcome {
    let result = crawl_link_inner(
        &storage, renderer, model, schemas, extractor, &domain, &link, max_retries, backoff_ms,
    )
    .await;

    let (failed, extraction) = match result {
        Ok(extraction) => (false, Some(extraction)),
        Err(e) => {
            warn!(url = %link.url, error = %e, "category link failed");
            (true, None)
        }
    };

    if let Err(e) = storage.mark_link_crawled(&link.id, failed).await {
        warn!(url = %link.url, error = %e, "failed to stamp crawl state");
    }

    LinkOutcome {
        url: link.url,
        failed,
        extraction,
    }
}

#[allow(clippy::too_many_arguments)]
async fn crawl_link_inner(
    storage: &Arc<Storage>,
    renderer: Arc<dyn Renderer>,
    model: Arc<dyn ModelClient>,
    schemas: Arc<SchemaManager>,
    extractor: Arc<ProductExtractor>,
    domain: &DomainRecord,
    link: &CategoryLink,
    max_retries: u32,
    backoff_ms: u64,
) -> Result<PageExtraction> {
    let url = Url::parse(&link.url)
        .map_err(|e| ShelfscrapeError::parse(format!("bad stored url {}: {e}", link.url)))?;

    let page = render_with_retry(renderer.as_ref(), &url, max_retries, backoff_ms)
        .await
        .map_err(|e| ShelfscrapeError::Render(e.to_string()))?;

    let mut attempt = 0u32;
    loop {
        match extractor
            .extract_page(storage, model.as_ref(), &schemas, domain, link, &page.html)
            .await
        {
            Ok(extraction) => return Ok(extraction),
            Err(e) if is_transient(&e) && attempt < max_retries => {
                attempt += 1;
                warn!(url = %link.url, error = %e, attempt, "extraction failed, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms * u64::from(attempt))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Render with linear backoff on retryable failures.
async fn render_with_retry(
    renderer: &dyn Renderer,
    url: &Url,
    max_retries: u32,
    backoff_ms: u64,
) -> std::result::Result<RenderedPage, RenderError> {
    let mut attempt = 0u32;
    loop {
        match renderer.render(url).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(%url, error = %e, attempt, "render failed, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms * u64::from(attempt))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Collaborator failures worth a retry; validation and parse errors are
/// not, and model failures carry their own classification.
fn is_transient(error: &ShelfscrapeError) -> bool {
    match error {
        ShelfscrapeError::Model { retryable, .. } => *retryable,
        ShelfscrapeError::Network(_) | ShelfscrapeError::Render(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfscrape_fetch::HttpRenderer;
    use shelfscrape_model::{LinkCandidate, ModelError};
    use shelfscrape_shared::{FieldKind, FieldSpec, ProductCandidate, SchemaDefinition};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn run_config() -> RunConfig {
        RunConfig {
            concurrency: 2,
            max_retries: 1,
            retry_backoff_ms: 1,
            max_model_bytes: 120_000,
            schema_refresh_secs: 3600,
            drift_threshold: 3,
            allowed_subdomains: Vec::new(),
            classify_batch: 40,
        }
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
                    selector: "a".into(),
                    kind: FieldKind::Attribute {
                        attribute: "href".into(),
                    },
                },
            ],
        }
    }

    /// Accepts links whose path starts with /cat/, returns the tile schema.
    struct ScriptedModel;

    #[async_trait::async_trait]
    impl ModelClient for ScriptedModel {
        async fn classify_links(
            &self,
            _domain: &str,
            candidates: &[LinkCandidate],
        ) -> std::result::Result<Vec<String>, ModelError> {
            Ok(candidates
                .iter()
                .filter(|c| c.url.contains("/cat/"))
                .map(|c| c.url.clone())
                .collect())
        }

        async fn generate_schema(
            &self,
            _domain: &str,
            _sample_html: &str,
        ) -> std::result::Result<SchemaDefinition, ModelError> {
            Ok(tile_schema())
        }

        async fn extract_products(
            &self,
            _html: &str,
        ) -> std::result::Result<Vec<ProductCandidate>, ModelError> {
            Ok(Vec::new())
        }
    }

    const HOMEPAGE: &str = r#"<html><body><nav>
        <a href="/cat/shoes">Shoes</a>
        <a href="/help/contact">Contact</a>
        <a href="/cart">Cart</a>
        </nav></body></html>"#;

    const LISTING: &str = r#"<html><body><ul>
        <li class="product"><a href="/p/runner"><span class="title">Runner</span><span class="price">$49.99</span></a></li>
        <li class="product"><a href="/p/loafer"><span class="title">Loafer</span><span class="price">$39.99</span></a></li>
        <li class="product"><a href="/p/boot"><span class="title">Boot</span><span class="price">$89.99</span></a></li>
        <li class="product"><a href="/p/sandal"><span class="title">Sandal</span><span class="price">$29.99</span></a></li>
        <li class="product"><a href="/p/oxford"><span class="title">Oxford</span><span class="price">$59.99</span></a></li>
        </ul></body></html>"#;

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("ss_core_{}.db", uuid::Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    fn orchestrator() -> Orchestrator {
        let renderer = HttpRenderer::new().unwrap().allow_localhost();
        Orchestrator::new(run_config(), Arc::new(renderer), Arc::new(ScriptedModel))
    }

    async fn mount_site(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HOMEPAGE))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cat/shoes"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn full_run_discovers_and_extracts() {
        let server = MockServer::start().await;
        mount_site(&server).await;

        let storage = test_storage().await;
        let orch = orchestrator();
        let entry = Url::parse(&format!("{}/", server.uri())).unwrap();

        let (summary, report) = orch.run(&storage, &entry, &SilentProgress).await.unwrap();

        assert_eq!(summary.inserted, 1);
        assert_eq!(report.links_attempted, 1);
        assert_eq!(report.links_done, 1);
        assert_eq!(report.links_failed, 0);
        assert_eq!(report.products_inserted, 5);
        assert_eq!(report.fallback_pages, 0);

        let domain = storage.get_domain("127.0.0.1").await.unwrap().unwrap();
        let products = storage.list_products(&domain.id, 100).await.unwrap();
        assert_eq!(products.len(), 5);
        assert!(products.iter().any(|p| p.name == "Runner" && p.price == "$49.99"));
    }

    #[tokio::test]
    async fn second_run_has_nothing_pending() {
        let server = MockServer::start().await;
        mount_site(&server).await;

        let storage = test_storage().await;
        let orch = orchestrator();
        let entry = Url::parse(&format!("{}/", server.uri())).unwrap();

        orch.run(&storage, &entry, &SilentProgress).await.unwrap();
        let (summary, report) = orch.run(&storage, &entry, &SilentProgress).await.unwrap();

        // Links and products are already known; nothing new happens.
        assert_eq!(summary.inserted, 0);
        assert_eq!(report.links_attempted, 0);
        assert_eq!(report.products_inserted, 0);
    }

    #[tokio::test]
    async fn dead_category_page_marks_link_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HOMEPAGE))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cat/shoes"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let orch = orchestrator();
        let entry = Url::parse(&format!("{}/", server.uri())).unwrap();

        let (_, report) = orch.run(&storage, &entry, &SilentProgress).await.unwrap();
        assert_eq!(report.links_failed, 1);
        assert_eq!(report.links_done, 0);
        // The report names the failed link for operator follow-up.
        assert_eq!(report.failed_urls.len(), 1);
        assert!(report.failed_urls[0].ends_with("/cat/shoes"));

        // Failed links can be reset back to pending.
        let domain = storage.get_domain("127.0.0.1").await.unwrap().unwrap();
        let links = storage.list_links(&domain.id).await.unwrap();
        assert!(links[0].failed);
        assert_eq!(storage.reset_failed_links(&domain.id).await.unwrap(), 1);
    }

    #[test]
    fn transient_classification_follows_model_retryability() {
        assert!(is_transient(&ShelfscrapeError::model("rate limited", true)));
        assert!(!is_transient(&ShelfscrapeError::model("malformed reply", false)));
        assert!(is_transient(&ShelfscrapeError::Render("timeout".into())));
        assert!(!is_transient(&ShelfscrapeError::validation("bad record")));
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch() {
        let server = MockServer::start().await;
        mount_site(&server).await;

        let storage = test_storage().await;
        let orch = orchestrator();
        let entry = Url::parse(&format!("{}/", server.uri())).unwrap();

        let (domain, _) = orch
            .discover_categories(&storage, &entry, &SilentProgress)
            .await
            .unwrap();

        orch.cancel_flag().store(true, Ordering::Relaxed);
        let report = orch
            .extract_domain(&storage, &domain, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(report.links_attempted, 0);
        assert_eq!(report.cancelled, 1);
        // The link is still pending for the next run.
        assert_eq!(storage.list_pending_links(&domain.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_entry_page_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let orch = orchestrator();
        let entry = Url::parse(&format!("{}/", server.uri())).unwrap();

        let result = orch.run(&storage, &entry, &SilentProgress).await;
        assert!(result.is_err());
    }
}
