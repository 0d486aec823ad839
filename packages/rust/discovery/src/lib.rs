//! Category discovery: turn a storefront homepage into a persisted set of
//! category-page links.
//!
//! Three stages, cheap to expensive:
//! 1. CSS harvest of every `<a href>` with a cleaned anchor snippet.
//! 2. Normalization and heuristic filtering (same-site, non-utility paths).
//! 3. Batched model classification of the survivors.
//!
//! Accepted links are persisted idempotently; re-discovering a domain never
//! duplicates rows.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument, warn};
use url::Url;

use shelfscrape_model::{LinkCandidate, ModelClient, ModelError};
use shelfscrape_reduce::{ReduceMode, reduce};
use shelfscrape_shared::{CategoryLink, DomainRecord, Id, LinkPolicy, Result};
use shelfscrape_storage::Storage;

/// URL paths that are never product category pages: account management,
/// customer service, informational pages, store locators, cart/checkout.
static NON_CATEGORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        /(?:account|login|register|signin|sign-up|my-?account|orders?|wishlist) |
        /(?:help|faq|contact|support|customer-?service|returns?|shipping|polic(?:y|ies)|terms|privacy|track|accessibility) |
        /(?:about|career|press|blog|news|company|investor|affiliate) |
        /(?:store-?locator|find-a-store|stores) |
        /(?:gift-?card|registry) |
        /(?:cart|checkout|bag)
        ",
    )
    .expect("valid regex")
});

// ---------------------------------------------------------------------------
// DiscoverySummary
// ---------------------------------------------------------------------------

/// Counts from one discovery pass over a homepage.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySummary {
    /// Anchors harvested from the page.
    pub anchors_seen: usize,
    /// Survivors of normalization + heuristic filtering, after dedup.
    pub candidates: usize,
    /// URLs the model accepted as category pages.
    pub accepted: usize,
    /// Rows newly inserted (accepted minus already-known).
    pub inserted: usize,
    /// Classification batches skipped on model failure.
    pub failed_batches: usize,
}

// ---------------------------------------------------------------------------
// CategoryDiscoverer
// ---------------------------------------------------------------------------

/// Discovers and persists category links for one domain at a time.
pub struct CategoryDiscoverer {
    policy: LinkPolicy,
    classify_batch: usize,
}

impl CategoryDiscoverer {
    pub fn new(policy: LinkPolicy, classify_batch: usize) -> Self {
        Self {
            policy,
            classify_batch: classify_batch.max(1),
        }
    }

    /// Run discovery over a rendered homepage and persist accepted links.
    #[instrument(skip_all, fields(domain = %domain.name))]
    pub async fn discover(
        &self,
        storage: &Storage,
        model: &dyn ModelClient,
        domain: &DomainRecord,
        base_url: &Url,
        homepage_html: &str,
    ) -> Result<DiscoverySummary> {
        let mut summary = DiscoverySummary::default();

        let cleaned = reduce(homepage_html, ReduceMode::CategoryDiscovery);
        let candidates = self.harvest_candidates(&cleaned, base_url, &mut summary);
        summary.candidates = candidates.len();

        info!(
            anchors = summary.anchors_seen,
            candidates = summary.candidates,
            "harvested candidate links"
        );

        if candidates.is_empty() {
            return Ok(summary);
        }

        for batch in candidates.chunks(self.classify_batch) {
            let accepted = match classify_with_retry(model, &domain.name, batch).await {
                Ok(urls) => urls,
                Err(e) => {
                    // A lost batch costs coverage, not correctness; the rest
                    // of the page still gets classified.
                    warn!(error = %e, batch_len = batch.len(), "classification batch failed");
                    summary.failed_batches += 1;
                    continue;
                }
            };

            summary.accepted += accepted.len();
            for url in accepted {
                let anchor_html = batch
                    .iter()
                    .find(|c| c.url == url)
                    .and_then(|c| c.anchor_html.clone());
                let link = CategoryLink {
                    id: Id::new().to_string(),
                    domain_id: domain.id.clone(),
                    url,
                    anchor_html,
                    found_at: Utc::now(),
                    last_crawled_at: None,
                    failed: false,
                };
                if storage.insert_category_link(&link).await? {
                    summary.inserted += 1;
                }
            }
        }

        info!(
            accepted = summary.accepted,
            inserted = summary.inserted,
            failed_batches = summary.failed_batches,
            "discovery complete"
        );
        Ok(summary)
    }

    /// Stages 1 and 2: harvest anchors, normalize, filter, dedup.
    fn harvest_candidates(
        &self,
        html: &str,
        base_url: &Url,
        summary: &mut DiscoverySummary,
    ) -> Vec<LinkCandidate> {
        let doc = Html::parse_document(html);
        let anchor_sel = Selector::parse("a[href]").expect("valid selector");

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for anchor in doc.select(&anchor_sel) {
            summary.anchors_seen += 1;
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };

            let url = match self.policy.normalize(base_url, href) {
                Ok(url) => url,
                Err(reason) => {
                    debug!(href, %reason, "rejected link");
                    continue;
                }
            };

            if NON_CATEGORY_RE.is_match(url.path()) {
                debug!(url = %url, "filtered utility path");
                continue;
            }
            if !seen.insert(url.to_string()) {
                continue;
            }

            let text = anchor.text().collect::<Vec<_>>().join(" ");
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            // Image-only anchors and numeric pagination links carry no
            // category signal worth a model call.
            if text.is_empty() || text.chars().all(|c| c.is_ascii_digit()) {
                debug!(url = %url, "filtered empty or pagination anchor");
                continue;
            }

            // The page was attribute-scrubbed by the reducer, so the outer
            // HTML keeps class/id signal without the tracking noise.
            let snippet = anchor.html();
            let snippet = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
            candidates.push(LinkCandidate {
                url: url.to_string(),
                anchor_html: Some(snippet),
            });
        }
        candidates
    }
}

/// One immediate retry for transient model failures; everything else is
/// handed back to the caller to count as a lost batch.
async fn classify_with_retry(
    model: &dyn ModelClient,
    domain: &str,
    batch: &[LinkCandidate],
) -> std::result::Result<Vec<String>, ModelError> {
    match model.classify_links(domain, batch).await {
        Err(e) if e.is_retryable() => {
            debug!(error = %e, "retrying classification batch");
            model.classify_links(domain, batch).await
        }
        other => other,
    }
}
