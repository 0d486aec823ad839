//! Aggregated crawl results for one domain run.

use std::time::Duration;

/// Summary of one extraction run over a domain's pending category links.
#[derive(Debug, Clone, Default)]
pub struct DomainReport {
    /// Domain name the run covered.
    pub domain: String,
    /// Pending links dispatched to workers.
    pub links_attempted: usize,
    /// Links that completed and were stamped done.
    pub links_done: usize,
    /// Links that exhausted retries and were stamped failed.
    pub links_failed: usize,
    /// URLs of the failed links, for operator follow-up (`reset` re-queues
    /// them).
    pub failed_urls: Vec<String>,
    /// Valid products found across all pages.
    pub products_found: usize,
    /// Products newly inserted (found minus already-known).
    pub products_inserted: usize,
    /// Pages that went through the model-fallback path.
    pub fallback_pages: usize,
    /// Times schema drift demoted the current schema.
    pub schema_invalidations: usize,
    /// Links left undispatched because the run was cancelled.
    pub cancelled: usize,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}
