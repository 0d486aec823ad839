//! Content reduction: shrink raw page HTML to the subset that carries
//! product or category signal before it is sent to a model.
//!
//! The reducer is a pure transform and never fails: when it cannot find
//! enough scored candidates to strip safely, it returns the input
//! unchanged. Callers must still apply their own byte cap — the result is
//! "reduced effort", not "guaranteed small".

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::debug;

/// What the reduced HTML will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceMode {
    /// Link classification input: anchors matter everywhere, so navigation
    /// chrome is preserved and only scripts/styles/attributes are stripped.
    CategoryDiscovery,
    /// Schema-generation input: boilerplate stripped, repeating product
    /// tiles kept with their markup structure intact.
    SchemaGeneration,
    /// Fallback-extraction input: same shape as schema generation.
    Extraction,
}

/// Minimum scored candidates required before we trust tile selection.
/// Below this the page layout defeated the scorer and we pass through.
const MIN_CANDIDATES: usize = 3;

/// Maximum candidate fragments kept for model input.
const KEEP_TOP_N: usize = 200;

/// Price-looking text, with an optional currency marker.
static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:[$€£]|USD|CAD|EUR|GBP)\s*\d[\d.,]*").expect("valid regex")
});

/// Class/id values that mark non-product chrome.
static NEG_CLASS_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)nav|footer|header|sidebar|ads?|banner|coupon|newsletter|promo|upsell|social|share|cookie")
        .expect("valid regex")
});

/// Attributes stripped from every element (presentation and tracking
/// noise). The quoted value is required so prose like "buy online" is
/// never touched.
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\s(?:style|role|tabindex|target|rel|data-[\w-]*|aria-[\w-]*|on\w+)(?:="[^"]*"|='[^']*')"#,
    )
    .expect("valid regex")
});

/// Runs of blank lines left behind by block removal.
static BLANK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Base usefulness of a tag when scoring candidate tiles.
fn tag_weight(tag: &str) -> Option<f32> {
    match tag {
        "article" => Some(1.5),
        "section" => Some(1.3),
        "li" => Some(1.0),
        "div" => Some(0.6),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Reduce `html` for the given mode. Pure; never panics or errors.
pub fn reduce(html: &str, mode: ReduceMode) -> String {
    let scrubbed = match mode {
        ReduceMode::CategoryDiscovery => scrub(html, false),
        ReduceMode::SchemaGeneration | ReduceMode::Extraction => scrub(html, true),
    };

    match mode {
        ReduceMode::CategoryDiscovery => scrubbed,
        ReduceMode::SchemaGeneration | ReduceMode::Extraction => {
            match select_product_fragments(&scrubbed) {
                Some(fragments) => fragments,
                None => {
                    debug!(
                        input_len = html.len(),
                        "too few scored candidates, passing page through unreduced"
                    );
                    html.to_string()
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 1: scrub junk tags and attributes
// ---------------------------------------------------------------------------

/// Remove script-like blocks (and boilerplate when `strip_chrome`), then
/// strip presentation/tracking attributes.
fn scrub(html: &str, strip_chrome: bool) -> String {
    let mut result = strip_tag_blocks(html, &["script", "style", "noscript", "svg", "iframe"]);
    if strip_chrome {
        result = strip_tag_blocks(&result, &["form", "header", "footer", "nav"]);
    }
    result = ATTR_RE.replace_all(&result, "").to_string();
    BLANK_RE.replace_all(&result, "\n\n").to_string()
}

/// Remove whole `<tag>...</tag>` blocks for each named tag.
fn strip_tag_blocks(html: &str, tags: &[&str]) -> String {
    let mut result = html.to_string();
    for tag in tags {
        // Non-greedy per-tag regex; a regex cannot balance nesting, but
        // these tags do not nest within themselves in real markup.
        let re = Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}>")).expect("valid regex");
        result = re.replace_all(&result, "").to_string();
        let self_closing = Regex::new(&format!(r"(?is)<{tag}\b[^>]*/>")).expect("valid regex");
        result = self_closing.replace_all(&result, "").to_string();
    }
    result
}

// ---------------------------------------------------------------------------
// Pass 2: score and select product tiles
// ---------------------------------------------------------------------------

/// Walk the document, score container elements for product signal, and
/// return the top fragments in document order. `None` when too few
/// candidates scored — the caller passes the page through instead.
fn select_product_fragments(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    let mut candidates: Vec<(usize, f32, ElementRef<'_>)> = Vec::new();
    let mut order = 0usize;

    for element in doc.root_element().descendent_elements() {
        let tag = element.value().name();
        let Some(base_weight) = tag_weight(tag) else {
            continue;
        };
        if is_chrome(&element) {
            continue;
        }

        let text = element.text().collect::<Vec<_>>().join(" ");
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let has_price = PRICE_RE.is_match(text);
        let words = text.split_whitespace().count();
        if !has_price && words < 2 {
            continue;
        }

        let mut score = base_weight;
        if has_price {
            score += 2.5;
        }
        if element.select(&selectors().anchor).next().is_some() {
            score += 0.5;
        }
        if element.select(&selectors().img).next().is_some() {
            score += 0.5;
        }
        // Mild preference for tile-sized text blocks over page-sized ones.
        if (3..=80).contains(&words) {
            score += 0.6;
        }

        candidates.push((order, score, element));
        order += 1;
    }

    if candidates.len() < MIN_CANDIDATES {
        return None;
    }

    // Score descending, document order ascending for ties.
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    let mut accepted: Vec<(usize, ElementRef<'_>)> = Vec::new();
    let mut accepted_ids = HashSet::new();
    let mut accepted_ancestors = HashSet::new();

    for (ord, _score, element) in candidates {
        if accepted.len() >= KEEP_TOP_N {
            break;
        }
        let id = element.id();
        // Covered by an already accepted ancestor, or contains one.
        if element.ancestors().any(|a| accepted_ids.contains(&a.id())) {
            continue;
        }
        if accepted_ancestors.contains(&id) {
            continue;
        }

        accepted_ids.insert(id);
        for a in element.ancestors() {
            accepted_ancestors.insert(a.id());
        }
        accepted.push((ord, element));
    }

    accepted.sort_by_key(|(ord, _)| *ord);

    let joined = accepted
        .iter()
        .map(|(_, el)| el.html())
        .collect::<Vec<_>>()
        .join("\n");

    Some(joined)
}

/// Reject elements whose class/id mark them as page chrome.
fn is_chrome(element: &ElementRef<'_>) -> bool {
    let value = element.value();
    let class = value.attr("class").unwrap_or("");
    let id = value.attr("id").unwrap_or("");
    NEG_CLASS_ID_RE.is_match(class) || NEG_CLASS_ID_RE.is_match(id)
}

struct Selectors {
    anchor: scraper::Selector,
    img: scraper::Selector,
}

fn selectors() -> &'static Selectors {
    static SELECTORS: LazyLock<Selectors> = LazyLock::new(|| Selectors {
        anchor: scraper::Selector::parse("a[href]").expect("valid selector"),
        img: scraper::Selector::parse("img").expect("valid selector"),
    });
    &SELECTORS
}
