//! SQL migration definitions for the crawl database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed within a transaction.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: domains, category_links, product_schemas, products",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per site being scraped
CREATE TABLE IF NOT EXISTS domains (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

-- Discovered category-page links and their crawl state.
-- last_crawled_at IS NULL means not yet attempted; failed marks a link
-- that exhausted its retries.
CREATE TABLE IF NOT EXISTS category_links (
    id              TEXT PRIMARY KEY,
    domain_id       TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    url             TEXT NOT NULL,
    anchor_html     TEXT,
    found_at        TEXT NOT NULL,
    last_crawled_at TEXT,
    failed          INTEGER NOT NULL DEFAULT 0,
    UNIQUE(domain_id, url)
);

CREATE INDEX IF NOT EXISTS idx_category_links_domain ON category_links(domain_id);
CREATE INDEX IF NOT EXISTS idx_category_links_pending
    ON category_links(domain_id) WHERE last_crawled_at IS NULL;

-- Extraction schemas; superseded rows are kept with current = 0
CREATE TABLE IF NOT EXISTS product_schemas (
    id              TEXT PRIMARY KEY,
    domain_id       TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    definition_json TEXT NOT NULL,
    generated_at    TEXT NOT NULL,
    current         INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_product_schemas_current
    ON product_schemas(domain_id) WHERE current = 1;

-- Extracted products, deduplicated on the natural key
CREATE TABLE IF NOT EXISTS products (
    id               TEXT PRIMARY KEY,
    domain_id        TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    category_link_id TEXT NOT NULL REFERENCES category_links(id) ON DELETE CASCADE,
    name             TEXT NOT NULL,
    price            TEXT NOT NULL,
    original_price   TEXT,
    discount         TEXT,
    image_url        TEXT,
    url              TEXT NOT NULL,
    found_at         TEXT NOT NULL,
    UNIQUE(domain_id, name, url)
);

CREATE INDEX IF NOT EXISTS idx_products_domain ON products(domain_id);
CREATE INDEX IF NOT EXISTS idx_products_category_link ON products(category_link_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
