//! Turso Embedded / libSQL storage layer for the crawl database.
//!
//! The [`Storage`] struct wraps a libSQL database holding domains,
//! discovered category links with their crawl state, cached extraction
//! schemas, and extracted products.
//!
//! **Access rules:**
//! - The pipeline opens read-write via [`Storage::open`] (sole writer)
//! - Reporting commands may open read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use uuid::Uuid;

use shelfscrape_shared::{
    CategoryLink, DomainRecord, Product, ProductSchemaRecord, Result, SchemaDefinition,
    ShelfscrapeError,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Per-domain crawl progress counts, for status reporting.
#[derive(Debug, Clone, Default)]
pub struct DomainCounts {
    pub links_total: u64,
    pub links_pending: u64,
    pub links_done: u64,
    pub links_failed: u64,
    pub products: u64,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ShelfscrapeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ShelfscrapeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ShelfscrapeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Domain operations
    // -----------------------------------------------------------------------

    /// Look up a domain by name, creating it on first sight.
    pub async fn get_or_create_domain(&self, name: &str) -> Result<DomainRecord> {
        if let Some(domain) = self.get_domain(name).await? {
            return Ok(domain);
        }

        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT OR IGNORE INTO domains (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), name, now.to_rfc3339()],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        // Re-read: a concurrent writer may have won the insert race.
        self.get_domain(name)
            .await?
            .ok_or_else(|| ShelfscrapeError::Storage(format!("domain {name} vanished after insert")))
    }

    /// Get a domain by name.
    pub async fn get_domain(&self, name: &str) -> Result<Option<DomainRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, created_at FROM domains WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_domain(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ShelfscrapeError::Storage(e.to_string())),
        }
    }

    /// List all known domains.
    pub async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let mut rows = self
            .conn
            .query("SELECT id, name, created_at FROM domains ORDER BY name", params![])
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_domain(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Category link operations
    // -----------------------------------------------------------------------

    /// Insert a discovered category link. Returns `true` if the link was new,
    /// `false` if the `(domain_id, url)` pair already existed.
    pub async fn insert_category_link(&self, link: &CategoryLink) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO category_links
                   (id, domain_id, url, anchor_html, found_at, last_crawled_at, failed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    link.id.as_str(),
                    link.domain_id.as_str(),
                    link.url.as_str(),
                    link.anchor_html.as_deref(),
                    link.found_at.to_rfc3339(),
                    link.last_crawled_at.map(|t| t.to_rfc3339()),
                    link.failed as i64,
                ],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// List links not yet attempted (`last_crawled_at IS NULL`), oldest first.
    pub async fn list_pending_links(&self, domain_id: &str) -> Result<Vec<CategoryLink>> {
        self.query_links(
            "SELECT id, domain_id, url, anchor_html, found_at, last_crawled_at, failed
             FROM category_links
             WHERE domain_id = ?1 AND last_crawled_at IS NULL
             ORDER BY found_at",
            domain_id,
        )
        .await
    }

    /// List all links for a domain, oldest first.
    pub async fn list_links(&self, domain_id: &str) -> Result<Vec<CategoryLink>> {
        self.query_links(
            "SELECT id, domain_id, url, anchor_html, found_at, last_crawled_at, failed
             FROM category_links WHERE domain_id = ?1 ORDER BY found_at",
            domain_id,
        )
        .await
    }

    async fn query_links(&self, sql: &str, domain_id: &str) -> Result<Vec<CategoryLink>> {
        let mut rows = self
            .conn
            .query(sql, params![domain_id])
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_link(&row)?);
        }
        Ok(results)
    }

    /// Record the terminal outcome of a crawl attempt: stamps
    /// `last_crawled_at` and sets the `failed` flag.
    pub async fn mark_link_crawled(&self, link_id: &str, failed: bool) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE category_links SET last_crawled_at = ?1, failed = ?2 WHERE id = ?3",
                params![now.as_str(), failed as i64, link_id],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Return failed links to the pending state. Returns the number reset.
    pub async fn reset_failed_links(&self, domain_id: &str) -> Result<u64> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE category_links SET last_crawled_at = NULL, failed = 0
                 WHERE domain_id = ?1 AND failed = 1",
                params![domain_id],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Schema operations
    // -----------------------------------------------------------------------

    /// Get the domain's current extraction schema, if any.
    pub async fn current_schema(&self, domain_id: &str) -> Result<Option<ProductSchemaRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, domain_id, definition_json, generated_at, current
                 FROM product_schemas
                 WHERE domain_id = ?1 AND current = 1
                 ORDER BY generated_at DESC LIMIT 1",
                params![domain_id],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_schema(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ShelfscrapeError::Storage(e.to_string())),
        }
    }

    /// Store a freshly generated schema as the domain's current one.
    /// Any prior current schema is retained with `current = 0`.
    pub async fn insert_schema(
        &self,
        domain_id: &str,
        definition: &SchemaDefinition,
    ) -> Result<ProductSchemaRecord> {
        self.check_writable()?;

        self.conn
            .execute(
                "UPDATE product_schemas SET current = 0 WHERE domain_id = ?1 AND current = 1",
                params![domain_id],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        let record = ProductSchemaRecord {
            id: Uuid::now_v7().to_string(),
            domain_id: domain_id.to_string(),
            definition: definition.clone(),
            generated_at: Utc::now(),
            current: true,
        };
        let definition_json = serde_json::to_string(definition)
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO product_schemas (id, domain_id, definition_json, generated_at, current)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![
                    record.id.as_str(),
                    domain_id,
                    definition_json.as_str(),
                    record.generated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;
        Ok(record)
    }

    /// Demote the domain's current schema without replacing it (drift).
    pub async fn invalidate_schema(&self, domain_id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE product_schemas SET current = 0 WHERE domain_id = ?1 AND current = 1",
                params![domain_id],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Product operations
    // -----------------------------------------------------------------------

    /// Insert an extracted product. Returns `true` if the product was new,
    /// `false` if the `(domain_id, name, url)` triple already existed.
    pub async fn insert_product(&self, product: &Product) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO products
                   (id, domain_id, category_link_id, name, price, original_price,
                    discount, image_url, url, found_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    product.id.as_str(),
                    product.domain_id.as_str(),
                    product.category_link_id.as_str(),
                    product.name.as_str(),
                    product.price.as_str(),
                    product.original_price.as_deref(),
                    product.discount.as_deref(),
                    product.image_url.as_deref(),
                    product.url.as_str(),
                    product.found_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// List products extracted for a domain, newest first.
    pub async fn list_products(&self, domain_id: &str, limit: u32) -> Result<Vec<Product>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, domain_id, category_link_id, name, price, original_price,
                        discount, image_url, url, found_at
                 FROM products WHERE domain_id = ?1
                 ORDER BY found_at DESC LIMIT ?2",
                params![domain_id, limit],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_product(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    /// Aggregate crawl progress for a domain.
    pub async fn domain_counts(&self, domain_id: &str) -> Result<DomainCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT
                   COUNT(*),
                   SUM(CASE WHEN last_crawled_at IS NULL THEN 1 ELSE 0 END),
                   SUM(CASE WHEN last_crawled_at IS NOT NULL AND failed = 0 THEN 1 ELSE 0 END),
                   SUM(CASE WHEN failed = 1 THEN 1 ELSE 0 END)
                 FROM category_links WHERE domain_id = ?1",
                params![domain_id],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;

        let mut counts = DomainCounts::default();
        if let Ok(Some(row)) = rows.next().await {
            counts.links_total = row.get::<i64>(0).unwrap_or(0) as u64;
            counts.links_pending = row.get::<i64>(1).unwrap_or(0) as u64;
            counts.links_done = row.get::<i64>(2).unwrap_or(0) as u64;
            counts.links_failed = row.get::<i64>(3).unwrap_or(0) as u64;
        }

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM products WHERE domain_id = ?1",
                params![domain_id],
            )
            .await
            .map_err(|e| ShelfscrapeError::Storage(e.to_string()))?;
        if let Ok(Some(row)) = rows.next().await {
            counts.products = row.get::<i64>(0).unwrap_or(0) as u64;
        }

        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_domain(row: &libsql::Row) -> Result<DomainRecord> {
    Ok(DomainRecord {
        id: get_string(row, 0)?,
        name: get_string(row, 1)?,
        created_at: get_datetime(row, 2)?,
    })
}

fn row_to_link(row: &libsql::Row) -> Result<CategoryLink> {
    Ok(CategoryLink {
        id: get_string(row, 0)?,
        domain_id: get_string(row, 1)?,
        url: get_string(row, 2)?,
        anchor_html: row.get::<String>(3).ok(),
        found_at: get_datetime(row, 4)?,
        last_crawled_at: match row.get::<String>(5) {
            Ok(s) => Some(parse_datetime(&s)?),
            Err(_) => None,
        },
        failed: row.get::<i64>(6).unwrap_or(0) != 0,
    })
}

fn row_to_schema(row: &libsql::Row) -> Result<ProductSchemaRecord> {
    let definition_json = get_string(row, 2)?;
    let definition: SchemaDefinition = serde_json::from_str(&definition_json)
        .map_err(|e| ShelfscrapeError::Storage(format!("invalid schema json: {e}")))?;
    Ok(ProductSchemaRecord {
        id: get_string(row, 0)?,
        domain_id: get_string(row, 1)?,
        definition,
        generated_at: get_datetime(row, 3)?,
        current: row.get::<i64>(4).unwrap_or(0) != 0,
    })
}

fn row_to_product(row: &libsql::Row) -> Result<Product> {
    Ok(Product {
        id: get_string(row, 0)?,
        domain_id: get_string(row, 1)?,
        category_link_id: get_string(row, 2)?,
        name: get_string(row, 3)?,
        price: get_string(row, 4)?,
        original_price: row.get::<String>(5).ok(),
        discount: row.get::<String>(6).ok(),
        image_url: row.get::<String>(7).ok(),
        url: get_string(row, 8)?,
        found_at: get_datetime(row, 9)?,
    })
}

fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx)
        .map_err(|e| ShelfscrapeError::Storage(e.to_string()))
}

fn get_datetime(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>> {
    let s = get_string(row, idx)?;
    parse_datetime(&s)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ShelfscrapeError::Storage(format!("invalid date: {e}")))
}
