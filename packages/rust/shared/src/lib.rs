//! Shared types, error model, and configuration for Shelfscrape.
//!
//! This crate is the foundation depended on by all other Shelfscrape crates.
//! It provides:
//! - [`ShelfscrapeError`] — the unified error type
//! - Domain types ([`DomainRecord`], [`CategoryLink`], [`Product`],
//!   [`SchemaDefinition`], [`Id`])
//! - The link normalizer ([`links::LinkPolicy`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod links;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, DiscoveryConfig, OpenRouterConfig, RunConfig, SchemaConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, resolve_db_path,
    validate_api_key,
};
pub use error::{Result, ShelfscrapeError};
pub use links::{LinkPolicy, LinkRejection, base_domain, url_base_domain};
pub use types::{
    CategoryLink, DomainRecord, FieldKind, FieldSpec, Id, LinkState, Product, ProductCandidate,
    ProductSchemaRecord, SchemaDefinition,
};
