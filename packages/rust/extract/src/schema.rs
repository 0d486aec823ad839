//! Schema lifecycle: cache, single-flight generation, and drift detection.
//!
//! One schema is current per domain at a time. A cached schema is reused
//! until it ages past the refresh interval or drifts (a run of zero-yield
//! pages), at which point it is demoted and the next page regenerates it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use shelfscrape_model::ModelClient;
use shelfscrape_reduce::{ReduceMode, reduce};
use shelfscrape_shared::{DomainRecord, Result, SchemaDefinition, ShelfscrapeError};
use shelfscrape_storage::Storage;

use crate::clamp_bytes;

/// Manages per-domain extraction schemas.
pub struct SchemaManager {
    refresh_secs: u64,
    drift_threshold: u32,
    max_model_bytes: usize,
    /// Per-domain generation locks: concurrent workers on the same domain
    /// must not each pay for a schema generation.
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Consecutive zero-yield page counts per domain, reset on any yield.
    zero_streaks: std::sync::Mutex<HashMap<String, u32>>,
}

impl SchemaManager {
    pub fn new(refresh_secs: u64, drift_threshold: u32, max_model_bytes: usize) -> Self {
        Self {
            refresh_secs,
            drift_threshold: drift_threshold.max(1),
            max_model_bytes,
            locks: tokio::sync::Mutex::new(HashMap::new()),
            zero_streaks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Get the domain's current schema, generating one from `sample_html`
    /// when none is cached or the cached one has gone stale.
    #[instrument(skip_all, fields(domain = %domain.name))]
    pub async fn get_or_create(
        &self,
        storage: &Storage,
        model: &dyn ModelClient,
        domain: &DomainRecord,
        sample_html: &str,
    ) -> Result<SchemaDefinition> {
        if let Some(definition) = self.fresh_cached(storage, &domain.id).await? {
            debug!("using cached schema");
            return Ok(definition);
        }

        let lock = self.domain_lock(&domain.id).await;
        let _guard = lock.lock().await;

        // Another worker may have generated while we waited on the lock.
        if let Some(definition) = self.fresh_cached(storage, &domain.id).await? {
            debug!("schema generated by concurrent worker");
            return Ok(definition);
        }

        info!("generating extraction schema");
        let reduced = reduce(sample_html, ReduceMode::SchemaGeneration);
        let sample = clamp_bytes(&reduced, self.max_model_bytes);

        let definition = model
            .generate_schema(&domain.name, sample)
            .await
            .map_err(|e| ShelfscrapeError::model(e.to_string(), e.is_retryable()))?;

        if !definition.is_valid() {
            return Err(ShelfscrapeError::validation(format!(
                "generated schema for {} is structurally invalid",
                domain.name
            )));
        }

        storage.insert_schema(&domain.id, &definition).await?;
        self.zero_streaks.lock().unwrap_or_else(|p| p.into_inner()).remove(&domain.id);
        Ok(definition)
    }

    /// Record how many products a schema-path page yielded. A run of
    /// `drift_threshold` consecutive zero-yield pages demotes the schema;
    /// returns `true` when that happened.
    pub async fn record_page_yield(
        &self,
        storage: &Storage,
        domain_id: &str,
        yielded: usize,
    ) -> Result<bool> {
        let streak = {
            let mut streaks = self.zero_streaks.lock().unwrap_or_else(|p| p.into_inner());
            if yielded > 0 {
                streaks.remove(domain_id);
                return Ok(false);
            }
            let streak = streaks.entry(domain_id.to_string()).or_insert(0);
            *streak += 1;
            *streak
        };

        if streak < self.drift_threshold {
            return Ok(false);
        }

        warn!(domain_id, streak, "schema drift detected, invalidating");
        storage.invalidate_schema(domain_id).await?;
        self.zero_streaks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(domain_id);
        Ok(true)
    }

    /// Current schema, if one exists and is younger than the refresh interval.
    async fn fresh_cached(
        &self,
        storage: &Storage,
        domain_id: &str,
    ) -> Result<Option<SchemaDefinition>> {
        let Some(record) = storage.current_schema(domain_id).await? else {
            return Ok(None);
        };
        let age = Utc::now()
            .signed_duration_since(record.generated_at)
            .num_seconds();
        if age < 0 || age as u64 >= self.refresh_secs {
            debug!(age, "cached schema expired");
            return Ok(None);
        }
        Ok(Some(record.definition))
    }

    async fn domain_lock(&self, domain_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(domain_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
