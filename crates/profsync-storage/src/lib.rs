//! Authoritative record lookup (Postgres) + HTTP client utilities for profsync.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use profsync_core::{AuthoritativeRecord, FieldName};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "profsync-storage";

/// Progress is logged every time this many keys have been looked up.
pub const PROGRESS_EVERY_KEYS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database lookup failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record lookup returned a non-object row: {0}")]
    Decode(String),
    #[error("invalid record store configuration: {0}")]
    Config(String),
}

/// Lookup side of the join: fetches records whose key fields match a key batch.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Key fields a record can be matched by, primary first.
    fn key_fields(&self) -> &[String];

    async fn fetch_by_keys(&self, keys: &[String]) -> Result<Vec<AuthoritativeRecord>, StoreError>;

    /// Releases any held connections. Called once the join is finished.
    async fn close(&self) {}
}

#[derive(Debug, Clone)]
pub struct RecordStoreConfig {
    pub database_url: String,
    pub schema: String,
    pub table: String,
    pub key_fields: Vec<String>,
}

#[derive(Debug)]
pub struct PgRecordSource {
    pool: PgPool,
    key_fields: Vec<String>,
    lookup_sql: String,
}

impl PgRecordSource {
    /// Builds a single-connection pool that only dials the server on first use.
    pub fn connect_lazy(config: &RecordStoreConfig) -> Result<Self, StoreError> {
        validate_key_fields(&config.key_fields)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy(&config.database_url)?;
        Ok(Self {
            pool,
            key_fields: config.key_fields.clone(),
            lookup_sql: lookup_sql(&config.schema, &config.table, &config.key_fields),
        })
    }

    pub fn lookup_sql(&self) -> &str {
        &self.lookup_sql
    }
}

#[async_trait]
impl RecordSource for PgRecordSource {
    fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    async fn fetch_by_keys(&self, keys: &[String]) -> Result<Vec<AuthoritativeRecord>, StoreError> {
        let rows = sqlx::query(&self.lookup_sql)
            .bind(keys.to_vec())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Value = row.try_get("record")?;
            let record = AuthoritativeRecord::from_value(value.clone())
                .ok_or_else(|| StoreError::Decode(value.to_string()))?;
            out.push(record);
        }
        Ok(out)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

pub fn validate_key_fields(key_fields: &[String]) -> Result<(), StoreError> {
    if key_fields.is_empty() || key_fields.len() > 2 {
        return Err(StoreError::Config(format!(
            "expected one or two key fields, got {}",
            key_fields.len()
        )));
    }
    if key_fields.iter().any(|field| field.trim().is_empty()) {
        return Err(StoreError::Config("key field names must not be empty".to_string()));
    }
    Ok(())
}

/// Batch lookup statement: key fields and source fields projected into one JSON object.
pub fn lookup_sql(schema: &str, table: &str, key_fields: &[String]) -> String {
    let mut projected: Vec<&str> = key_fields.iter().map(String::as_str).collect();
    for field in FieldName::ALL {
        if !projected.contains(&field.source_field()) {
            projected.push(field.source_field());
        }
    }

    let object_args = projected
        .iter()
        .map(|column| format!("{}, {}", quote_literal(column), quote_ident(column)))
        .collect::<Vec<_>>()
        .join(", ");
    let predicate = key_fields
        .iter()
        .map(|field| format!("{} = ANY($1)", quote_ident(field)))
        .collect::<Vec<_>>()
        .join(" OR ");

    format!(
        "SELECT jsonb_build_object({object_args}) AS record FROM {}.{} WHERE {predicate}",
        quote_ident(schema),
        quote_ident(table)
    )
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub batch_size: usize,
    /// Resolved entries echoed to the log after the join; diagnostic only.
    pub sample_limit: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            sample_limit: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub by_key: HashMap<String, AuthoritativeRecord>,
    pub requested: usize,
    pub batches: usize,
    pub hits_by_field: BTreeMap<String, usize>,
}

impl Resolution {
    pub fn resolved(&self) -> usize {
        self.by_key.len()
    }

    pub fn get(&self, key: &str) -> Option<&AuthoritativeRecord> {
        self.by_key.get(key)
    }
}

/// Looks up `keys` in fixed-size batches and indexes every match by each key value it carries.
///
/// Records sharing a key value overwrite each other; the last one returned wins.
pub async fn resolve_records(
    source: &dyn RecordSource,
    keys: &[String],
    options: ResolveOptions,
) -> Result<Resolution, StoreError> {
    let batch_size = options.batch_size.max(1);
    let key_fields = source.key_fields().to_vec();
    let mut resolution = Resolution {
        requested: keys.len(),
        ..Default::default()
    };
    let mut processed = 0usize;

    for batch in keys.chunks(batch_size) {
        let wanted: HashSet<&str> = batch.iter().map(String::as_str).collect();
        let records = source.fetch_by_keys(batch).await?;
        resolution.batches += 1;

        for record in records {
            let exposed: Vec<(String, String)> = record
                .key_values(&key_fields)
                .map(|(field, key)| (field.to_string(), key))
                .collect();
            for (field, key) in exposed {
                if wanted.contains(key.as_str()) {
                    *resolution.hits_by_field.entry(field).or_default() += 1;
                }
                resolution.by_key.insert(key, record.clone());
            }
        }

        let before = processed;
        processed += batch.len();
        if processed / PROGRESS_EVERY_KEYS > before / PROGRESS_EVERY_KEYS || processed == keys.len() {
            info!(
                processed,
                requested = keys.len(),
                resolved = resolution.resolved(),
                hits = ?resolution.hits_by_field,
                "record lookup progress"
            );
        }
    }

    if options.sample_limit > 0 {
        info!(
            resolved = resolution.resolved(),
            requested = resolution.requested,
            "resolved record sample"
        );
        for (key, record) in resolution.by_key.iter().take(options.sample_limit) {
            info!(%key, record = %serde_json::Value::Object(record.fields().clone()), "sample record");
        }
    }

    Ok(resolution)
}
