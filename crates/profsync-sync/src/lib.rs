//! Reconciliation pipeline: people query, record join, update planning and dispatch.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use profsync_adapters::{build_people_query, script_digest, HttpProfilePlatform, ProfilePlatform};
use profsync_core::{plan_update, FieldName, PlannedUpdate, ProfileRow, RunTag};
use profsync_storage::{resolve_records, PgRecordSource, RecordSource};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, Instrument};

mod config;
mod dispatch;

pub use config::{
    parse_flag, ConfigError, QueryScriptParams, ReconcileConfig, ReconcileOverrides,
    DEFAULT_AID_PROP_NAME, DEFAULT_KEY_FIELDS,
};
pub use dispatch::{dispatch_updates, BatchOutcome, DispatchOptions, DispatchReport};

pub const CRATE_NAME: &str = "profsync-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    NoProfilesMissingFields,
    NothingToUpdate,
    Dispatched,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_tag: RunTag,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub force_update_if_different: bool,
    pub script_sha256: String,
    pub query_rows: usize,
    pub rows_without_join_property: usize,
    pub keys_requested: usize,
    pub keys_resolved: usize,
    pub key_hits: BTreeMap<String, usize>,
    pub skipped_no_join_key: usize,
    pub skipped_not_found: usize,
    pub skipped_no_changes: usize,
    pub planned_updates: usize,
    pub sent: usize,
    pub failed_batches: usize,
    pub outcome: RunOutcome,
    pub reports_dir: Option<String>,
}

impl ReconcileSummary {
    fn start(run_tag: RunTag, config: &ReconcileConfig) -> Self {
        let now = Utc::now();
        Self {
            run_tag,
            started_at: now,
            finished_at: now,
            dry_run: config.dry_run,
            force_update_if_different: config.force_update_if_different,
            script_sha256: String::new(),
            query_rows: 0,
            rows_without_join_property: 0,
            keys_requested: 0,
            keys_resolved: 0,
            key_hits: BTreeMap::new(),
            skipped_no_join_key: 0,
            skipped_not_found: 0,
            skipped_no_changes: 0,
            planned_updates: 0,
            sent: 0,
            failed_batches: 0,
            outcome: RunOutcome::NoProfilesMissingFields,
            reports_dir: None,
        }
    }
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    run_tag: RunTag,
    platform: Box<dyn ProfilePlatform>,
    records: Box<dyn RecordSource>,
}

impl ReconcilePipeline {
    /// Wires the HTTP platform client and a lazily connected record store.
    pub fn new(config: ReconcileConfig) -> Result<Self> {
        let platform = HttpProfilePlatform::new(
            &config.http_client_config(),
            config.credentials.clone(),
            config.endpoints.clone(),
        )?;
        let records = PgRecordSource::connect_lazy(&config.record_store)
            .context("configuring record store")?;
        Ok(Self::with_backends(config, Box::new(platform), Box::new(records)))
    }

    pub fn with_backends(
        config: ReconcileConfig,
        platform: Box<dyn ProfilePlatform>,
        records: Box<dyn RecordSource>,
    ) -> Self {
        let run_tag = RunTag::resolve(config.run_tag_override.as_deref(), Utc::now());
        Self {
            config,
            run_tag,
            platform,
            records,
        }
    }

    pub fn run_tag(&self) -> &RunTag {
        &self.run_tag
    }

    pub fn query_script(&self) -> String {
        render_query_script(&self.config.query_script_params())
    }

    pub async fn run_once(&self) -> Result<ReconcileSummary> {
        let span = info_span!("reconcile", run_tag = %self.run_tag, dry_run = self.config.dry_run);
        self.run_stages().instrument(span).await
    }

    async fn run_stages(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::start(self.run_tag.clone(), &self.config);
        info!(
            fields = ?FieldName::ALL.map(FieldName::as_str),
            join_property = %self.config.aid_prop_name,
            distinct_equals_aid = self.config.distinct_equals_aid,
            force_update_if_different = self.config.force_update_if_different,
            "checking profiles with missing fields"
        );

        let script = self.query_script();
        summary.script_sha256 = script_digest(&script);
        let rows = self
            .platform
            .query_profiles(&script)
            .await
            .context("running people query")?;
        summary.query_rows = rows.len();

        if rows.is_empty() {
            info!("no profiles with missing fields");
            return self.finish(summary, &[]).await;
        }
        summary.rows_without_join_property =
            rows.iter().filter(|row| row.usable_join_key().is_none()).count();
        info!(
            rows = rows.len(),
            without_join_property = summary.rows_without_join_property,
            "people query returned profiles missing fields"
        );

        let keys = self.collect_join_keys(&rows);
        summary.keys_requested = keys.len();
        info!(keys = keys.len(), "looking up join keys in record store");

        let resolved =
            resolve_records(self.records.as_ref(), &keys, self.config.resolve_options()).await;
        self.records.close().await;
        let resolution = resolved.context("resolving join keys against the record store")?;
        summary.keys_resolved = resolution.resolved();
        summary.key_hits = resolution.hits_by_field.clone();
        info!(
            resolved = resolution.resolved(),
            requested = resolution.requested,
            "record lookup finished"
        );

        let fallback = self.config.fallback_aid_equals_distinct;
        let mut updates = Vec::new();
        for row in &rows {
            let Some(key) = row.effective_join_key(fallback) else {
                summary.skipped_no_join_key += 1;
                continue;
            };
            let Some(record) = resolution.get(key) else {
                summary.skipped_not_found += 1;
                continue;
            };
            let update = plan_update(
                record,
                row,
                self.config.force_update_if_different,
                &self.run_tag,
            );
            if update.is_empty() {
                summary.skipped_no_changes += 1;
                continue;
            }
            updates.push(update);
        }
        summary.planned_updates = updates.len();
        info!(
            planned = updates.len(),
            no_join_key = summary.skipped_no_join_key,
            not_found = summary.skipped_not_found,
            no_changes = summary.skipped_no_changes,
            "update planning finished"
        );

        if updates.is_empty() {
            summary.outcome = RunOutcome::NothingToUpdate;
            info!("no usable record values to fill or update");
            return self.finish(summary, &updates).await;
        }

        let options = self.config.dispatch_options();
        let mode = if options.dry_run { "dry-run" } else { "live" };
        info!(
            updates = updates.len(),
            batch_size = options.batch_size,
            pause_ms = options.pause.as_millis() as u64,
            mode,
            "dispatching profile updates"
        );
        let report = dispatch_updates(
            self.platform.as_ref(),
            &self.config.credentials.write_token,
            &updates,
            &options,
        )
        .await;
        summary.sent = report.sent;
        summary.failed_batches = report.failed_batches();
        summary.outcome = RunOutcome::Dispatched;

        self.finish(summary, &updates).await
    }

    fn collect_join_keys(&self, rows: &[ProfileRow]) -> Vec<String> {
        let fallback = self.config.fallback_aid_equals_distinct;
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for row in rows {
            if let Some(key) = row.effective_join_key(fallback) {
                if seen.insert(key) {
                    keys.push(key.to_string());
                }
            }
        }

        let limit = self.config.dry_run_key_limit;
        if self.config.dry_run && limit > 0 && keys.len() > limit {
            keys.truncate(limit);
        }
        keys
    }

    async fn finish(
        &self,
        mut summary: ReconcileSummary,
        updates: &[PlannedUpdate],
    ) -> Result<ReconcileSummary> {
        summary.finished_at = Utc::now();
        if let Some(root) = &self.config.reports_dir {
            let dir = root.join(self.run_tag.path_segment());
            summary.reports_dir = Some(dir.display().to_string());
            write_reports(&dir, &summary, updates).await?;
        }

        info!(
            outcome = ?summary.outcome,
            sent = summary.sent,
            failed_batches = summary.failed_batches,
            run_tag = %summary.run_tag,
            "reconcile run finished"
        );
        Ok(summary)
    }
}

async fn write_reports(
    dir: &Path,
    summary: &ReconcileSummary,
    updates: &[PlannedUpdate],
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    let updates_json = serde_json::to_vec_pretty(updates).context("serializing planned updates")?;
    fs::write(dir.join("planned_updates.json"), updates_json)
        .await
        .context("writing planned_updates.json")?;

    Ok(dir.to_path_buf())
}

/// Renders the people query over every tracked field.
pub fn render_query_script(params: &QueryScriptParams) -> String {
    build_people_query(&FieldName::ALL, params.max_query_results, &params.aid_prop_name)
}

pub async fn run_reconcile_from_env(overrides: ReconcileOverrides) -> Result<ReconcileSummary> {
    let mut config = ReconcileConfig::from_env()?;
    overrides.apply(&mut config);
    let pipeline = ReconcilePipeline::new(config)?;
    pipeline.run_once().await
}
