use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use profsync_adapters::{EngageEntry, PlatformError, ProfilePlatform};
use profsync_core::{AuthoritativeRecord, ProfileRow, SYNC_STAMP_FIELD};
use profsync_storage::{RecordSource, StoreError};
use profsync_sync::{ReconcileConfig, ReconcilePipeline, RunOutcome};
use serde_json::{json, Value};

#[derive(Default)]
struct PlatformLog {
    scripts: Vec<String>,
    batches: Vec<Vec<EngageEntry>>,
}

struct FakePlatform {
    rows: Option<Value>,
    log: Arc<Mutex<PlatformLog>>,
}

#[async_trait]
impl ProfilePlatform for FakePlatform {
    async fn query_profiles(&self, script: &str) -> Result<Vec<ProfileRow>, PlatformError> {
        self.log.lock().expect("lock").scripts.push(script.to_string());
        match &self.rows {
            Some(rows) => Ok(serde_json::from_value(rows.clone())?),
            None => Err(PlatformError::RemoteQuery {
                status: 401,
                body: "bad credentials".into(),
            }),
        }
    }

    async fn send_profile_batch(&self, entries: &[EngageEntry]) -> Result<(), PlatformError> {
        self.log.lock().expect("lock").batches.push(entries.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct StoreLog {
    lookups: Vec<Vec<String>>,
    closed: bool,
}

struct FakeRecords {
    key_fields: Vec<String>,
    records: Vec<Value>,
    fail: bool,
    log: Arc<Mutex<StoreLog>>,
}

#[async_trait]
impl RecordSource for FakeRecords {
    fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    async fn fetch_by_keys(&self, keys: &[String]) -> Result<Vec<AuthoritativeRecord>, StoreError> {
        self.log.lock().expect("lock").lookups.push(keys.to_vec());
        if self.fail {
            return Err(StoreError::Decode("connection reset".into()));
        }
        Ok(self
            .records
            .iter()
            .cloned()
            .filter_map(AuthoritativeRecord::from_value)
            .filter(|record| record.key_values(&self.key_fields).any(|(_, k)| keys.contains(&k)))
            .collect())
    }

    async fn close(&self) {
        self.log.lock().expect("lock").closed = true;
    }
}

struct Harness {
    platform_log: Arc<Mutex<PlatformLog>>,
    store_log: Arc<Mutex<StoreLog>>,
    pipeline: ReconcilePipeline,
}

fn config(extra: &[(&str, &str)]) -> ReconcileConfig {
    let mut env: HashMap<String, String> = [
        ("MIXPANEL_PROJECT_ID", "123"),
        ("MIXPANEL_SERVICE_USERNAME", "svc"),
        ("MIXPANEL_SERVICE_SECRET", "secret"),
        ("MIXPANEL_TOKEN", "write-token"),
        ("DATABASE_URL", "postgres://localhost/app"),
        ("DATABASE_SCHEMA", "public"),
        ("DATABASE_TABLE", "users"),
        ("SYNC_RUN_TAG", "tag-1"),
        ("BATCH_UPDATE_PAUSE_MS", "0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in extra {
        env.insert(k.to_string(), v.to_string());
    }
    ReconcileConfig::from_lookup(|name| env.get(name).cloned()).expect("config")
}

fn harness(config: ReconcileConfig, rows: Option<Value>, records: Vec<Value>, fail_store: bool) -> Harness {
    let platform_log = Arc::new(Mutex::new(PlatformLog::default()));
    let store_log = Arc::new(Mutex::new(StoreLog::default()));
    let key_fields = config.record_store.key_fields.clone();
    let pipeline = ReconcilePipeline::with_backends(
        config,
        Box::new(FakePlatform {
            rows,
            log: platform_log.clone(),
        }),
        Box::new(FakeRecords {
            key_fields,
            records,
            fail: fail_store,
            log: store_log.clone(),
        }),
    );
    Harness {
        platform_log,
        store_log,
        pipeline,
    }
}

#[tokio::test]
async fn missing_end_date_is_filled_from_the_record_store() {
    let h = harness(
        config(&[]),
        Some(json!([{"distinct_id": "d-1", "aid_prop": "A1", "missing": ["endDate"], "props": {}}])),
        vec![json!({"aid": "A1", "expireDate": "2024-01-01"})],
        false,
    );

    let summary = h.pipeline.run_once().await.expect("run succeeds");

    assert_eq!(summary.outcome, RunOutcome::Dispatched);
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.keys_requested, 1);
    assert_eq!(summary.keys_resolved, 1);

    let log = h.platform_log.lock().expect("lock");
    assert_eq!(log.batches.len(), 1);
    let entry = &log.batches[0][0];
    assert_eq!(entry.token, "write-token");
    assert_eq!(entry.distinct_id, "d-1");
    assert_eq!(
        Value::Object(entry.set.clone()),
        json!({"endDate": "2024-01-01T00:00:00.000Z", SYNC_STAMP_FIELD: "tag-1"})
    );
    assert!(h.store_log.lock().expect("lock").closed);
}

#[tokio::test]
async fn empty_query_result_stops_before_any_lookup_or_update() {
    let h = harness(config(&[]), Some(json!([])), vec![], false);

    let summary = h.pipeline.run_once().await.expect("run succeeds");

    assert_eq!(summary.outcome, RunOutcome::NoProfilesMissingFields);
    assert_eq!(h.platform_log.lock().expect("lock").scripts.len(), 1);
    assert!(h.platform_log.lock().expect("lock").batches.is_empty());
    assert!(h.store_log.lock().expect("lock").lookups.is_empty());
}

#[tokio::test]
async fn skipped_rows_are_counted_by_reason_in_dry_run() {
    let h = harness(
        config(&[("DRY_RUN", "1")]),
        Some(json!([
            {"distinct_id": "d-1", "aid_prop": "  ", "missing": ["plan"]},
            {"distinct_id": "d-2", "aid_prop": "UNKNOWN", "missing": ["plan"]},
            {"distinct_id": "d-3", "aid_prop": "A3", "missing": [], "props": {"plan": "gold"}},
            {"distinct_id": "d-4", "aid_prop": "A4", "missing": ["plan"]},
            {"distinct_id": "d-5", "aid_prop": "A4", "missing": ["status"]}
        ])),
        vec![
            json!({"aid": "A3", "plan": "silver"}),
            json!({"aid": "A4", "plan": "gold", "status": "active"}),
        ],
        false,
    );

    let summary = h.pipeline.run_once().await.expect("run succeeds");

    assert_eq!(summary.query_rows, 5);
    assert_eq!(summary.rows_without_join_property, 1);
    assert_eq!(summary.keys_requested, 3);
    assert_eq!(summary.skipped_no_join_key, 1);
    assert_eq!(summary.skipped_not_found, 1);
    assert_eq!(summary.skipped_no_changes, 1);
    assert_eq!(summary.planned_updates, 2);
    assert_eq!(summary.sent, 2);
    assert!(summary.dry_run);
    assert!(h.platform_log.lock().expect("lock").batches.is_empty());
}

#[tokio::test]
async fn nothing_to_update_skips_dispatch() {
    let h = harness(
        config(&[]),
        Some(json!([{"distinct_id": "d-1", "aid_prop": "A1", "missing": ["plan"]}])),
        vec![json!({"aid": "A1", "plan": ""})],
        false,
    );

    let summary = h.pipeline.run_once().await.expect("run succeeds");

    assert_eq!(summary.outcome, RunOutcome::NothingToUpdate);
    assert!(h.platform_log.lock().expect("lock").batches.is_empty());
}

#[tokio::test]
async fn fallback_uses_the_profile_id_as_join_key() {
    let h = harness(
        config(&[("FALLBACK_AID_EQUALS_DISTINCT", "true")]),
        Some(json!([{"distinct_id": "S-9", "missing": ["recurrence"]}])),
        vec![json!({"aid": "A9", "sourceId": "S-9", "recurrence": "monthly"})],
        false,
    );

    let summary = h.pipeline.run_once().await.expect("run succeeds");

    assert_eq!(summary.sent, 1);
    assert_eq!(summary.key_hits.get("sourceId"), Some(&1));
    assert_eq!(h.store_log.lock().expect("lock").lookups, vec![vec!["S-9".to_string()]]);
}

#[tokio::test]
async fn dry_run_limit_truncates_requested_keys() {
    let h = harness(
        config(&[("DRY_RUN", "1"), ("DRY_RUN_LIMIT", "2")]),
        Some(json!([
            {"distinct_id": "d-1", "aid_prop": "A1", "missing": ["plan"]},
            {"distinct_id": "d-2", "aid_prop": "A2", "missing": ["plan"]},
            {"distinct_id": "d-3", "aid_prop": "A3", "missing": ["plan"]}
        ])),
        vec![],
        false,
    );

    let summary = h.pipeline.run_once().await.expect("run succeeds");

    assert_eq!(summary.keys_requested, 2);
    assert_eq!(
        h.store_log.lock().expect("lock").lookups,
        vec![vec!["A1".to_string(), "A2".to_string()]]
    );
}

#[tokio::test]
async fn query_failure_aborts_before_the_record_store() {
    let h = harness(config(&[]), None, vec![], false);

    let err = h.pipeline.run_once().await.expect_err("run fails");

    assert!(format!("{err:#}").contains("HTTP 401: bad credentials"));
    assert!(h.store_log.lock().expect("lock").lookups.is_empty());
}

#[tokio::test]
async fn lookup_failure_still_closes_the_record_store() {
    let h = harness(
        config(&[]),
        Some(json!([{"distinct_id": "d-1", "aid_prop": "A1", "missing": ["plan"]}])),
        vec![],
        true,
    );

    assert!(h.pipeline.run_once().await.is_err());
    assert!(h.store_log.lock().expect("lock").closed);
    assert!(h.platform_log.lock().expect("lock").batches.is_empty());
}

#[tokio::test]
async fn reports_are_written_under_the_run_tag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let reports = dir.path().display().to_string();
    let h = harness(
        config(&[("REPORTS_DIR", reports.as_str()), ("SYNC_RUN_TAG", "2026-02-24T12:00:00.000Z")]),
        Some(json!([{"distinct_id": "d-1", "aid_prop": "A1", "missing": ["status"]}])),
        vec![json!({"aid": "A1", "status": "active"})],
        false,
    );

    let summary = h.pipeline.run_once().await.expect("run succeeds");

    let run_dir = dir.path().join("2026-02-24T12-00-00.000Z");
    assert_eq!(summary.reports_dir, Some(run_dir.display().to_string()));

    let written: Value = serde_json::from_str(
        &std::fs::read_to_string(run_dir.join("run_summary.json")).expect("summary file"),
    )
    .expect("summary json");
    assert_eq!(written["sent"], json!(1));
    assert_eq!(written["outcome"], json!("dispatched"));
    assert_eq!(written["run_tag"], json!("2026-02-24T12:00:00.000Z"));

    let planned: Value = serde_json::from_str(
        &std::fs::read_to_string(run_dir.join("planned_updates.json")).expect("updates file"),
    )
    .expect("updates json");
    assert_eq!(planned[0]["profile_id"], json!("d-1"));
    assert_eq!(planned[0]["reasons"]["status"], json!("was_missing"));
}
