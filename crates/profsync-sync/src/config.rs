use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use profsync_adapters::{PlatformCredentials, PlatformEndpoints, DEFAULT_ENGAGE_URL, DEFAULT_QUERY_URL};
use profsync_storage::{HttpClientConfig, RecordStoreConfig, ResolveOptions};
use thiserror::Error;

use crate::dispatch::DispatchOptions;

pub const DEFAULT_AID_PROP_NAME: &str = "Store Id (aid)";
pub const DEFAULT_KEY_FIELDS: &str = "aid,sourceId";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing env var: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub credentials: PlatformCredentials,
    pub endpoints: PlatformEndpoints,
    pub record_store: RecordStoreConfig,
    /// Informational: the deployment keys profiles by account id.
    pub distinct_equals_aid: bool,
    pub dry_run: bool,
    pub force_update_if_different: bool,
    pub aid_prop_name: String,
    pub fallback_aid_equals_distinct: bool,
    pub max_query_results: u64,
    pub dry_run_key_limit: usize,
    pub db_batch_size: usize,
    pub db_sample_limit: usize,
    pub update_batch_size: usize,
    pub update_pause: Duration,
    pub run_tag_override: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub reports_dir: Option<PathBuf>,
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let credentials = PlatformCredentials {
            project_id: required(&get, "MIXPANEL_PROJECT_ID")?,
            service_username: required(&get, "MIXPANEL_SERVICE_USERNAME")?,
            service_secret: required(&get, "MIXPANEL_SERVICE_SECRET")?,
            write_token: required(&get, "MIXPANEL_TOKEN")?,
        };
        let database_url = required(&get, "DATABASE_URL")?;
        let schema = required(&get, "DATABASE_SCHEMA")?;
        let table = required(&get, "DATABASE_TABLE")?;

        let key_fields_raw = get("DATABASE_KEY_FIELDS").unwrap_or_else(|| DEFAULT_KEY_FIELDS.to_string());
        let key_fields: Vec<String> = key_fields_raw
            .split(',')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .map(ToString::to_string)
            .collect();
        if key_fields.is_empty() || key_fields.len() > 2 {
            return Err(ConfigError::Invalid {
                name: "DATABASE_KEY_FIELDS",
                value: key_fields_raw,
                reason: "expected one or two comma-separated field names".to_string(),
            });
        }

        Ok(Self {
            credentials,
            endpoints: PlatformEndpoints {
                query_url: get("MIXPANEL_QUERY_URL").unwrap_or_else(|| DEFAULT_QUERY_URL.to_string()),
                engage_url: get("MIXPANEL_ENGAGE_URL")
                    .unwrap_or_else(|| DEFAULT_ENGAGE_URL.to_string()),
            },
            record_store: RecordStoreConfig {
                database_url,
                schema,
                table,
                key_fields,
            },
            distinct_equals_aid: flag(&get, "DISTINCT_EQUALS_AID", true)?,
            dry_run: flag(&get, "DRY_RUN", false)?,
            force_update_if_different: flag(&get, "FORCE_UPDATE_IF_DIFFERENT", false)?,
            aid_prop_name: get("AID_PROP_NAME").unwrap_or_else(|| DEFAULT_AID_PROP_NAME.to_string()),
            fallback_aid_equals_distinct: flag(&get, "FALLBACK_AID_EQUALS_DISTINCT", false)?,
            max_query_results: number(&get, "MAX_JQL_RESULTS", 0)?,
            dry_run_key_limit: number(&get, "DRY_RUN_LIMIT", 0)?,
            db_batch_size: number(&get, "DB_BATCH_SIZE", 1000)?,
            db_sample_limit: number(&get, "DB_SAMPLE_LIMIT", 0)?,
            update_batch_size: number(&get, "BATCH_UPDATE_SIZE", 1000)?,
            update_pause: Duration::from_millis(number(&get, "BATCH_UPDATE_PAUSE_MS", 300)?),
            run_tag_override: get("SYNC_RUN_TAG"),
            http_timeout_secs: number(&get, "PROFSYNC_HTTP_TIMEOUT_SECS", 60)?,
            user_agent: get("PROFSYNC_USER_AGENT").unwrap_or_else(|| "profsync/0.1".to_string()),
            reports_dir: get("REPORTS_DIR").map(PathBuf::from),
        })
    }

    pub fn query_script_params(&self) -> QueryScriptParams {
        QueryScriptParams {
            aid_prop_name: self.aid_prop_name.clone(),
            max_query_results: self.max_query_results,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            batch_size: self.db_batch_size,
            sample_limit: self.db_sample_limit,
        }
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            batch_size: self.update_batch_size,
            pause: self.update_pause,
            dry_run: self.dry_run,
            ..Default::default()
        }
    }
}

/// The subset of settings that shapes the people query, readable without credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryScriptParams {
    pub aid_prop_name: String,
    pub max_query_results: u64,
}

impl QueryScriptParams {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());
        Ok(Self {
            aid_prop_name: get("AID_PROP_NAME").unwrap_or_else(|| DEFAULT_AID_PROP_NAME.to_string()),
            max_query_results: number(&get, "MAX_JQL_RESULTS", 0)?,
        })
    }
}

/// Command-line switches layered over the environment.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOverrides {
    pub dry_run: bool,
    pub force_overwrite: bool,
    pub max_results: Option<u64>,
    pub report_dir: Option<PathBuf>,
}

impl ReconcileOverrides {
    pub fn apply(self, config: &mut ReconcileConfig) {
        if self.dry_run {
            config.dry_run = true;
        }
        if self.force_overwrite {
            config.force_update_if_different = true;
        }
        if let Some(max) = self.max_results {
            config.max_query_results = max;
        }
        if let Some(dir) = self.report_dir {
            config.reports_dir = Some(dir);
        }
    }
}

fn required<F>(get: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    get(name).ok_or(ConfigError::Missing(name))
}

fn flag<F>(get: &F, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => parse_flag(&raw).ok_or_else(|| ConfigError::Invalid {
            name,
            value: raw,
            reason: "expected 1/0 or true/false".to_string(),
        }),
    }
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn number<F, T>(get: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("MIXPANEL_PROJECT_ID", "123"),
            ("MIXPANEL_SERVICE_USERNAME", "svc"),
            ("MIXPANEL_SERVICE_SECRET", "secret"),
            ("MIXPANEL_TOKEN", "token"),
            ("DATABASE_URL", "postgres://localhost/app"),
            ("DATABASE_SCHEMA", "public"),
            ("DATABASE_TABLE", "users"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<ReconcileConfig, ConfigError> {
        ReconcileConfig::from_lookup(|name| env.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_unset() {
        let config = load(&base_env()).expect("config");
        assert!(config.distinct_equals_aid);
        assert!(!config.dry_run);
        assert!(!config.force_update_if_different);
        assert!(!config.fallback_aid_equals_distinct);
        assert_eq!(config.aid_prop_name, "Store Id (aid)");
        assert_eq!(config.record_store.key_fields, vec!["aid", "sourceId"]);
        assert_eq!(config.max_query_results, 0);
        assert_eq!(config.update_batch_size, 1000);
        assert_eq!(config.update_pause, Duration::from_millis(300));
        assert_eq!(config.db_batch_size, 1000);
        assert_eq!(config.run_tag_override, None);
        assert_eq!(config.endpoints.query_url, DEFAULT_QUERY_URL);
        assert!(config.reports_dir.is_none());
    }

    #[test]
    fn missing_mandatory_var_is_named() {
        for name in ["MIXPANEL_TOKEN", "DATABASE_URL", "DATABASE_TABLE"] {
            let mut env = base_env();
            env.remove(name);
            match load(&env) {
                Err(ConfigError::Missing(missing)) => assert_eq!(missing, name),
                other => panic!("expected missing {name}, got {other:?}"),
            }
        }
    }

    #[test]
    fn empty_mandatory_var_counts_as_missing() {
        let mut env = base_env();
        env.insert("MIXPANEL_PROJECT_ID", "");
        assert!(matches!(load(&env), Err(ConfigError::Missing("MIXPANEL_PROJECT_ID"))));
    }

    #[test]
    fn optional_values_are_parsed() {
        let mut env = base_env();
        env.insert("DRY_RUN", "1");
        env.insert("FORCE_UPDATE_IF_DIFFERENT", "TRUE");
        env.insert("DISTINCT_EQUALS_AID", "false");
        env.insert("DATABASE_KEY_FIELDS", " aid ");
        env.insert("BATCH_UPDATE_PAUSE_MS", "0");
        env.insert("MAX_JQL_RESULTS", "50");
        env.insert("SYNC_RUN_TAG", "manual-7");
        let config = load(&env).expect("config");

        assert!(config.dry_run);
        assert!(config.force_update_if_different);
        assert!(!config.distinct_equals_aid);
        assert_eq!(config.record_store.key_fields, vec!["aid"]);
        assert_eq!(config.update_pause, Duration::ZERO);
        assert_eq!(config.max_query_results, 50);
        assert_eq!(config.run_tag_override.as_deref(), Some("manual-7"));
        assert!(config.dispatch_options().dry_run);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut env = base_env();
        env.insert("DB_BATCH_SIZE", "lots");
        assert!(matches!(load(&env), Err(ConfigError::Invalid { name: "DB_BATCH_SIZE", .. })));

        let mut env = base_env();
        env.insert("DRY_RUN", "maybe");
        assert!(matches!(load(&env), Err(ConfigError::Invalid { name: "DRY_RUN", .. })));

        let mut env = base_env();
        env.insert("DATABASE_KEY_FIELDS", "a,b,c");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Invalid { name: "DATABASE_KEY_FIELDS", .. })
        ));
    }

    #[test]
    fn overrides_layer_over_environment() {
        let mut config = load(&base_env()).expect("config");
        ReconcileOverrides {
            dry_run: true,
            force_overwrite: false,
            max_results: Some(5),
            report_dir: Some(PathBuf::from("/tmp/reports")),
        }
        .apply(&mut config);

        assert!(config.dry_run);
        assert!(!config.force_update_if_different);
        assert_eq!(config.max_query_results, 5);
        assert_eq!(config.reports_dir, Some(PathBuf::from("/tmp/reports")));
        assert_eq!(config.query_script_params().max_query_results, 5);
    }

    #[test]
    fn query_script_params_need_no_credentials() {
        let env = HashMap::from([("MAX_JQL_RESULTS", "25"), ("AID_PROP_NAME", "")]);
        let params = QueryScriptParams::from_lookup(|name| env.get(name).map(|v| v.to_string()))
            .expect("params");
        assert_eq!(params.aid_prop_name, DEFAULT_AID_PROP_NAME);
        assert_eq!(params.max_query_results, 25);

        let env = HashMap::from([("MAX_JQL_RESULTS", "-1")]);
        assert!(QueryScriptParams::from_lookup(|name| env.get(name).map(|v| v.to_string())).is_err());
    }
}
