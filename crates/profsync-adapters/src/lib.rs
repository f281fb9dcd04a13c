//! Analytics platform adapter: JQL people query generation, query execution and
//! profile batch updates.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use profsync_core::{FieldName, PlannedUpdate, ProfileRow, BLANKISH_TOKENS};
use profsync_storage::{build_http_client, HttpClientConfig};
use reqwest::header::ACCEPT;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "profsync-adapters";

pub const DEFAULT_QUERY_URL: &str = "https://mixpanel.com/api/2.0/jql";
pub const DEFAULT_ENGAGE_URL: &str = "https://api.mixpanel.com/engage#profile-batch-update";

/// `$ip` value that stops the platform from geo-enriching updated profiles.
pub const SUPPRESS_GEO_IP: &str = "0";

const PEOPLE_QUERY_TEMPLATE: &str = include_str!("../assets/people_query.js");

/// Builds the JQL script selecting every profile missing at least one `required` field.
///
/// `cap == 0` means no limit. Once `cap` profiles are selected, later profiles
/// are no longer marked; earlier selections are unaffected.
pub fn build_people_query(required: &[FieldName], cap: u64, join_property: &str) -> String {
    let required: Vec<&str> = required.iter().map(|field| field.as_str()).collect();
    let tracked: Vec<&str> = FieldName::ALL.iter().map(|field| field.as_str()).collect();

    PEOPLE_QUERY_TEMPLATE
        .replace("__REQUIRED__", &js_literal(&required))
        .replace("__TRACKED__", &js_literal(&tracked))
        .replace("__BLANK_TOKENS__", &js_literal(&BLANKISH_TOKENS))
        .replace("__CAP__", &cap.to_string())
        .replace("__JOIN_PROPERTY__", &js_literal(&join_property))
        .trim()
        .to_string()
}

fn js_literal<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// SHA-256 of the script text, recorded in run reports.
pub fn script_digest(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn parse_profile_rows(body: &[u8]) -> Result<Vec<ProfileRow>, PlatformError> {
    Ok(serde_json::from_slice(body)?)
}

#[derive(Clone)]
pub struct PlatformCredentials {
    pub project_id: String,
    pub service_username: String,
    pub service_secret: String,
    pub write_token: String,
}

impl fmt::Debug for PlatformCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformCredentials")
            .field("project_id", &self.project_id)
            .field("service_username", &self.service_username)
            .field("service_secret", &"<redacted>")
            .field("write_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PlatformEndpoints {
    pub query_url: String,
    pub engage_url: String,
}

impl Default for PlatformEndpoints {
    fn default() -> Self {
        Self {
            query_url: DEFAULT_QUERY_URL.to_string(),
            engage_url: DEFAULT_ENGAGE_URL.to_string(),
        }
    }
}

/// One element of a profile batch update request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngageEntry {
    #[serde(rename = "$token")]
    pub token: String,
    #[serde(rename = "$distinct_id")]
    pub distinct_id: String,
    #[serde(rename = "$ip")]
    pub ip: String,
    #[serde(rename = "$set")]
    pub set: Map<String, Value>,
}

impl EngageEntry {
    pub fn for_update(write_token: &str, update: &PlannedUpdate) -> Self {
        Self {
            token: write_token.to_string(),
            distinct_id: update.profile_id.clone(),
            ip: SUPPRESS_GEO_IP.to_string(),
            set: update.fields_to_set.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("people query failed with HTTP {status}: {body}")]
    RemoteQuery { status: u16, body: String },
    #[error("profile batch update failed with HTTP {status}: {body}")]
    BatchDelivery { status: u16, body: String },
    #[error("platform request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("decoding people query response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ProfilePlatform: Send + Sync {
    /// Runs a JQL script and decodes its rows.
    async fn query_profiles(&self, script: &str) -> Result<Vec<ProfileRow>, PlatformError>;

    /// Delivers one batch of profile `$set` operations.
    async fn send_profile_batch(&self, entries: &[EngageEntry]) -> Result<(), PlatformError>;
}

#[derive(Debug)]
pub struct HttpProfilePlatform {
    client: reqwest::Client,
    credentials: PlatformCredentials,
    endpoints: PlatformEndpoints,
}

impl HttpProfilePlatform {
    pub fn new(
        http: &HttpClientConfig,
        credentials: PlatformCredentials,
        endpoints: PlatformEndpoints,
    ) -> Result<Self> {
        Ok(Self {
            client: build_http_client(http)?,
            credentials,
            endpoints,
        })
    }
}

#[async_trait]
impl ProfilePlatform for HttpProfilePlatform {
    async fn query_profiles(&self, script: &str) -> Result<Vec<ProfileRow>, PlatformError> {
        debug!(url = %self.endpoints.query_url, script_bytes = script.len(), "posting people query");
        let resp = self
            .client
            .post(&self.endpoints.query_url)
            .basic_auth(
                &self.credentials.service_username,
                Some(&self.credentials.service_secret),
            )
            .form(&[
                ("project_id", self.credentials.project_id.as_str()),
                ("script", script),
            ])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(PlatformError::RemoteQuery {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        parse_profile_rows(&body)
    }

    async fn send_profile_batch(&self, entries: &[EngageEntry]) -> Result<(), PlatformError> {
        let resp = self
            .client
            .post(&self.endpoints.engage_url)
            .header(ACCEPT, "application/json")
            .json(entries)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PlatformError::BatchDelivery {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
