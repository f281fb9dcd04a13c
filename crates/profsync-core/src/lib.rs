//! Core domain model, value normalization and update planning for profsync.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "profsync-core";

/// Profile property stamped with the run tag on every non-empty update.
pub const SYNC_STAMP_FIELD: &str = "kyte_last_profile_sync_at";

/// Trimmed, lowercased strings that count as an empty value.
///
/// The remote people query embeds this same list so both sides agree on what
/// "missing" means.
pub const BLANKISH_TOKENS: [&str; 7] = ["", "undefined", "null", "nan", "none", "n/a", "-"];

/// JS `Date` range limit in milliseconds either side of the epoch.
const MAX_EPOCH_MILLIS: f64 = 8.64e15;

const OFFSET_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];
const NAIVE_DATE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Subscription fields tracked on analytics profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldName {
    Status,
    Plan,
    EndDate,
    ToleranceEndDate,
    Recurrence,
}

impl FieldName {
    pub const ALL: [FieldName; 5] = [
        FieldName::Status,
        FieldName::Plan,
        FieldName::EndDate,
        FieldName::ToleranceEndDate,
        FieldName::Recurrence,
    ];

    /// Property name on the analytics profile.
    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::Status => "status",
            FieldName::Plan => "plan",
            FieldName::EndDate => "endDate",
            FieldName::ToleranceEndDate => "toleranceEndDate",
            FieldName::Recurrence => "recurrence",
        }
    }

    /// Column holding the authoritative value in the operational database.
    pub fn source_field(self) -> &'static str {
        match self {
            FieldName::Status => "status",
            FieldName::Plan => "plan",
            FieldName::EndDate => "expireDate",
            FieldName::ToleranceEndDate => "toleranceDate",
            FieldName::Recurrence => "recurrence",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.as_str() == name)
    }

    pub fn from_source_field(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.source_field() == name)
    }

    pub fn is_date(self) -> bool {
        matches!(self, FieldName::EndDate | FieldName::ToleranceEndDate)
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One profile returned by the people query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProfileRow {
    #[serde(rename = "distinct_id")]
    pub profile_id: String,
    #[serde(rename = "aid_prop", default, deserialize_with = "deserialize_join_key")]
    pub join_key: Option<String>,
    #[serde(rename = "missing", default)]
    pub missing_fields: BTreeSet<FieldName>,
    #[serde(rename = "props", default, deserialize_with = "deserialize_existing_values")]
    pub existing_values: BTreeMap<FieldName, Value>,
}

impl ProfileRow {
    pub fn new(profile_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            join_key: None,
            missing_fields: BTreeSet::new(),
            existing_values: BTreeMap::new(),
        }
    }

    pub fn with_join_key(mut self, key: impl Into<String>) -> Self {
        self.join_key = Some(key.into());
        self
    }

    pub fn with_missing(mut self, field: FieldName) -> Self {
        self.missing_fields.insert(field);
        self
    }

    pub fn with_existing(mut self, field: FieldName, value: Value) -> Self {
        self.existing_values.insert(field, value);
        self
    }

    /// Join property value when it is usable as a key.
    pub fn usable_join_key(&self) -> Option<&str> {
        self.join_key.as_deref().filter(|key| !is_blankish_str(key))
    }

    /// Key used to look the profile up, optionally falling back to the profile id.
    pub fn effective_join_key(&self, fallback_to_profile_id: bool) -> Option<&str> {
        self.usable_join_key().or_else(|| {
            (fallback_to_profile_id && !self.profile_id.is_empty()).then_some(self.profile_id.as_str())
        })
    }
}

fn deserialize_join_key<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(key_text))
}

fn deserialize_existing_values<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<FieldName, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(name, value)| FieldName::parse(&name).map(|field| (field, value)))
        .collect())
}

/// Text form of a key value: strings verbatim, numbers in decimal.
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Database record holding the authoritative subscription values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthoritativeRecord {
    fields: Map<String, Value>,
}

impl AuthoritativeRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Field value, treating JSON `null` as absent.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|value| !value.is_null())
    }

    /// Non-empty key values this record exposes, paired with the key field name.
    pub fn key_values<'a>(
        &'a self,
        key_fields: &'a [String],
    ) -> impl Iterator<Item = (&'a str, String)> + 'a {
        key_fields.iter().filter_map(move |field| {
            self.get(field)
                .and_then(key_text)
                .filter(|key| !key.is_empty())
                .map(|key| (field.as_str(), key))
        })
    }
}

pub fn is_blankish(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => is_blankish_str(s),
        Some(_) => false,
    }
}

pub fn is_blankish_str(value: &str) -> bool {
    let normalized = value.trim().to_lowercase();
    BLANKISH_TOKENS.contains(&normalized.as_str())
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-05-27T22:09:55.084Z`.
pub fn canonical_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Normalizes a date-like value (ISO text or epoch number) to [`canonical_instant`] form.
pub fn to_canonical_date(value: &Value) -> Option<String> {
    let instant = match value {
        Value::String(text) => parse_date_text(text)?,
        Value::Number(n) => epoch_to_instant(n.as_f64()?)?,
        _ => return None,
    };
    Some(canonical_instant(instant))
}

fn epoch_to_instant(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    // Large values are already milliseconds; anything else is seconds.
    let millis = (if raw > 1e12 { raw } else { raw * 1000.0 }).trunc();
    if millis.abs() > MAX_EPOCH_MILLIS {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}

fn parse_date_text(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in OFFSET_DATE_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(text, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for format in NAIVE_DATE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// String form used for non-date comparisons.
pub fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn values_equal(a: &Value, b: &Value, field: FieldName) -> bool {
    if field.is_date() {
        date_identity(a) == date_identity(b)
    } else {
        display_string(a) == display_string(b)
    }
}

fn date_identity(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        other => Some(to_canonical_date(other).unwrap_or_else(|| display_string(other))),
    }
}

/// Audit stamp shared by every update produced in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RunTag(String);

impl RunTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Explicit override when non-empty, otherwise `now` in canonical form.
    pub fn resolve(override_tag: Option<&str>, now: DateTime<Utc>) -> Self {
        match override_tag.filter(|tag| !tag.is_empty()) {
            Some(tag) => Self(tag.to_string()),
            None => Self(canonical_instant(now)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe rendering for report directories.
    pub fn path_segment(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl fmt::Display for RunTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a field was included in an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetReason {
    WasMissing,
    ExistingBlank,
    ForcedDifference,
}

/// Field-level update for one analytics profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedUpdate {
    pub profile_id: String,
    pub fields_to_set: Map<String, Value>,
    pub reasons: BTreeMap<FieldName, SetReason>,
}

impl PlannedUpdate {
    /// An empty update means the profile needs no write.
    pub fn is_empty(&self) -> bool {
        self.fields_to_set.is_empty()
    }
}

/// Computes the minimal update that brings `row` in line with `record`.
///
/// Fields are only written when the profile lacks them, holds a blank-ish
/// value, or (with `force_overwrite_if_different`) holds a different one.
/// An empty authoritative value never produces a write.
pub fn plan_update(
    record: &AuthoritativeRecord,
    row: &ProfileRow,
    force_overwrite_if_different: bool,
    run_tag: &RunTag,
) -> PlannedUpdate {
    let mut fields_to_set = Map::new();
    let mut reasons = BTreeMap::new();

    for field in FieldName::ALL {
        let Some(raw) = record.get(field.source_field()) else {
            continue;
        };
        if matches!(raw, Value::String(s) if s.is_empty()) {
            continue;
        }

        let candidate = if field.is_date() {
            match to_canonical_date(raw) {
                Some(iso) => Value::String(iso),
                None => continue,
            }
        } else {
            raw.clone()
        };

        let existing = row.existing_values.get(&field);
        let existing_is_blank = existing.is_some() && is_blankish(existing);

        let reason = if row.missing_fields.contains(&field) {
            Some(SetReason::WasMissing)
        } else if existing_is_blank {
            Some(SetReason::ExistingBlank)
        } else if force_overwrite_if_different
            && existing.is_some_and(|current| !values_equal(&candidate, current, field))
        {
            Some(SetReason::ForcedDifference)
        } else {
            None
        };

        if let Some(reason) = reason {
            fields_to_set.insert(field.as_str().to_string(), candidate);
            reasons.insert(field, reason);
        }
    }

    if !fields_to_set.is_empty() {
        fields_to_set.insert(
            SYNC_STAMP_FIELD.to_string(),
            Value::String(run_tag.as_str().to_string()),
        );
    }

    PlannedUpdate {
        profile_id: row.profile_id.clone(),
        fields_to_set,
        reasons,
    }
}
