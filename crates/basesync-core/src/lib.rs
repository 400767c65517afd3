//! Core domain model, status log and incremental merge for basesync.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use heck::ToLowerCamelCase;
use serde::{Deserialize, Serialize};

mod merge;
mod status;

pub use merge::{merge_cycle, newest_modified, newest_modified_date, CycleCounts};
pub use status::{CollapsedEntry, ErrorReport, Phase, StatusEvent, StatusKind, StatusLog};

pub const CRATE_NAME: &str = "basesync-core";

/// Field name carrying a record's last modification timestamp.
pub const LAST_MODIFIED_FIELD: &str = "last_modified";

/// Opaque record payload.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Latest known state of every resource, keyed by resource key.
pub type Snapshot = BTreeMap<String, Vec<Record>>;

/// Records fetched during the in-flight cycle, keyed by resource key.
pub type CycleResult = BTreeMap<String, Vec<Record>>;

/// One remote resource and its fixed query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: BTreeMap::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
    #[serde(
        rename = "createdTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub created_time: Option<String>,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
            created_time: None,
        }
    }

    /// Parsed `last_modified` field; see [`parse_timestamp`] for string forms.
    /// Numbers are epoch milliseconds.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        match self.fields.get(LAST_MODIFIED_FIELD)? {
            serde_json::Value::String(text) => parse_timestamp(text),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(millis) => DateTime::from_timestamp_millis(millis),
                None => n
                    .as_f64()
                    .filter(|millis| millis.is_finite())
                    .and_then(|millis| DateTime::from_timestamp_millis(millis.trunc() as i64)),
            },
            _ => None,
        }
    }
}

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parses RFC 3339, then offset-less date-times and bare dates, read as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Total number of records across all resources.
pub fn total_records(tables: &BTreeMap<String, Vec<Record>>) -> usize {
    tables.values().map(Vec::len).sum()
}

/// Derives the storage key for a resource name.
#[derive(Clone)]
pub struct ResourceKeyFn(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl ResourceKeyFn {
    pub fn new(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn key_for(&self, resource_name: &str) -> String {
        (self.0)(resource_name)
    }
}

impl Default for ResourceKeyFn {
    fn default() -> Self {
        Self::new(camel_case_key)
    }
}

impl std::fmt::Debug for ResourceKeyFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResourceKeyFn")
    }
}

/// Default key strategy: lower camel case of the resource name.
pub fn camel_case_key(resource_name: &str) -> String {
    resource_name.to_lower_camel_case()
}
