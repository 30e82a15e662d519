//! Per-entry results and the ordered multi-entry response

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::{Entry, EntrySpec, DEFAULT_PROPERTY, DELIMITER};
use crate::error::{BackendError, ErrorKind, MultinetError, Result};

/// A failure attached to a single entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryError {
    /// Unified error kind
    pub kind: ErrorKind,
    /// Native status code reported by the backend, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<i32>,
    /// Human-readable message
    pub message: String,
}

impl EntryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailure, message)
    }

    pub fn device(status: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::DeviceError,
            status,
            message: message.into(),
        }
    }
}

impl From<&BackendError> for EntryError {
    fn from(err: &BackendError) -> Self {
        Self {
            kind: err.kind(),
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl From<BackendError> for EntryError {
    fn from(err: BackendError) -> Self {
        EntryError::from(&err)
    }
}

impl std::fmt::Display for EntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {}): {}", self.kind, status, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Result for one entry: a value (optionally timestamped) or an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEntry {
    Value {
        value: Value,
        /// When the backend sampled the value; `None` if it supplied no time
        #[serde(skip_serializing_if = "Option::is_none", default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Error(EntryError),
}

impl ResponseEntry {
    /// Untimestamped value
    pub fn value(value: impl Into<Value>) -> Self {
        ResponseEntry::Value {
            value: value.into(),
            timestamp: None,
        }
    }

    pub fn value_at(value: impl Into<Value>, timestamp: DateTime<Utc>) -> Self {
        ResponseEntry::Value {
            value: value.into(),
            timestamp: Some(timestamp),
        }
    }

    pub fn error(error: EntryError) -> Self {
        ResponseEntry::Error(error)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResponseEntry::Error(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ResponseEntry::Value { value, .. } => Some(value),
            ResponseEntry::Error(_) => None,
        }
    }

    pub fn as_error(&self) -> Option<&EntryError> {
        match self {
            ResponseEntry::Error(e) => Some(e),
            ResponseEntry::Value { .. } => None,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ResponseEntry::Value { timestamp, .. } => *timestamp,
            ResponseEntry::Error(_) => None,
        }
    }

    /// Timestamp as seconds since the epoch with sub-second precision
    pub fn timestamp_secs(&self) -> Option<f64> {
        self.timestamp().map(|ts| epoch_secs(&ts))
    }

    /// Drop the timestamp (callers that asked for `timestamp = false`)
    pub fn without_timestamp(self) -> Self {
        match self {
            ResponseEntry::Value { value, .. } => ResponseEntry::Value {
                value,
                timestamp: None,
            },
            other => other,
        }
    }

    /// Equality that ignores timestamps
    pub fn same_reading(&self, other: &ResponseEntry) -> bool {
        match (self, other) {
            (ResponseEntry::Value { value: a, .. }, ResponseEntry::Value { value: b, .. }) => {
                a == b
            }
            (ResponseEntry::Error(a), ResponseEntry::Error(b)) => a == b,
            _ => false,
        }
    }
}

fn epoch_secs(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_nanos()) * 1e-9
}

/// Ordered entry → result mapping for one logical call.
///
/// Keeps request order and keeps duplicates positionally; lookups return
/// the first occurrence. Every lookup accepts any entry spelling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultinetResponse {
    items: Vec<(Entry, ResponseEntry)>,
}

impl MultinetResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, entry: Entry, response: ResponseEntry) {
        self.items.push((entry, response));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Entry, &ResponseEntry)> {
        self.items.iter().map(|(e, r)| (e, r))
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.items.iter().map(|(e, _)| e)
    }

    pub fn get(&self, key: impl Into<EntrySpec>) -> Option<&ResponseEntry> {
        let key = key.into().into_entry().ok()?;
        self.items.iter().find(|(e, _)| *e == key).map(|(_, r)| r)
    }

    pub fn contains(&self, key: impl Into<EntrySpec>) -> bool {
        self.get(key).is_some()
    }

    /// Payload of a successful entry
    pub fn value(&self, key: impl Into<EntrySpec>) -> Option<&Value> {
        self.get(key).and_then(ResponseEntry::as_value)
    }

    pub fn is_error(&self, key: impl Into<EntrySpec>) -> bool {
        self.get(key).map_or(false, ResponseEntry::is_error)
    }

    pub fn error_for(&self, key: impl Into<EntrySpec>) -> Option<&EntryError> {
        self.get(key).and_then(ResponseEntry::as_error)
    }

    /// Native backend status for a failed entry; `None` on success
    pub fn status(&self, key: impl Into<EntrySpec>) -> Option<i32> {
        self.error_for(key).and_then(|e| e.status)
    }

    /// Value together with its timestamp in epoch seconds
    pub fn value_and_time(&self, key: impl Into<EntrySpec>) -> Option<(&Value, f64)> {
        match self.get(key)? {
            ResponseEntry::Value {
                value,
                timestamp: Some(ts),
            } => Some((value, epoch_secs(ts))),
            _ => None,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|(_, r)| r.is_error())
    }

    /// Only the failed entries, in order
    pub fn all_errors(&self) -> MultinetResponse {
        self.items
            .iter()
            .filter(|(_, r)| r.is_error())
            .cloned()
            .collect()
    }

    /// Entries matching a wildcard address such as `"simple.*:sin*"`.
    ///
    /// Each segment may use `*`; an omitted property means `value`.
    pub fn select(&self, pattern: &str) -> Result<MultinetResponse> {
        let segments: Vec<&str> = pattern.split(DELIMITER).collect();
        let (device, parameter, property) = match segments.as_slice() {
            [d, p] => (*d, *p, DEFAULT_PROPERTY),
            [d, p, prop] => (*d, *p, *prop),
            _ => {
                return Err(MultinetError::invalid(format!(
                    "pattern '{}' must have the form device:parameter[:property]",
                    pattern
                )))
            }
        };
        let device = wildcard(device)?;
        let parameter = wildcard(parameter)?;
        let property = wildcard(property)?;

        Ok(self
            .items
            .iter()
            .filter(|(e, _)| {
                device.is_match(e.device())
                    && parameter.is_match(e.parameter())
                    && property.is_match(e.property())
            })
            .cloned()
            .collect())
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Entry, &ResponseEntry) -> bool) {
        self.items.retain(|(e, r)| keep(e, r));
    }
}

fn wildcard(segment: &str) -> Result<Regex> {
    let body = segment
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
        .map_err(|e| MultinetError::invalid(format!("bad pattern segment '{}': {}", segment, e)))
}

impl FromIterator<(Entry, ResponseEntry)> for MultinetResponse {
    fn from_iter<T: IntoIterator<Item = (Entry, ResponseEntry)>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for MultinetResponse {
    type Item = (Entry, ResponseEntry);
    type IntoIter = std::vec::IntoIter<(Entry, ResponseEntry)>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl Extend<(Entry, ResponseEntry)> for MultinetResponse {
    fn extend<T: IntoIterator<Item = (Entry, ResponseEntry)>>(&mut self, iter: T) {
        self.items.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entry(s: &str) -> Entry {
        Entry::parse(s).unwrap()
    }

    fn sample() -> MultinetResponse {
        let mut resp = MultinetResponse::new();
        resp.push(entry("simple.test:sinM"), ResponseEntry::value(json!(0.5)));
        resp.push(
            entry("simple.test:intS"),
            ResponseEntry::error(EntryError::device(Some(12), "no such name")),
        );
        resp.push(
            entry("simple.cdev:degM"),
            ResponseEntry::error(EntryError::connection("unreachable")),
        );
        resp.push(entry("other.dev:sinM"), ResponseEntry::value(json!(1)));
        resp
    }

    #[test]
    fn lookups_accept_any_entry_form() {
        let resp = sample();
        assert_eq!(resp.value("simple.test:sinM"), Some(&json!(0.5)));
        assert_eq!(resp.value(("simple.test", "sinM")), Some(&json!(0.5)));
        assert_eq!(resp.value(("simple.test", "sinM", "value")), Some(&json!(0.5)));
        assert!(resp.get("missing.dev:x").is_none());
        assert!(resp.get("not-an-entry").is_none());
    }

    #[test]
    fn error_accessors() {
        let resp = sample();
        assert!(resp.is_error("simple.test:intS"));
        assert!(!resp.is_error("simple.test:sinM"));
        assert_eq!(resp.status("simple.test:intS"), Some(12));
        assert_eq!(resp.status("simple.test:sinM"), None);
        assert_eq!(
            resp.error_for("simple.cdev:degM").map(|e| e.kind),
            Some(ErrorKind::ConnectionFailure)
        );
    }

    #[test]
    fn all_errors_preserves_order() {
        let errors = sample().all_errors();
        let keys: Vec<String> = errors.entries().map(|e| e.to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "simple.test:intS:value".to_string(),
                "simple.cdev:degM:value".to_string()
            ]
        );
    }

    #[test]
    fn wildcard_selection() {
        let resp = sample();
        let simple = resp.select("simple.*:*").unwrap();
        assert_eq!(simple.len(), 3);

        let sin = resp.select("*:sin*").unwrap();
        let devices: Vec<&str> = sin.entries().map(|e| e.device()).collect();
        assert_eq!(devices, vec!["simple.test", "other.dev"]);

        assert!(resp.select("simple.test:sinM:units").unwrap().is_empty());
        assert!(resp.select("just-one-segment").is_err());
    }

    #[test]
    fn wildcard_treats_dots_literally() {
        let mut resp = MultinetResponse::new();
        resp.push(entry("simpleXtest:p"), ResponseEntry::value(1));
        assert!(resp.select("simple.test:p").unwrap().is_empty());
    }

    #[test]
    fn value_and_time_reports_epoch_seconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
        let mut resp = MultinetResponse::new();
        resp.push(entry("d:p"), ResponseEntry::value_at(json!(3), ts));
        resp.push(entry("d:q"), ResponseEntry::value(json!(4)));

        let (value, secs) = resp.value_and_time("d:p").unwrap();
        assert_eq!(value, &json!(3));
        assert!((secs - 1_700_000_000.25).abs() < 1e-6);
        assert!(resp.value_and_time("d:q").is_none());
    }

    #[test]
    fn duplicates_are_kept_positionally() {
        let mut resp = MultinetResponse::new();
        resp.push(entry("d:p"), ResponseEntry::value(1));
        resp.push(entry("d:p"), ResponseEntry::value(1));
        assert_eq!(resp.len(), 2);
    }

    #[test]
    fn same_reading_ignores_timestamps() {
        let a = ResponseEntry::value_at(json!(1), Utc::now());
        let b = ResponseEntry::value(json!(1));
        let c = ResponseEntry::value(json!(2));
        assert!(a.same_reading(&b));
        assert!(!a.same_reading(&c));
        assert_eq!(a.clone().without_timestamp(), b);
    }

    #[test]
    fn backend_errors_convert_to_entry_errors() {
        let err: EntryError = BackendError::Device {
            status: 5,
            message: "bad".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::DeviceError);
        assert_eq!(err.status, Some(5));

        let err: EntryError = BackendError::Timeout.into();
        assert_eq!(err.kind, ErrorKind::ConnectionFailure);
        assert_eq!(err.status, None);
    }
}
