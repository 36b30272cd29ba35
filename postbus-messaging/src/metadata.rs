//! Per-message metadata carried as broker headers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known metadata keys.
pub mod keys {
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const MESSAGE_ID: &str = "message_id";
    pub const TYPE_NAME: &str = "type_name";
    pub const NAME: &str = "name";
    pub const CONTENT_TYPE: &str = "content_type";
    pub const CREATED: &str = "created";
    pub const TRACE_ID: &str = "trace_id";
    pub const SPAN_ID: &str = "span_id";
    pub const TRACEPARENT: &str = "traceparent";
}

/// Open key/value bag created fresh for every publish and every delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(HashMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value of `key`; `None` when absent, empty or not a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert only when the key is missing, null or an empty string.
    /// Returns true when the value was written.
    pub fn set_if_absent(&mut self, key: &str, value: impl Into<Value>) -> bool {
        let present = match self.0.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        };
        if !present {
            self.0.insert(key.to_string(), value.into());
        }
        !present
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get_str(keys::CORRELATION_ID)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get_str(keys::MESSAGE_ID)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.get_str(keys::TYPE_NAME)
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str(keys::NAME)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get_str(keys::CONTENT_TYPE)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.get_str(keys::TRACE_ID)
    }

    pub fn span_id(&self) -> Option<&str> {
        self.get_str(keys::SPAN_ID)
    }

    pub fn traceparent(&self) -> Option<&str> {
        self.get_str(keys::TRACEPARENT)
    }

    /// Creation time, stored as RFC 3339.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.get_str(keys::CREATED)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_created(&mut self, at: DateTime<Utc>) {
        self.insert(keys::CREATED, at.to_rfc3339());
    }

    /// String-valued entries, the shape trace propagators read.
    pub fn to_string_map(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect()
    }
}

impl From<HashMap<String, Value>> for Metadata {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Metadata {
    type Item = (String, Value);
    type IntoIter = std::collections::hash_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_if_absent_never_overwrites() {
        let mut md = Metadata::new().with(keys::CORRELATION_ID, "caller");

        assert!(!md.set_if_absent(keys::CORRELATION_ID, "generated"));
        assert_eq!(md.correlation_id(), Some("caller"));

        assert!(md.set_if_absent(keys::MESSAGE_ID, "m-1"));
        assert_eq!(md.message_id(), Some("m-1"));
    }

    #[test]
    fn test_empty_and_null_count_as_absent() {
        let mut md = Metadata::new()
            .with(keys::TYPE_NAME, "")
            .with(keys::NAME, Value::Null);

        assert_eq!(md.type_name(), None);
        assert!(md.set_if_absent(keys::TYPE_NAME, "Order"));
        assert!(md.set_if_absent(keys::NAME, "order"));
        assert_eq!(md.type_name(), Some("Order"));
        assert_eq!(md.name(), Some("order"));
    }

    #[test]
    fn test_created_round_trips_through_rfc3339() {
        let now = Utc::now();
        let mut md = Metadata::new();
        md.set_created(now);

        let created = md.created().unwrap();
        assert_eq!(created.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_string_map_skips_non_strings() {
        let md = Metadata::new()
            .with(keys::TRACEPARENT, "00-abc-def-01")
            .with("attempt", 2)
            .with("flag", true);

        let map = md.to_string_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map[keys::TRACEPARENT], "00-abc-def-01");
    }
}
