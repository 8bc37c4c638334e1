//! Per-request context built up across `open`, `set_request_header` and `send`.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::HashMap;

/// Request headers.
///
/// Names are stored case-sensitively in insertion order; a repeated name has
/// its values joined with a comma. Lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders(Vec<(String, String)>);

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, joining it onto an existing value of the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, current)) => {
                current.push(',');
                current.push_str(value);
            }
            None => self.0.push((name.to_string(), value.to_string())),
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for RequestHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Everything known about one request. Passed to function templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
    pub headers: RequestHeaders,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Simulated delay computed at open time
    pub timeout_ms: u64,
    #[serde(rename = "async")]
    pub asynchronous: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    /// Parameters captured by a path template rule
    pub params: HashMap<String, String>,
}
