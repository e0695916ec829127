//! The request record: the unit of work stored in a [`crate::queue::PriorityQueue`].
//!
//! Mirrors the field list in the specification's data model — this crate
//! does not know how to execute a request, only how to carry, rank, and
//! route one.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// A dynamically-typed value for the `meta` map.
///
/// `meta` carries both well-known keys (`appid`, `crawlid`, ...) and
/// arbitrary caller-defined ones, so it can't be a fixed struct. This is
/// the typed wrapper around that dynamism, with conversion helpers for the
/// well-known keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<MetaValue>),
    Map(HashMap<String, MetaValue>),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Integer(i) => Some(*i),
            MetaValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, MetaValue>> {
        match self {
            MetaValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::String(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::String(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Integer(i)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

/// The `cookie` field is polymorphic in the source protocol: either a
/// mapping of name to value, or a raw `Set-Cookie`-style string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CookieValue {
    Map(HashMap<String, String>),
    Raw(String),
}

static COOKIE_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^=;]+)=([^;]+);?\s?").expect("static regex is valid"));

/// Parse a `name=value; name2=value2;` cookie string into a mapping.
pub fn parse_cookie_string(raw: &str) -> HashMap<String, String> {
    COOKIE_PAIR
        .captures_iter(raw)
        .map(|c| (c[1].trim().to_string(), c[2].trim().to_string()))
        .collect()
}

impl CookieValue {
    /// Resolve to a name→value mapping regardless of which variant this is.
    pub fn to_map(&self) -> HashMap<String, String> {
        match self {
            CookieValue::Map(m) => m.clone(),
            CookieValue::Raw(s) => parse_cookie_string(s),
        }
    }
}

/// The request record stored in, and retrieved from, a priority queue.
///
/// Serialized with `serde_json` for storage as a sorted-set member — a
/// schema-free encoding that round-trips every field here losslessly,
/// including the dynamic `meta` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "body_as_base64")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    pub meta: HashMap<String, MetaValue>,
    #[serde(default)]
    pub encoding: Option<String>,
    pub priority: i64,
    #[serde(default)]
    pub dont_filter: bool,
    #[serde(default)]
    pub callback: Option<String>,
    #[serde(default)]
    pub errback: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// `serde_json` can't represent arbitrary bytes directly; store them as
/// base64 so the record still round-trips through a single JSON blob.
mod body_as_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

impl RequestRecord {
    /// Typed accessor: `meta.appid`.
    pub fn appid(&self) -> Option<&str> {
        self.meta.get("appid").and_then(MetaValue::as_str)
    }

    /// Typed accessor: `meta.crawlid`.
    pub fn crawlid(&self) -> Option<&str> {
        self.meta.get("crawlid").and_then(MetaValue::as_str)
    }

    /// Typed accessor: `meta.spiderid`.
    pub fn spiderid(&self) -> Option<&str> {
        self.meta.get("spiderid").and_then(MetaValue::as_str)
    }

    /// Typed accessor: `meta.expires` (unix seconds, 0 = never).
    pub fn expires(&self) -> i64 {
        self.meta.get("expires").and_then(MetaValue::as_i64).unwrap_or(0)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
