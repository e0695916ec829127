//! Per-domain throttle overrides parsed from the live configuration
//! document.

use std::collections::HashMap;

use serde::Deserialize;

/// A single domain's override, as accepted from the config document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DomainConfig {
    pub window: f64,
    pub hits: i64,
    #[serde(default)]
    pub scale: Option<f64>,
}

impl DomainConfig {
    /// Effective hit budget after applying `scale`, clamped to `[0, 1]`.
    ///
    /// `effective_hits(hits, scale)` is `hits` when `scale >= 1`, `0` when
    /// `scale <= 0`, and `floor(hits * scale)` in between — spec.md §8's
    /// Scale Clamp law.
    pub fn effective_hits(&self) -> i64 {
        match self.scale {
            Some(scale) => effective_hits(self.hits, scale),
            None => self.hits,
        }
    }
}

/// Free function form, for use before a `DomainConfig` is constructed
/// (e.g. directly off a raw config entry).
pub fn effective_hits(hits: i64, scale: f64) -> i64 {
    let clamped = clamp_scale(scale);
    ((hits as f64) * clamped).floor() as i64
}

fn clamp_scale(scale: f64) -> f64 {
    if scale >= 1.0 {
        1.0
    } else if scale <= 0.0 {
        0.0
    } else {
        scale
    }
}

/// Raw shape of an entry in the config document's `domains` map. Kept
/// separate from `DomainConfig` so entries missing `window` or `hits` can
/// be detected and dropped (they deserialize as `RawDomainEntry` but fail
/// to convert), rather than failing the whole document's parse.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDomainEntry {
    pub window: Option<f64>,
    pub hits: Option<i64>,
    pub scale: Option<f64>,
}

impl RawDomainEntry {
    fn into_domain_config(self) -> Option<DomainConfig> {
        Some(DomainConfig {
            window: self.window?,
            hits: self.hits?,
            scale: self.scale,
        })
    }
}

/// The top-level shape of the watched configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    domains: HashMap<String, RawDomainEntry>,
}

/// Parse a YAML configuration payload into a domain override map.
///
/// Entries without both `window` and `hits` are dropped silently.
/// Unrecognized top-level keys are ignored (`serde(default)` plus no
/// `deny_unknown_fields`). An empty or whitespace-only payload is the
/// "wiped" signal and returns an empty map, same as a payload with no
/// `domains` key.
pub fn parse_config_document(payload: &str) -> Result<HashMap<String, DomainConfig>, serde_yaml::Error> {
    if payload.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let doc: ConfigDocument = serde_yaml::from_str(payload)?;
    Ok(doc
        .domains
        .into_iter()
        .filter_map(|(domain, entry)| entry.into_domain_config().map(|c| (domain, c)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_clamp_law() {
        assert_eq!(effective_hits(10, 1.5), 10);
        assert_eq!(effective_hits(10, 0.0), 0);
        assert_eq!(effective_hits(10, -3.0), 0);
        assert_eq!(effective_hits(10, 0.3), 3);
    }

    #[test]
    fn parses_domains_with_window_and_hits() {
        let doc = r#"
domains:
  example.com: { window: 60.0, hits: 20 }
  news.site.org: { window: 30.0, hits: 5, scale: 0.5 }
"#;
        let parsed = parse_config_document(doc).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["example.com"].hits, 20);
        assert_eq!(parsed["news.site.org"].effective_hits(), 2);
    }

    #[test]
    fn drops_entries_missing_required_fields() {
        let doc = r#"
domains:
  good.com: { window: 10.0, hits: 5 }
  bad.com: { window: 10.0 }
  also_bad.com: { hits: 5 }
"#;
        let parsed = parse_config_document(doc).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains_key("good.com"));
    }

    #[test]
    fn missing_domains_key_yields_empty_map() {
        let parsed = parse_config_document("other: stuff").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn empty_payload_is_the_wiped_signal() {
        assert!(parse_config_document("").unwrap().is_empty());
        assert!(parse_config_document("   \n  ").unwrap().is_empty());
    }
}
