//! Registered-domain (eTLD+1) extraction.
//!
//! Queue keys and throttle keys are both scoped by registered domain, not
//! by full hostname, so `news.example.co.uk` and `www.example.co.uk` share
//! one queue and one throttle counter. Extraction uses the public suffix
//! list via the `psl` crate, the same crate `kumomta` uses for its
//! `psl_domain`/`psl_suffix` Lua bindings (`crates/mod-string/src/lib.rs`).

use url::Url;

/// Extract the registered domain (domain + public suffix) from a URL.
///
/// Returns `None` if the URL can't be parsed or has no host (e.g.
/// `file://` URLs).
pub fn registered_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    registered_domain_of_host(host)
}

/// Extract the registered domain from a bare hostname.
pub fn registered_domain_of_host(host: &str) -> Option<String> {
    psl::domain_str(host).map(|d| d.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_domain() {
        assert_eq!(
            registered_domain("https://example.com/path?x=1"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn extracts_registered_domain_under_subdomain() {
        assert_eq!(
            registered_domain("https://news.example.co.uk/a/b"),
            Some("example.co.uk".to_string())
        );
    }

    #[test]
    fn returns_none_for_unparsable_url() {
        assert_eq!(registered_domain("not a url"), None);
    }
}
