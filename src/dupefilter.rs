//! TTL-bounded dedup filter shared across workers.
//!
//! Backed by a Redis set of request fingerprints. This is a best-effort
//! filter over a bounded window, not an exactly-once guarantee — two
//! requests for the same URL more than `timeout` seconds apart are treated
//! as distinct.

use sha2::{Digest, Sha256};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::DupeFilterError;
use crate::request::RequestRecord;

/// A TTL-bounded set of request fingerprints, refreshed on every hit.
pub struct DupeFilter {
    conn: ConnectionManager,
    key: String,
    timeout_secs: u64,
}

impl DupeFilter {
    pub fn new(conn: ConnectionManager, key: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            conn,
            key: key.into(),
            timeout_secs,
        }
    }

    /// Deterministic fingerprint of the fields that make two requests
    /// "the same" for dedup purposes: method, canonicalized URL, body, and
    /// a fixed subset of headers relevant to content negotiation.
    ///
    /// Follows the crawler's own hash-then-hex-encode pattern
    /// (`repository/crawl.rs::check_config_changed`): `Sha256::new()`,
    /// `hasher.update(...)`, `hex::encode(hasher.finalize())`.
    pub fn fingerprint(record: &RequestRecord) -> String {
        const DEDUP_HEADERS: &[&str] = &["accept", "accept-language"];

        let mut hasher = Sha256::new();
        hasher.update(record.method.as_bytes());
        hasher.update(b"\0");
        hasher.update(canonicalize_url(&record.url).as_bytes());
        hasher.update(b"\0");
        hasher.update(&record.body);

        for name in DEDUP_HEADERS {
            if let Some(values) = record.headers.get(*name) {
                hasher.update(b"\0");
                hasher.update(name.as_bytes());
                for v in values {
                    hasher.update(b"\0");
                    hasher.update(v.as_bytes());
                }
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Returns `true` iff the fingerprint was already present; otherwise
    /// adds it and refreshes the set's TTL.
    pub async fn request_seen(&self, record: &RequestRecord) -> Result<bool, DupeFilterError> {
        let fingerprint = Self::fingerprint(record);
        let mut conn = self.conn.clone();

        let added: i64 = conn.sadd(&self.key, &fingerprint).await?;
        let _: () = conn.expire(&self.key, self.timeout_secs as i64).await?;

        // SADD returns 0 when the member already existed.
        Ok(added == 0)
    }

    pub async fn clear(&self) -> Result<(), DupeFilterError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(&self.key).await?;
        Ok(())
    }
}

/// Canonicalize a URL for fingerprinting purposes: lowercase the scheme and
/// host, drop a trailing `/` on a bare-path URL. Deliberately conservative
/// — it does not reorder query parameters or strip fragments, since the
/// spec only requires a *deterministic* hash, not maximal collision
/// between cosmetically different URLs.
fn canonicalize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.as_str().to_string(),
        Err(_) => url.to_string(),
    }
}
