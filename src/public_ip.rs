//! Public (egress) IP discovery, used to compose IP-scoped throttle keys.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// An external collaborator the scheduler needs but does not own the
/// implementation of — the specification names this an interface, so the
/// trait boundary IS that interface. This crate ships one concrete adapter
/// ([`HttpPublicIpProvider`]) so the scheduler is runnable standalone.
#[async_trait]
pub trait PublicIpProvider: Send + Sync {
    /// Returns the current egress IP, or `127.0.0.1` on any I/O error —
    /// callers never see a discovery failure as an error, only as a
    /// fallback value, per spec.md §7.4.
    async fn current_ip(&self) -> String;
}

/// Queries a configured HTTP endpoint expected to return the caller's
/// public IP as a bare text body.
pub struct HttpPublicIpProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpPublicIpProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client with a fixed timeout always builds");
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PublicIpProvider for HttpPublicIpProvider {
    async fn current_ip(&self) -> String {
        match fetch(&self.client, &self.url).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, url = %self.url, "public IP discovery failed, falling back to 127.0.0.1");
                "127.0.0.1".to_string()
            }
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<String, reqwest::Error> {
    let body = client.get(url).send().await?.text().await?;
    Ok(body.trim().to_string())
}
