//! Live reconfiguration: watches a Redis key for throttle overrides and
//! notifies the scheduler when it changes.
//!
//! The specification describes "a path in a coordination service"
//! (Zookeeper, in the crawler this was distilled from). No Zookeeper or
//! etcd client exists anywhere in this crate's ecosystem, and Redis is
//! already the fleet's shared substrate for queues and throttles, so the
//! watched path is modeled as a single Redis string key, observed two ways:
//! a poll loop (the fallback that always eventually notices a change) and a
//! Pub/Sub subscription on a sibling channel (near-immediate delivery when
//! the publisher remembers to `PUBLISH` after `SET`). Either source pushes
//! a [`ConfigEvent`] onto the same channel.
//!
//! Modeled as a channel of events rather than raw callbacks — the same
//! `tokio::sync::mpsc` idiom the crawler uses to hand work between its
//! pipeline stages (`work_queue/runner.rs`).

use std::time::Duration;

use futures_util::StreamExt as _;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::domain_config::{parse_config_document, DomainConfig};

/// What the watcher delivers to its subscriber.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A new, successfully parsed configuration document. Replaces the
    /// previous override map wholesale.
    Applied(std::collections::HashMap<String, DomainConfig>),
    /// The config source was unreachable, or the payload was empty/
    /// whitespace-only (the "wiped" signal) — either way, overrides should
    /// revert to scheduler defaults.
    Wiped,
    /// A transport-level error reaching the config source. Overrides
    /// should revert to scheduler defaults, same as `Wiped`.
    Error(String),
}

/// Background watcher over a single Redis key holding the live config
/// document, plus a Pub/Sub channel used to wake the poll loop early.
pub struct ConfigWatcher {
    handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Spawn the watcher. `key` is `{assign_path}{id}` per spec.md §6;
    /// `channel` is the Pub/Sub channel publishers should notify on after
    /// writing `key`. Returns the watcher (drop or call
    /// [`ConfigWatcher::stop`] to end it) and the receiving end of its
    /// event stream.
    pub fn spawn(
        conn: ConnectionManager,
        pubsub_client: redis::Client,
        key: String,
        channel: String,
        poll_interval: Duration,
    ) -> (Self, mpsc::Receiver<ConfigEvent>) {
        let (tx, rx) = mpsc::channel(16);

        let handle = tokio::spawn(async move {
            run(conn, pubsub_client, key, channel, poll_interval, tx).await;
        });

        (Self { handle }, rx)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(
    conn: ConnectionManager,
    pubsub_client: redis::Client,
    key: String,
    channel: String,
    poll_interval: Duration,
    tx: mpsc::Sender<ConfigEvent>,
) {
    let mut pubsub_stream = match pubsub_client.get_async_pubsub().await {
        Ok(mut pubsub) => {
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!(error = %e, %channel, "failed to subscribe to config change channel");
            }
            Some(pubsub)
        }
        Err(e) => {
            warn!(error = %e, "failed to open pubsub connection for config watcher");
            None
        }
    };

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Emit an initial snapshot immediately so the scheduler doesn't run
    // one full `poll_interval` on bare defaults before its first refresh.
    fetch_and_emit(&conn, &key, &tx).await;

    loop {
        let woke_on_pubsub = match pubsub_stream.as_mut() {
            Some(pubsub) => {
                tokio::select! {
                    _ = ticker.tick() => false,
                    msg = pubsub.on_message().next() => {
                        if msg.is_some() {
                            debug!(%channel, "config change notification received");
                        }
                        true
                    }
                }
            }
            None => {
                ticker.tick().await;
                false
            }
        };

        let _ = woke_on_pubsub;
        fetch_and_emit(&conn, &key, &tx).await;
    }
}

async fn fetch_and_emit(conn: &ConnectionManager, key: &str, tx: &mpsc::Sender<ConfigEvent>) {
    let mut conn = conn.clone();
    let payload: Result<Option<String>, redis::RedisError> = conn.get(key).await;

    let event = match payload {
        Ok(Some(payload)) if !payload.trim().is_empty() => match parse_config_document(&payload) {
            Ok(parsed) => ConfigEvent::Applied(parsed),
            Err(e) => {
                error!(error = %e, %key, "malformed config document, ignoring");
                return;
            }
        },
        Ok(_) => ConfigEvent::Wiped,
        Err(e) => {
            error!(error = %e, %key, "config source unreachable");
            ConfigEvent::Error(e.to_string())
        }
    };

    if tx.send(event).await.is_err() {
        debug!("config watcher receiver dropped, no one listening");
    }
}
