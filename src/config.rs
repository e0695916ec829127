//! Process-wide settings, loaded from the environment (optionally via a
//! `.env` file) at startup, following the crawler's own `clap::Parser` +
//! `dotenvy::dotenv()` configuration style (`src/main.rs`).

use std::time::Duration;

use clap::Args;

use crate::scheduler::SchedulerConfig;

/// Recognized environment keys, per spec.md §6. Flattened into [`crate::cli::Cli`]
/// so every subcommand shares one set of global settings.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    #[arg(long, env = "SCHEDULER_PERSIST", default_value_t = false)]
    pub scheduler_persist: bool,

    #[arg(long, env = "SCHEDULER_QUEUE_REFRESH", default_value_t = 10)]
    pub scheduler_queue_refresh: u64,

    #[arg(long, env = "QUEUE_HITS", default_value_t = 10)]
    pub queue_hits: i64,

    #[arg(long, env = "QUEUE_WINDOW", default_value_t = 60.0)]
    pub queue_window: f64,

    #[arg(long, env = "QUEUE_MODERATED", default_value_t = false)]
    pub queue_moderated: bool,

    #[arg(long, env = "DUPEFILTER_TIMEOUT", default_value_t = 600)]
    pub dupefilter_timeout: u64,

    #[arg(long, env = "SCHEDULER_IP_REFRESH", default_value_t = 60)]
    pub scheduler_ip_refresh: u64,

    #[arg(long, env = "SCHEDULER_TYPE_ENABLED", default_value_t = false)]
    pub scheduler_type_enabled: bool,

    #[arg(long, env = "SCHEDULER_IP_ENABLED", default_value_t = false)]
    pub scheduler_ip_enabled: bool,

    #[arg(long, env = "SCHEDULER_ITEM_RETRIES", default_value_t = 3)]
    pub scheduler_item_retries: u32,

    #[arg(long, env = "PUBLIC_IP_URL", default_value = "https://api.ipify.org")]
    pub public_ip_url: String,

    /// Legacy coordination-service hosts. Recognized and logged if set, but
    /// not connected to — this crate's coordination substrate is Redis (see
    /// `config_watcher.rs`), not Zookeeper.
    #[arg(long, env = "ZOOKEEPER_HOSTS")]
    pub zookeeper_hosts: Option<String>,

    #[arg(long, env = "ZOOKEEPER_ASSIGN_PATH", default_value = "/crawl-scheduler/config/")]
    pub zookeeper_assign_path: String,

    #[arg(long, env = "ZOOKEEPER_ID", default_value = "default")]
    pub zookeeper_id: String,

    /// Seconds between config-key polls, for the rare case the Pub/Sub
    /// notification on a config change is missed.
    #[arg(long, env = "SCHEDULER_CONFIG_POLL_INTERVAL", default_value_t = 15)]
    pub scheduler_config_poll_interval: u64,
}

impl Settings {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }

    /// Config watcher's target key: `{assign_path}{id}`.
    pub fn config_key(&self) -> String {
        format!("{}{}", self.zookeeper_assign_path, self.zookeeper_id)
    }

    pub fn config_channel(&self) -> String {
        format!("{}:changed", self.config_key())
    }

    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        if let Some(hosts) = &self.zookeeper_hosts {
            tracing::warn!(
                %hosts,
                "ZOOKEEPER_HOSTS is set but unused; this build coordinates config via Redis"
            );
        }

        SchedulerConfig {
            persist: self.scheduler_persist,
            queue_refresh: Duration::from_secs(self.scheduler_queue_refresh),
            ip_refresh: Duration::from_secs(self.scheduler_ip_refresh),
            item_retries: self.scheduler_item_retries,
            add_type: self.scheduler_type_enabled,
            add_ip: self.scheduler_ip_enabled,
            default_window: self.queue_window,
            default_hits: self.queue_hits,
            default_moderated: self.queue_moderated,
            dupefilter_timeout: self.dupefilter_timeout,
            config_key: self.config_key(),
            config_channel: self.config_channel(),
            config_poll_interval: Duration::from_secs(self.scheduler_config_poll_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_key_joins_path_and_id() {
        let settings = Settings {
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            scheduler_persist: false,
            scheduler_queue_refresh: 10,
            queue_hits: 10,
            queue_window: 60.0,
            queue_moderated: false,
            dupefilter_timeout: 600,
            scheduler_ip_refresh: 60,
            scheduler_type_enabled: false,
            scheduler_ip_enabled: false,
            scheduler_item_retries: 3,
            public_ip_url: "https://api.ipify.org".to_string(),
            zookeeper_hosts: None,
            zookeeper_assign_path: "/crawl-scheduler/config/".to_string(),
            zookeeper_id: "prod".to_string(),
            scheduler_config_poll_interval: 15,
        };
        assert_eq!(settings.config_key(), "/crawl-scheduler/config/prod");
    }
}
