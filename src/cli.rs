//! Command-line entry points, following the crawler's
//! `clap` derive-subcommand layout (`cli/commands.rs`).

use clap::{Parser, Subcommand};

use crate::config::Settings;

#[derive(Debug, Parser)]
#[command(name = "crawl-scheduler", about = "Distributed per-domain rate-limited request scheduler")]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler's fetch loop for a spider, printing each
    /// dequeued request until interrupted.
    Run {
        /// Identifies this spider's queues, dedup set, and blacklist.
        spider: String,
    },
    /// Enqueue a single request for a spider.
    Enqueue {
        spider: String,
        url: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long, default_value = "GET")]
        method: String,
    },
    /// Print per-domain queue depths for a spider.
    Stats {
        spider: String,
    },
}

impl Cli {
    pub fn load() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!(error = %e, "no .env file loaded");
        }
        Cli::parse()
    }
}
