use anyhow::Context;
use redis::AsyncCommands;
use tracing_subscriber::EnvFilter;

use crawl_scheduler::cli::{Cli, Command};
use crawl_scheduler::public_ip::HttpPublicIpProvider;
use crawl_scheduler::request::RequestRecord;
use crawl_scheduler::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::load();
    let settings = cli.settings;

    let client = redis::Client::open(settings.redis_url()).context("invalid redis URL")?;
    let conn = redis::aio::ConnectionManager::new(client.clone())
        .await
        .context("failed to connect to redis")?;

    match cli.command {
        Command::Run { spider } => run(conn, client, &settings, spider).await,
        Command::Enqueue {
            spider,
            url,
            priority,
            method,
        } => enqueue(conn, &settings, spider, url, priority, method).await,
        Command::Stats { spider } => stats(conn, spider).await,
    }
}

async fn run(
    conn: redis::aio::ConnectionManager,
    client: redis::Client,
    settings: &crawl_scheduler::config::Settings,
    spider: String,
) -> anyhow::Result<()> {
    let ip_provider = Box::new(HttpPublicIpProvider::new(settings.public_ip_url.clone()));
    let mut scheduler = Scheduler::new(conn, client, ip_provider, settings.to_scheduler_config());

    scheduler
        .open(&spider)
        .await
        .context("failed to open scheduler")?;

    tracing::info!(%spider, "scheduler running, press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            request = scheduler.next_request() => {
                match request {
                    Ok(Some(req)) => tracing::info!(url = %req.url, priority = req.priority, "dequeued request"),
                    Ok(None) => tokio::time::sleep(std::time::Duration::from_millis(200)).await,
                    Err(e) => {
                        tracing::error!(error = %e, "next_request failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    scheduler.close("interrupted").await.context("failed to close scheduler cleanly")?;
    Ok(())
}

async fn enqueue(
    conn: redis::aio::ConnectionManager,
    settings: &crawl_scheduler::config::Settings,
    spider: String,
    url: String,
    priority: i64,
    method: String,
) -> anyhow::Result<()> {
    let ip_provider = Box::new(HttpPublicIpProvider::new(settings.public_ip_url.clone()));
    let mut scheduler = Scheduler::new(
        conn,
        redis::Client::open(settings.redis_url())?,
        ip_provider,
        settings.to_scheduler_config(),
    );
    scheduler.open(&spider).await.context("failed to open scheduler")?;

    let record = RequestRecord {
        url,
        method,
        headers: Default::default(),
        body: Vec::new(),
        cookies: Default::default(),
        meta: Default::default(),
        encoding: None,
        priority,
        dont_filter: false,
        callback: None,
        errback: None,
    };

    scheduler
        .enqueue_request(record)
        .await
        .context("failed to enqueue request")?;

    tracing::info!(%spider, "request enqueued");
    Ok(())
}

async fn stats(conn: redis::aio::ConnectionManager, spider: String) -> anyhow::Result<()> {
    let pattern = format!("{}:*:queue", spider);
    let mut conn = conn;
    let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;

    let mut keys = Vec::new();
    while let Some(key) = futures_util::StreamExt::next(&mut iter).await {
        keys.push(key);
    }
    drop(iter);

    for key in keys {
        let depth: u64 = conn.zcard(&key).await?;
        println!("{key}\t{depth}");
    }

    Ok(())
}
