//! darkmap CLI
//!
//! One process drives one pool: `-t crawler` fetches, `-t loader`
//! renders. A deployment runs both against the same frontier backend.
//!
//! Exit codes: 0 on normal termination (including a hook break),
//! 1 on configuration errors, 2 when the frontier store is down.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use darkmap::crawl::CrawlContext;
use darkmap::error::CrawlError;
use darkmap::frontier::Queue;
use darkmap::link::Link;
use darkmap::scheduler::{install_signal_handlers, PoolKind, Scheduler};
use darkmap::sites::SiteRegistry;
use darkmap::Config;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WorkerType {
    /// Fetch pool worker (plain HTTP).
    Crawler,
    /// Render pool worker (headless browser).
    Loader,
}

#[derive(Parser)]
#[command(name = "darkmap")]
#[command(about = "the darkweb crawling swiss army knife")]
#[command(version)]
struct Cli {
    /// Type of worker process
    #[arg(short = 't', long = "type", value_enum)]
    worker: WorkerType,

    /// Read seed links from file (may repeat; `#` comments ignored)
    #[arg(short = 'f', long = "file")]
    file: Vec<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Seed links to crawl
    link: Vec<String>,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();
    let config = Config::from_env();

    let log_level = match cli.verbose {
        0 if !config.scheduler.verbose => Level::INFO,
        0 | 1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("darkmap: failed to initialise logging: {}", e);
        return 1;
    }

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return 1;
    }

    let seeds = match collect_seeds(&cli) {
        Ok(seeds) => seeds,
        Err(e) => {
            tracing::error!("Failed to read seed file: {}", e);
            return 1;
        }
    };

    let ctx = match CrawlContext::build(config, SiteRegistry::new()).await {
        Ok(ctx) => ctx,
        Err(e @ CrawlError::StoreUnavailable(_)) => {
            tracing::error!("{}", e);
            return 2;
        }
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            return 1;
        }
    };

    // seed the fetch queue before the round loop starts
    let mut parsed = Vec::new();
    for raw in &seeds {
        match Link::parse(raw) {
            Ok(link) => parsed.push(link),
            Err(e) => {
                tracing::warn!("Ignoring seed: {}", e);
                let _ = ctx.storage.sink_url("invalid", raw);
            }
        }
    }
    if !parsed.is_empty() {
        info!("Seeding {} links", parsed.len());
        if let Err(e) = ctx.frontier.add_many(Queue::Fetch, &parsed).await {
            tracing::error!("{}", e);
            return 2;
        }
    }

    install_signal_handlers(Arc::clone(&ctx));

    let kind = match cli.worker {
        WorkerType::Crawler => PoolKind::Crawler,
        WorkerType::Loader => PoolKind::Loader,
    };

    info!("Starting darkmap {} process", kind.as_str());
    let scheduler = Scheduler::new(Arc::clone(&ctx));
    match scheduler.run(kind).await {
        Ok(()) => {
            info!("Gracefully exiting");
            0
        }
        Err(CrawlError::StoreUnavailable(e)) => {
            tracing::error!("Frontier store unavailable: {}", e);
            2
        }
        Err(e) => {
            tracing::error!("{}", e);
            1
        }
    }
}

/// Positional links plus the contents of every `-f` file, with blank
/// lines and `#` comments skipped.
fn collect_seeds(cli: &Cli) -> std::io::Result<Vec<String>> {
    let mut seeds: Vec<String> = cli
        .link
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    for path in &cli.file {
        let content = std::fs::read_to_string(path)?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            seeds.push(line.to_string());
        }
    }
    Ok(seeds)
}
