//! Scheduler
//!
//! Round loop for one worker pool: pop a capped batch, dispatch it to
//! workers (parallel under a semaphore, or sequential in single-worker
//! mode), run the inter-round hooks, sleep when the queue is empty and
//! exit once drained in reboot mode. Shutdown is cooperative: a signal
//! flips the context flag, sleeping loops wake immediately and in-flight
//! links finish their current state machine.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::crawl::{fetch, render, CrawlContext};
use crate::error::{CrawlError, Result};
use crate::frontier::Queue;
use crate::link::Link;

/// Which pool this scheduler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Fetch pool (plain HTTP).
    Crawler,
    /// Render pool (headless browser).
    Loader,
}

impl PoolKind {
    pub fn queue(&self) -> Queue {
        match self {
            Self::Crawler => Queue::Fetch,
            Self::Loader => Queue::Render,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawler => "crawler",
            Self::Loader => "loader",
        }
    }
}

/// Inter-round callback. Returning [`CrawlError::WorkerBreak`] stops
/// the scheduler after the current round completes.
pub trait RoundHook: Send + Sync {
    fn after_round(&self, kind: PoolKind, processed: &[Link]) -> Result<()>;
}

/// Attempts against an unavailable frontier before giving up.
const STORE_ATTEMPTS: u32 = 3;

/// Counters accumulated across rounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    /// Rounds that dispatched at least one link.
    pub rounds: u64,
    /// Links handed to workers.
    pub links_processed: u64,
    /// Rounds that found the queue empty.
    pub empty_rounds: u64,
}

/// Drives one worker pool against the shared frontier.
pub struct Scheduler {
    ctx: Arc<CrawlContext>,
    hooks: Vec<Arc<dyn RoundHook>>,
    stats: Mutex<SchedulerStats>,
}

impl Scheduler {
    pub fn new(ctx: Arc<CrawlContext>) -> Self {
        Self {
            ctx,
            hooks: Vec::new(),
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    /// Snapshot of the round counters.
    pub fn stats(&self) -> SchedulerStats {
        *self.stats.lock()
    }

    /// Register an inter-round hook. Startup wiring only.
    pub fn register_hook(&mut self, hook: Arc<dyn RoundHook>) {
        self.hooks.push(hook);
    }

    /// Run the round loop until shutdown, drain (reboot mode) or a
    /// hook break. Fails only when the frontier store stays down.
    pub async fn run(&self, kind: PoolKind) -> Result<()> {
        let queue = kind.queue();
        let config = &self.ctx.config.scheduler;
        tracing::info!(
            "Starting {} pool ({} workers, {})",
            kind.as_str(),
            config.cpu,
            if config.parallel() { "parallel" } else { "single" },
        );

        loop {
            if self.ctx.is_shutdown() {
                break;
            }

            let links = self
                .pop_with_retry(queue, self.ctx.config.frontier.max_pool)
                .await?;

            if links.is_empty() {
                self.stats.lock().empty_rounds += 1;
                if config.reboot && self.both_queues_empty().await? {
                    tracing::info!("Reboot mode: queues drained, exiting");
                    break;
                }
                // sleep until the next round, waking early on shutdown
                tokio::select! {
                    _ = self.ctx.wake.notified() => {}
                    _ = tokio::time::sleep(config.wait()) => {}
                }
                continue;
            }

            tracing::debug!("[{}] Round of {} links", kind.as_str(), links.len());
            {
                let mut stats = self.stats.lock();
                stats.rounds += 1;
                stats.links_processed += links.len() as u64;
            }
            self.dispatch(kind, &links).await?;

            let mut stop = false;
            for hook in &self.hooks {
                match hook.after_round(kind, &links) {
                    Ok(()) => {}
                    Err(CrawlError::WorkerBreak) => {
                        tracing::info!("Round hook requested termination");
                        stop = true;
                    }
                    Err(e) => tracing::error!("Round hook failed: {}", e),
                }
            }
            if stop {
                break;
            }
        }

        let stats = self.stats();
        tracing::info!(
            "{} pool stopped after {} rounds ({} links)",
            kind.as_str(),
            stats.rounds,
            stats.links_processed
        );
        Ok(())
    }

    /// Dispatch one round. In parallel mode every link becomes a task
    /// gated by a `DARC_CPU`-permit semaphore; single mode processes the
    /// batch in order.
    async fn dispatch(&self, kind: PoolKind, links: &[Link]) -> Result<()> {
        if !self.ctx.config.scheduler.parallel() {
            for link in links {
                run_worker(&self.ctx, kind, link).await?;
            }
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.scheduler.cpu.max(1)));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for link in links.iter().cloned() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let ctx = Arc::clone(&self.ctx);
            tasks.spawn(async move {
                let _permit = permit;
                run_worker(&ctx, kind, &link).await
            });
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => fatal = Some(e),
                Err(e) => tracing::error!("Worker task panicked: {}", e),
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn pop_with_retry(&self, queue: Queue, max: usize) -> Result<Vec<Link>> {
        let mut attempt = 0;
        loop {
            match self.ctx.frontier.pop(queue, max).await {
                Ok(links) => return Ok(links),
                Err(e @ CrawlError::StoreUnavailable(_)) => {
                    attempt += 1;
                    if attempt >= STORE_ATTEMPTS {
                        return Err(e);
                    }
                    tracing::warn!(
                        "Frontier store unavailable (attempt {}/{}): {}",
                        attempt,
                        STORE_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(self.ctx.config.frontier.retry_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reboot-mode drain check: nothing poppable in either queue.
    /// Entries still in a backoff window stay behind in the store for
    /// the next run.
    async fn both_queues_empty(&self) -> Result<bool> {
        Ok(self.ctx.frontier.ready_len(Queue::Fetch).await? == 0
            && self.ctx.frontier.ready_len(Queue::Render).await? == 0)
    }
}

async fn run_worker(ctx: &CrawlContext, kind: PoolKind, link: &Link) -> Result<()> {
    match kind {
        PoolKind::Crawler => fetch::crawler(ctx, link).await,
        PoolKind::Loader => render::loader(ctx, link).await,
    }
}

/// Flip the context shutdown flag on SIGINT or SIGTERM.
pub fn install_signal_handlers(ctx: Arc<CrawlContext>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    tracing::error!("Cannot install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    ctx.shutdown();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Shutdown signal received, finishing in-flight work");
        ctx.shutdown();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FilterConfig};
    use crate::crawl::testutil::test_context;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reboot_config() -> Config {
        let mut config = Config::default();
        config.scheduler.reboot = true;
        config.scheduler.wait_secs = Some(0.05);
        // deny everything so rounds never hit the network
        config.filters = FilterConfig {
            proxy_fallback: true,
            ..FilterConfig::default()
        };
        config
    }

    #[tokio::test]
    async fn reboot_mode_exits_on_empty_queues() {
        let (_dir, ctx) = test_context(reboot_config());
        let scheduler = Scheduler::new(Arc::clone(&ctx));
        scheduler.run(PoolKind::Crawler).await.unwrap();
    }

    #[tokio::test]
    async fn reboot_mode_drains_queue_first() {
        let (_dir, ctx) = test_context(reboot_config());
        let links = vec![
            Link::parse("https://a.example/").unwrap(),
            Link::parse("https://b.example/").unwrap(),
        ];
        ctx.frontier.add_many(Queue::Fetch, &links).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&ctx));
        scheduler.run(PoolKind::Crawler).await.unwrap();

        // gate-denied links were dropped, not left behind
        assert_eq!(ctx.frontier.queue_len(Queue::Fetch).await.unwrap(), 0);
    }

    struct BreakAfterOne {
        rounds: AtomicUsize,
    }

    impl RoundHook for BreakAfterOne {
        fn after_round(&self, _kind: PoolKind, processed: &[Link]) -> crate::error::Result<()> {
            assert!(!processed.is_empty());
            self.rounds.fetch_add(1, Ordering::SeqCst);
            Err(CrawlError::WorkerBreak)
        }
    }

    #[tokio::test]
    async fn worker_break_stops_after_round() {
        let mut config = reboot_config();
        config.scheduler.reboot = false;
        let (_dir, ctx) = test_context(config);

        ctx.frontier
            .add_many(Queue::Fetch, &[Link::parse("https://a.example/").unwrap()])
            .await
            .unwrap();

        let hook = Arc::new(BreakAfterOne {
            rounds: AtomicUsize::new(0),
        });
        let mut scheduler = Scheduler::new(Arc::clone(&ctx));
        scheduler.register_hook(hook.clone());

        scheduler.run(PoolKind::Crawler).await.unwrap();
        assert_eq!(hook.rounds.load(Ordering::SeqCst), 1);
        let stats = scheduler.stats();
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.links_processed, 1);
    }

    #[tokio::test]
    async fn shutdown_wakes_sleeping_scheduler() {
        let mut config = Config::default();
        config.scheduler.wait_secs = Some(30.0);
        config.filters.proxy_fallback = true;
        let (_dir, ctx) = test_context(config);

        let scheduler = Scheduler::new(Arc::clone(&ctx));
        let handle = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                ctx.shutdown();
            })
        };

        // returns promptly despite the 30s empty-queue sleep
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            scheduler.run(PoolKind::Loader),
        )
        .await
        .expect("scheduler must wake on shutdown")
        .unwrap();
        handle.await.unwrap();
    }
}
