//! Crawl workers
//!
//! The two per-URL state machines ([`fetch::crawler`] and
//! [`render::loader`]) plus the [`CrawlContext`] that wires every
//! shared component together. Workers only communicate through the
//! frontier; the context itself is immutable once built.

pub mod fetch;
pub mod render;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::Config;
use crate::error::{CrawlError, Result};
use crate::filters::FilterGates;
use crate::link::Link;
use crate::frontier::memory::MemoryFrontier;
use crate::frontier::redis::RedisFrontier;
use crate::frontier::FrontierStore;
use crate::robots::RobotsManager;
use crate::sites::SiteRegistry;
use crate::storage::Storage;
use crate::submit::Submitter;
use crate::transport::TransportRegistry;

/// Liveness floor for redis per-link locks: a crashed worker frees its
/// hash after this long at the latest.
const REDIS_LOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything a worker needs, built once at startup.
pub struct CrawlContext {
    pub config: Config,
    pub frontier: Arc<dyn FrontierStore>,
    pub gates: FilterGates,
    pub robots: RobotsManager,
    pub transports: TransportRegistry,
    pub sites: SiteRegistry,
    pub storage: Arc<Storage>,
    pub submitter: Submitter,
    shutdown: AtomicBool,
    /// Wakes sleeping schedulers when shutdown is requested.
    pub(crate) wake: Notify,
}

impl CrawlContext {
    /// Build the context, selecting the frontier backend from the
    /// configuration (`REDIS_URL` set ⇒ redis, else in-process).
    pub async fn build(config: Config, sites: SiteRegistry) -> Result<Arc<Self>> {
        let frontier: Arc<dyn FrontierStore> = match &config.frontier.redis_url {
            Some(url) => Arc::new(
                RedisFrontier::connect(url, REDIS_LOCK_TTL, config.frontier.bulk_size).await?,
            ),
            None => Arc::new(MemoryFrontier::new()),
        };
        Self::with_frontier(config, sites, frontier)
    }

    /// Build the context around an existing frontier. Used by tests and
    /// by deployments that construct their own backend.
    pub fn with_frontier(
        config: Config,
        sites: SiteRegistry,
        frontier: Arc<dyn FrontierStore>,
    ) -> Result<Arc<Self>> {
        let storage = Arc::new(Storage::new(&config.storage.path_data)?);
        let gates = FilterGates::new(&config.filters);
        let robots = RobotsManager::new(
            &config.user_agent,
            config.cache.time_cache(),
            config.scheduler.force,
        );
        let transports = TransportRegistry::new(&config)?;
        let submitter = Submitter::new(
            config.submit.clone(),
            Arc::clone(&storage),
            &config.user_agent,
        );

        Ok(Arc::new(Self {
            config,
            frontier,
            gates,
            robots,
            transports,
            sites,
            storage,
            submitter,
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        }))
    }

    /// Request cooperative shutdown: workers stop between steps and
    /// schedulers stop accepting rounds.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Evaluate the proxy and hostname gates for a popped link. Denial is
/// [`CrawlError::Filtered`]; the worker drops the link silently.
pub(crate) fn filter_gate(gates: &FilterGates, link: &Link) -> Result<()> {
    if !gates.allow_proxy(&link.proxy) {
        tracing::warn!("Ignored proxy type from {} ({})", link, link.proxy);
        return Err(CrawlError::Filtered);
    }
    if !gates.allow_host(&link.host) {
        tracing::warn!("Ignored hostname from {}", link);
        return Err(CrawlError::Filtered);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Context over a fresh in-memory frontier and a temp data dir.
    /// The TempDir must outlive the context.
    pub fn test_context(mut config: Config) -> (tempfile::TempDir, Arc<CrawlContext>) {
        let dir = tempfile::tempdir().unwrap();
        config.storage.path_data = dir.path().to_path_buf();
        let frontier: Arc<dyn FrontierStore> = Arc::new(MemoryFrontier::new());
        let ctx = CrawlContext::with_frontier(config, SiteRegistry::new(), frontier).unwrap();
        (dir, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::test_context;
    use super::*;
    use crate::config::{Config, FilterConfig};

    #[test]
    fn context_builds_with_defaults() {
        let (_dir, ctx) = test_context(Config::default());
        assert!(!ctx.is_shutdown());
        ctx.shutdown();
        assert!(ctx.is_shutdown());
    }

    #[test]
    fn filter_gate_classifies_denial() {
        let gates = FilterGates::new(&FilterConfig {
            proxy_black_list: vec!["tor".to_string()],
            ..FilterConfig::default()
        });
        let onion = Link::parse("http://abc.onion/").unwrap();
        assert!(matches!(
            filter_gate(&gates, &onion),
            Err(CrawlError::Filtered)
        ));
        let clearnet = Link::parse("https://example.com/").unwrap();
        assert!(filter_gate(&gates, &clearnet).is_ok());
    }
}
