//! Site hook registry
//!
//! Per-host customisation of fetch and render behaviour. A hook
//! receives the session or driver plus the link and returns the same
//! contract as the plain operations; it may instead fail with
//! [`CrawlError::LinkNoReturn`] to drop the URL from both queues.
//!
//! Hooks are registered before the scheduler starts; lookup is by exact
//! hostname with a default pair as fallback.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::browser::{RenderDriver, RenderedPage};
use crate::error::{CrawlError, Result};
use crate::link::Link;
use crate::transport::{FetchSession, Response};

/// Per-host fetch/render behaviour.
#[async_trait]
pub trait SiteHook: Send + Sync {
    /// Fetch the link through the given session.
    async fn fetch(&self, session: &FetchSession, link: &Link) -> Result<Response>;

    /// Render the link through the given driver.
    async fn render(&self, driver: &RenderDriver, link: &Link) -> Result<RenderedPage>;
}

/// Fallback behaviour: a plain GET and a plain load.
pub struct DefaultSite;

#[async_trait]
impl SiteHook for DefaultSite {
    async fn fetch(&self, session: &FetchSession, link: &Link) -> Result<Response> {
        session.get(&link.url).await
    }

    async fn render(&self, driver: &RenderDriver, link: &Link) -> Result<RenderedPage> {
        driver.load(&link.url).await
    }
}

/// A hook that unconditionally drops every link on its host. Useful
/// for hosts that must be onboarded (robots, sitemap) but never
/// crawled page by page.
pub struct NoReturnSite;

#[async_trait]
impl SiteHook for NoReturnSite {
    async fn fetch(&self, _session: &FetchSession, _link: &Link) -> Result<Response> {
        Err(CrawlError::LinkNoReturn { drop: true })
    }

    async fn render(&self, _driver: &RenderDriver, _link: &Link) -> Result<RenderedPage> {
        Err(CrawlError::LinkNoReturn { drop: true })
    }
}

/// A hook that holds every link on its host back without purging it:
/// workers re-enqueue the link for a later window. Useful while a host
/// needs manual preparation (credentials, captcha session) before it
/// can be crawled.
pub struct DeferSite;

#[async_trait]
impl SiteHook for DeferSite {
    async fn fetch(&self, _session: &FetchSession, _link: &Link) -> Result<Response> {
        Err(CrawlError::LinkNoReturn { drop: false })
    }

    async fn render(&self, _driver: &RenderDriver, _link: &Link) -> Result<RenderedPage> {
        Err(CrawlError::LinkNoReturn { drop: false })
    }
}

/// Hostname → hook mapping with a default pair.
pub struct SiteRegistry {
    hooks: HashMap<String, Arc<dyn SiteHook>>,
    default: Arc<dyn SiteHook>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
            default: Arc::new(DefaultSite),
        }
    }

    /// Register a hook for one hostname (case-insensitive). Intended
    /// for startup wiring; the registry is immutable once the
    /// scheduler holds it.
    pub fn register(&mut self, host: &str, hook: Arc<dyn SiteHook>) {
        self.hooks.insert(host.to_lowercase(), hook);
    }

    /// Hook for the link's host, or the default pair.
    pub fn get(&self, link: &Link) -> Arc<dyn SiteHook> {
        self.hooks
            .get(&link.host.to_lowercase())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_host_gets_default_hook() {
        let registry = SiteRegistry::new();
        let link = Link::parse("https://example.com/").unwrap();
        // the default hook is DefaultSite; we can only observe identity
        let hook = registry.get(&link);
        assert!(Arc::ptr_eq(&hook, &registry.get(&link)));
    }

    #[tokio::test]
    async fn built_in_hooks_signal_drop_and_defer() {
        let registry = crate::transport::TransportRegistry::new(&crate::config::Config::default())
            .unwrap();
        let session = registry.session(&crate::link::ProxyTag::Null);
        let link = Link::parse("https://example.com/").unwrap();

        let err = NoReturnSite.fetch(&session, &link).await.unwrap_err();
        assert!(matches!(err, CrawlError::LinkNoReturn { drop: true }));

        let err = DeferSite.fetch(&session, &link).await.unwrap_err();
        assert!(matches!(err, CrawlError::LinkNoReturn { drop: false }));
    }

    #[test]
    fn registered_host_lookup_is_case_insensitive() {
        let mut registry = SiteRegistry::new();
        let hook: Arc<dyn SiteHook> = Arc::new(NoReturnSite);
        registry.register("Example.COM", Arc::clone(&hook));

        let link = Link::parse("https://example.com/page").unwrap();
        assert!(Arc::ptr_eq(&registry.get(&link), &hook));

        let other = Link::parse("https://other.example.org/").unwrap();
        assert!(!Arc::ptr_eq(&registry.get(&other), &hook));
    }
}
