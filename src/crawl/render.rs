//! Render worker
//!
//! The per-URL render state machine: filter gates, per-link lock,
//! freshness window, a per-worker headless browser, the empty-page
//! sentinel, artifact persistence, submission and link extraction.

use std::time::SystemTime;

use crate::browser::RenderDriver;
use crate::config::EMPTY_PAGE;
use crate::error::{CrawlError, Result};
use crate::extract;
use crate::frontier::{is_fresh, Queue, VisitKind};
use crate::link::Link;
use crate::storage::Storage;

use super::CrawlContext;

/// Process one URL popped from the render queue.
pub async fn loader(ctx: &CrawlContext, link: &Link) -> Result<()> {
    tracing::info!("[LOADER] Loading {}", link);

    if ctx.is_shutdown() {
        return Ok(());
    }

    if let Err(CrawlError::Filtered) = super::filter_gate(&ctx.gates, link) {
        ctx.frontier.drop_link(Queue::Render, link).await?;
        return Ok(());
    }

    let backoff = ctx.config.cache.backoff();
    let token = match ctx
        .frontier
        .acquire_lock(link.hash, ctx.config.frontier.lock_timeout())
        .await
    {
        Ok(token) => token,
        Err(CrawlError::LockBusy) => {
            if ctx.is_shutdown() {
                ctx.frontier.drop_link(Queue::Render, link).await?;
            } else {
                ctx.frontier.requeue(Queue::Render, link, backoff).await?;
            }
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let outcome = process(ctx, link).await;
    ctx.frontier.release_lock(token).await?;

    // the error kind alone decides the recovery policy
    match outcome {
        Ok(()) => {
            tracing::info!("[LOADER] Loaded {}", link);
            Ok(())
        }
        Err(CrawlError::EmptyRender) => {
            tracing::error!("[LOADER] Empty page from {}", link);
            ctx.frontier.requeue(Queue::Render, link, backoff).await?;
            Ok(())
        }
        Err(e @ CrawlError::StoreUnavailable(_)) => Err(e),
        Err(e) => {
            tracing::error!("[LOADER] Error from {}: {}", link, e);
            ctx.frontier.requeue(Queue::Render, link, backoff).await?;
            Ok(())
        }
    }
}

async fn process(ctx: &CrawlContext, link: &Link) -> Result<()> {
    let backoff = ctx.config.cache.backoff();

    let last = ctx.frontier.last_visit(link.hash, VisitKind::Rendered).await?;
    if is_fresh(last, ctx.config.cache.time_cache(), SystemTime::now()) {
        tracing::debug!("[LOADER] Skipping fresh {}", link);
        return Ok(());
    }

    // drivers are per-worker instances; never shared across tasks
    let profile = ctx.transports.browser_profile(&link.proxy);
    let driver = match RenderDriver::launch(&profile, ctx.config.cache.se_wait()).await {
        Ok(driver) => driver,
        Err(e) => {
            tracing::warn!("[LOADER] Browser unavailable for {}: {}", link, e);
            ctx.frontier.requeue(Queue::Render, link, backoff).await?;
            return Ok(());
        }
    };

    let hook = ctx.sites.get(link);
    let result = hook.render(&driver, link).await;
    driver.close().await;

    let page = match result {
        Ok(page) => page,
        Err(CrawlError::LinkNoReturn { drop }) => {
            if drop {
                tracing::warn!("[LOADER] Removing from database: {}", link);
                ctx.frontier.drop_link(Queue::Fetch, link).await?;
                ctx.frontier.drop_link(Queue::Render, link).await?;
            } else {
                // the hook holds the link back for a later window
                tracing::warn!("[LOADER] Deferred by site hook: {}", link);
                ctx.frontier.requeue(Queue::Render, link, backoff).await?;
            }
            return Ok(());
        }
        Err(e) if e.is_retryable() || matches!(e, CrawlError::Browser(_)) => {
            tracing::warn!("[LOADER] Fail to load {}: {}", link, e);
            ctx.frontier.requeue(Queue::Render, link, backoff).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if page.html == EMPTY_PAGE {
        return Err(CrawlError::EmptyRender);
    }

    let ts = Storage::timestamp();
    ctx.storage.save_rendered(link, &page.html, &ts)?;
    if let Some(ref screenshot) = page.screenshot {
        ctx.storage.save_screenshot(link, screenshot, &ts)?;
    }

    ctx.submitter
        .submit_selenium(link, &page.html, page.screenshot.as_deref())
        .await;

    let mut found = extract::extract_links(link, &page.html);
    if ctx.config.scheduler.check {
        found = extract::check_links(found, &ctx.gates);
    }
    if ctx.config.scheduler.check_ng {
        found = extract::check_links_ng(found, &ctx.gates, &ctx.transports).await;
    }
    ctx.frontier.add_many(Queue::Fetch, &found).await?;

    ctx.frontier
        .record_visit(link.hash, VisitKind::Rendered, SystemTime::now())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FilterConfig};
    use crate::crawl::testutil::test_context;

    #[tokio::test]
    async fn denied_host_is_dropped_from_render_queue() {
        let (_dir, ctx) = test_context(Config {
            filters: FilterConfig {
                link_black_list: vec!["blocked".to_string()],
                ..FilterConfig::default()
            },
            ..Config::default()
        });
        let link = Link::parse("https://blocked.example.com/").unwrap();
        ctx.frontier.add_many(Queue::Render, &[link.clone()]).await.unwrap();

        loader(&ctx, &link).await.unwrap();
        assert_eq!(ctx.frontier.queue_len(Queue::Render).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fresh_render_short_circuits() {
        let (_dir, ctx) = test_context(Config::default());
        let link = Link::parse("https://example.com/").unwrap();

        ctx.frontier
            .record_visit(link.hash, VisitKind::Rendered, SystemTime::now())
            .await
            .unwrap();

        // no browser is launched; the call returns without touching the
        // render queue
        loader(&ctx, &link).await.unwrap();
        assert_eq!(ctx.frontier.queue_len(Queue::Render).await.unwrap(), 0);
    }

    #[test]
    fn sentinel_is_the_blank_document() {
        assert_eq!(EMPTY_PAGE, "<html><head></head><body></body></html>");
    }
}
