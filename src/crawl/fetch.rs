//! Fetch worker
//!
//! The per-URL fetch state machine: filter gates, per-link lock,
//! freshness window, sink families, new-host onboarding, robots gate,
//! hooked fetch, artifact persistence, MIME gate, submission, link
//! extraction and the render-queue promotion.

use std::time::SystemTime;

use crate::error::{CrawlError, Result};
use crate::extract;
use crate::frontier::{is_fresh, HostFlags, Queue, VisitKind};
use crate::link::{Link, ProxyTag};
use crate::robots;
use crate::storage::Storage;
use crate::transport::FetchSession;

use super::CrawlContext;

/// Process one URL popped from the fetch queue.
///
/// Only frontier-store failures propagate; every crawl-level failure is
/// resolved internally by the error-policy table (sink, drop or
/// re-enqueue with backoff).
pub async fn crawler(ctx: &CrawlContext, link: &Link) -> Result<()> {
    tracing::info!("[CRAWLER] Requesting {}", link);

    if ctx.is_shutdown() {
        return Ok(());
    }

    if let Err(CrawlError::Filtered) = super::filter_gate(&ctx.gates, link) {
        ctx.frontier.drop_link(Queue::Fetch, link).await?;
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
            // another worker owns this hash; try again next window
            if ctx.is_shutdown() {
                ctx.frontier.drop_link(Queue::Fetch, link).await?;
            } else {
                ctx.frontier.requeue(Queue::Fetch, link, backoff).await?;
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
            tracing::info!("[CRAWLER] Requested {}", link);
            Ok(())
        }
        Err(CrawlError::RobotsDenied) => {
            tracing::warn!("[CRAWLER] Robots disallowed link from {}", link);
            ctx.frontier
                .record_visit(link.hash, VisitKind::Fetched, SystemTime::now())
                .await?;
            Ok(())
        }
        Err(CrawlError::HttpStatus(status)) => {
            tracing::error!("[CRAWLER] Failed on {} [{}]", link, status);
            ctx.frontier.requeue(Queue::Fetch, link, backoff).await?;
            ctx.frontier
                .record_visit(link.hash, VisitKind::Fetched, SystemTime::now())
                .await?;
            Ok(())
        }
        Err(e @ CrawlError::StoreUnavailable(_)) => Err(e),
        Err(e) => {
            tracing::error!("[CRAWLER] Error from {}: {}", link, e);
            ctx.frontier.requeue(Queue::Fetch, link, backoff).await?;
            Ok(())
        }
    }
}

async fn process(ctx: &CrawlContext, link: &Link) -> Result<()> {
    let backoff = ctx.config.cache.backoff();

    let last = ctx.frontier.last_visit(link.hash, VisitKind::Fetched).await?;
    if is_fresh(last, ctx.config.cache.time_cache(), SystemTime::now()) {
        tracing::debug!("[CRAWLER] Skipping fresh {}", link);
        return Ok(());
    }

    let ts = Storage::timestamp();

    // non-fetchable families go to their sink and leave both queues
    if !link.proxy.is_fetchable() {
        match &link.proxy {
            ProxyTag::Data => {
                ctx.storage.save_data_uri(link, &ts)?;
            }
            tag => {
                if let Some(family) = tag.sink_family() {
                    ctx.storage.sink_url(family, link.url.as_str())?;
                }
            }
        }
        ctx.storage.save_link(link)?;
        ctx.frontier.drop_link(Queue::Fetch, link).await?;
        return Ok(());
    }

    let session = ctx.transports.session(&link.proxy);

    if !ctx.frontier.has_host(&link.host).await? {
        onboard_host(ctx, link, &session).await?;
    }

    // gateway-backed families carry no robots.txt of their own
    let gateway = matches!(link.proxy, ProxyTag::Zeronet | ProxyTag::Freenet);
    if !ctx.config.scheduler.force && !gateway {
        let (_, raw) = ctx.robots.ensure(link, &session).await?;
        if let Some(text) = raw {
            let _ = ctx.storage.save_robots(link, &text);
        }
        if !ctx.robots.allowed(link) {
            return Err(CrawlError::RobotsDenied);
        }
    }

    let hook = ctx.sites.get(link);
    let response = match hook.fetch(&session, link).await {
        Ok(response) => response,
        Err(CrawlError::InvalidScheme(scheme)) => {
            tracing::warn!("[CRAWLER] No transport for {} ({})", link, scheme);
            ctx.storage.sink_url("invalid", link.url.as_str())?;
            ctx.storage.save_link(link)?;
            ctx.frontier.drop_link(Queue::Fetch, link).await?;
            return Ok(());
        }
        Err(CrawlError::LinkNoReturn { drop }) => {
            if drop {
                tracing::warn!("[CRAWLER] Removing from database: {}", link);
                ctx.frontier.drop_link(Queue::Fetch, link).await?;
                ctx.frontier.drop_link(Queue::Render, link).await?;
            } else {
                // the hook holds the link back for a later window
                tracing::warn!("[CRAWLER] Deferred by site hook: {}", link);
                ctx.frontier.requeue(Queue::Fetch, link, backoff).await?;
            }
            return Ok(());
        }
        Err(e) if e.is_retryable() => {
            tracing::warn!("[CRAWLER] Fail to crawl {}: {}", link, e);
            ctx.frontier.requeue(Queue::Fetch, link, backoff).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let is_html = response.is_html();
    ctx.storage
        .save_headers(link, &headers_payload(link, &response, &ts), &ts)?;
    ctx.storage.save_body(link, &response.body, is_html, &ts)?;

    let content_type = response.content_type();

    // I2P address books arrive as plain text; feed the subscribed
    // hosts straight back into the frontier
    if link.proxy == ProxyTag::I2p && matches!(content_type.as_str(), "text/plain" | "text/text") {
        let text = String::from_utf8_lossy(&response.body);
        let hosts = read_i2p_hosts(&text);
        if !hosts.is_empty() {
            tracing::info!("[CRAWLER] Subscribed {} hosts from {}", hosts.len(), link);
            ctx.frontier.add_many(Queue::Fetch, &hosts).await?;
        }
    }

    if !ctx.gates.allow_mime(&content_type) {
        tracing::warn!("[CRAWLER] Generic content type from {} ({})", link, content_type);
        ctx.frontier.drop_link(Queue::Fetch, link).await?;
        ctx.frontier
            .record_visit(link.hash, VisitKind::Fetched, SystemTime::now())
            .await?;
        return Ok(());
    }

    ctx.submitter.submit_requests(link, &response, is_html).await;

    if is_html {
        if response.body.is_empty() {
            tracing::error!("[CRAWLER] Empty response from {}", link);
            ctx.frontier.requeue(Queue::Fetch, link, backoff).await?;
            return Ok(());
        }
        let html = String::from_utf8_lossy(&response.body);
        let found = checked_links(ctx, extract::extract_links(link, &html)).await;
        ctx.frontier.add_many(Queue::Fetch, &found).await?;
    }

    if response.is_error_status() {
        return Err(CrawlError::HttpStatus(response.status));
    }
    ctx.frontier.add_many(Queue::Render, &[link.clone()]).await?;

    ctx.frontier
        .record_visit(link.hash, VisitKind::Fetched, SystemTime::now())
        .await?;
    Ok(())
}

/// First sight of a hostname: fetch robots and sitemaps, seed the
/// frontier with sitemap pages, mark the host and report it.
async fn onboard_host(ctx: &CrawlContext, link: &Link, session: &FetchSession) -> Result<()> {
    tracing::info!("[CRAWLER] New host {}", link.host);

    let mut partial = false;
    let mut raw: Option<String> = None;
    let mut sitemap_payload: Vec<(String, String)> = Vec::new();
    let mut robots_fetched = false;
    let mut sitemap_fetched = false;

    // gateway-backed families serve neither robots.txt nor sitemaps
    if !matches!(link.proxy, ProxyTag::Zeronet | ProxyTag::Freenet) {
        let (rules, fetched) = ctx.robots.ensure(link, session).await?;
        robots_fetched = true;
        raw = fetched;
        if let Some(ref text) = raw {
            if let Err(e) = ctx.storage.save_robots(link, text) {
                tracing::error!("[CRAWLER] Error saving robots of {}: {}", link.host, e);
                partial = true;
            }
        }

        let docs = robots::fetch_sitemaps(&rules, link, session).await;
        sitemap_fetched = !docs.is_empty();
        for doc in docs {
            match ctx.storage.save_sitemap(&doc.link, &doc.xml) {
                Ok(_) => sitemap_payload.push((
                    format!(
                        "{}/{}/{}/sitemap_{}.xml",
                        doc.link.proxy,
                        doc.link.scheme(),
                        doc.link.host,
                        doc.link.hash
                    ),
                    doc.xml,
                )),
                Err(e) => {
                    tracing::error!("[CRAWLER] Error saving sitemap of {}: {}", link.host, e);
                    partial = true;
                }
            }
            let pages = checked_links(ctx, doc.pages).await;
            ctx.frontier.add_many(Queue::Fetch, &pages).await?;
        }
    }

    ctx.frontier
        .mark_host(
            &link.host,
            HostFlags {
                robots_fetched,
                sitemap_fetched,
            },
        )
        .await?;

    ctx.submitter
        .submit_new_host(link, raw.as_deref(), &sitemap_payload, partial)
        .await;
    Ok(())
}

/// Apply the configured extraction checks before links re-enter the
/// frontier.
async fn checked_links(ctx: &CrawlContext, links: Vec<Link>) -> Vec<Link> {
    let mut links = if ctx.config.scheduler.check {
        extract::check_links(links, &ctx.gates)
    } else {
        links
    };
    if ctx.config.scheduler.check_ng {
        links = extract::check_links_ng(links, &ctx.gates, &ctx.transports).await;
    }
    links
}

/// Parse an I2P `hosts.txt` address book: `hostname=destination` lines,
/// one subscribed host per line.
fn read_i2p_hosts(text: &str) -> Vec<Link> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter_map(|(host, _)| Link::parse(&format!("http://{}/", host.trim())).ok())
        .collect()
}

/// Headers artifact: link identity plus the response envelope.
fn headers_payload(link: &Link, response: &crate::transport::Response, ts: &str) -> serde_json::Value {
    serde_json::json!({
        "[metadata]": {
            "url": link.url.as_str(),
            "proxy": link.proxy.as_str(),
            "host": link.host,
            "base": format!("{}/{}/{}", link.proxy, link.scheme(), link.host),
            "name": link.hash.to_string(),
        },
        "Timestamp": ts,
        "URL": response.final_url.as_str(),
        "Method": "GET",
        "Status-Code": response.status,
        "Cookies": response.cookies.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
        "Response": response.headers.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
    })
}
