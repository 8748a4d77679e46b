//! Link extraction
//!
//! Harvests candidate URLs from a document two ways: the values of the
//! standard link-bearing attributes, and URL-shaped strings inside text
//! nodes (which on dark-web pages frequently carry plain-text onion
//! addresses, magnet links and cryptocurrency URIs). The two sets are
//! unioned and deduplicated by link digest.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};

use crate::filters::FilterGates;
use crate::link::{Link, LinkDigest};
use crate::transport::TransportRegistry;

/// Attributes whose values are treated as URLs. `srcset` is handled
/// separately because it packs several candidates into one value.
const URL_ATTRIBUTES: &[&str] = &["href", "src", "data-href", "action", "poster", "formaction"];

fn link_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| {
        Selector::parse("[href], [src], [data-href], [action], [poster], [srcset], [formaction]")
            .expect("static selector")
    })
}

/// Schemed URLs in free text, e.g. `http://abc.onion/page`.
fn schemed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b[a-z][a-z0-9+.-]*://[^\s"'<>()\[\]{}]+"#).expect("static regex")
    })
}

/// Non-network link families in free text, e.g. `mailto:x@y`.
fn family_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)\b(?:mailto|tel|irc|magnet|ed2k|bitcoin|ethereum|javascript|data):[^\s"'<>]+"#,
        )
        .expect("static regex")
    })
}

/// Extract all links from an HTML document, resolved against `base`.
///
/// Parsing is lenient: broken markup degrades to whatever the parser
/// recovers plus the text sweep. Candidates that fail to resolve or
/// parse are dropped silently.
pub fn extract_links(base: &Link, html: &str) -> Vec<Link> {
    let document = Html::parse_document(html);
    let mut candidates: Vec<String> = Vec::new();

    for element in document.select(link_selector()) {
        let value = element.value();
        for attr in URL_ATTRIBUTES {
            if let Some(raw) = value.attr(attr) {
                candidates.push(raw.to_string());
            }
        }
        if let Some(srcset) = value.attr("srcset") {
            // "url1 1x, url2 2x": the first token of each entry
            for entry in srcset.split(',') {
                if let Some(url) = entry.split_whitespace().next() {
                    candidates.push(url.to_string());
                }
            }
        }
    }

    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    for re in [schemed_re(), family_re()] {
        for found in re.find_iter(&text) {
            candidates.push(found.as_str().to_string());
        }
    }

    let mut seen: HashSet<LinkDigest> = HashSet::new();
    let mut links = Vec::new();
    for raw in candidates {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        // absolute candidates parse directly, everything else resolves
        // against the document URL
        let resolved = match Link::parse(raw) {
            Ok(link) => Some(link),
            Err(_) => base
                .url
                .join(raw)
                .ok()
                .and_then(|joined| Link::parse(joined.as_str()).ok()),
        };
        if let Some(link) = resolved {
            if seen.insert(link.hash) {
                links.push(link);
            }
        }
    }
    links
}

/// Drop links whose hostname or proxy family the gates deny. Applied
/// to extracted links before they re-enter the frontier.
pub fn check_links(links: Vec<Link>, gates: &FilterGates) -> Vec<Link> {
    links
        .into_iter()
        .filter(|link| gates.allow_proxy(&link.proxy) && gates.allow_host(&link.host))
        .collect()
}

/// HEAD-check surviving links' content type through the appropriate
/// proxy, dropping those the MIME gate denies. Network failures keep
/// the link: the fetch worker will classify it properly later.
pub async fn check_links_ng(
    links: Vec<Link>,
    gates: &FilterGates,
    registry: &TransportRegistry,
) -> Vec<Link> {
    let mut kept = Vec::with_capacity(links.len());
    for link in links {
        if !link.proxy.is_fetchable() {
            kept.push(link);
            continue;
        }
        let session = registry.session(&link.proxy);
        match session.head(&link.url).await {
            Ok((_, Some(content_type))) => {
                if gates.allow_mime(&content_type) {
                    kept.push(link);
                } else {
                    tracing::debug!("HEAD check dropped {} ({})", link, content_type);
                }
            }
            Ok((_, None)) => kept.push(link),
            Err(e) => {
                tracing::debug!("HEAD check failed for {}: {}", link, e);
                kept.push(link);
            }
        }
    }
    kept
}
