//! Robots policy
//!
//! Per-host cached `robots.txt` rules plus sitemap ingestion. The
//! parser understands user-agent groups (a specific group overrides the
//! wildcard), `Allow`/`Disallow` with `*` wildcards and `$` anchors,
//! and global `Sitemap:` directives. The longest matching pattern wins;
//! on a tie, allow wins. A fetch failure caches "no rules".
//!
//! The root path `/` is always fetchable regardless of rules.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::Result;
use crate::link::Link;
use crate::transport::FetchSession;

/// Size of the per-host robots cache.
const ROBOTS_CACHE_SIZE: usize = 10_000;

/// One `Allow`/`Disallow` line from the rule group that applies to us.
#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    allow: bool,
}

/// A `User-agent` block as written in the file: one or more agent
/// tokens followed by their rules.
#[derive(Debug, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
}

impl Group {
    fn names(&self, ua: &str) -> bool {
        self.agents.iter().any(|agent| agent != "*" && ua.contains(agent.as_str()))
    }

    fn is_wildcard(&self) -> bool {
        self.agents.iter().any(|agent| agent == "*")
    }
}

/// Parsed robots rules for one host.
#[derive(Debug, Clone)]
pub struct CachedRobots {
    rules: Vec<Rule>,
    sitemaps: Vec<String>,
    fetched_at: Instant,
}

impl CachedRobots {
    /// Parse `robots.txt` content and keep the rules of the group that
    /// applies to `user_agent`: a group naming the agent beats the `*`
    /// group, which beats nothing at all.
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut sitemaps = Vec::new();
        // consecutive User-agent lines name the same group
        let mut naming = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();
            if value.is_empty() {
                naming = false;
                continue;
            }

            match key.as_str() {
                "user-agent" => {
                    if !naming {
                        groups.push(Group::default());
                    }
                    naming = true;
                    if let Some(group) = groups.last_mut() {
                        group.agents.push(value.to_lowercase());
                    }
                }
                "allow" | "disallow" => {
                    naming = false;
                    if let Some(group) = groups.last_mut() {
                        group.rules.push(Rule {
                            pattern: value.to_string(),
                            allow: key == "allow",
                        });
                    }
                }
                // sitemap directives are host-global, not per-group
                "sitemap" => {
                    naming = false;
                    sitemaps.push(value.to_string());
                }
                _ => naming = false,
            }
        }

        let ua = user_agent.to_lowercase();
        let rules = groups
            .iter()
            .find(|group| group.names(&ua))
            .or_else(|| groups.iter().find(|group| group.is_wildcard()))
            .map(|group| group.rules.clone())
            .unwrap_or_default();

        Self {
            rules,
            sitemaps,
            fetched_at: Instant::now(),
        }
    }

    /// Empty rules: everything allowed. Used when the fetch failed.
    pub fn allow_all() -> Self {
        Self {
            rules: Vec::new(),
            sitemaps: Vec::new(),
            fetched_at: Instant::now(),
        }
    }

    /// Whether a path is allowed under these rules: the longest
    /// matching pattern decides, allow wins a length tie, and a path
    /// no rule matches is allowed.
    pub fn is_allowed(&self, path: &str) -> bool {
        self.rules
            .iter()
            .filter(|rule| rule_matches(&rule.pattern, path))
            .max_by_key(|rule| (rule.pattern.len(), rule.allow))
            .map(|rule| rule.allow)
            .unwrap_or(true)
    }

    /// Sitemap URLs declared by the host, if any.
    pub fn sitemaps(&self) -> &[String] {
        &self.sitemaps
    }

    fn valid(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.fetched_at.elapsed() < ttl,
            None => true,
        }
    }
}

/// Match one robots pattern against a path. `*` spans any run of
/// characters; a trailing `$` pins the pattern to the whole path,
/// otherwise matching a prefix suffices.
fn rule_matches(pattern: &str, path: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let (body, pinned) = match pattern.strip_suffix('$') {
        Some(body) => (body, true),
        None => (pattern, false),
    };
    descend(body.as_bytes(), path.as_bytes(), pinned)
}

/// Backtracking descent over pattern and path. Robots patterns are a
/// handful of bytes, so the worst case stays cheap.
fn descend(pattern: &[u8], path: &[u8], pinned: bool) -> bool {
    match pattern.split_first() {
        None => !pinned || path.is_empty(),
        Some((b'*', rest)) => (0..=path.len()).any(|skip| descend(rest, &path[skip..], pinned)),
        Some((expected, rest)) => match path.split_first() {
            Some((actual, tail)) => actual == expected && descend(rest, tail, pinned),
            None => false,
        },
    }
}

/// Per-host robots cache with the freshness window as TTL.
pub struct RobotsManager {
    cache: Mutex<LruCache<String, CachedRobots>>,
    ttl: Option<Duration>,
    user_agent: String,
    force: bool,
}

impl RobotsManager {
    /// `ttl = None` caches forever; `force` bypasses every deny.
    pub fn new(user_agent: &str, ttl: Option<Duration>, force: bool) -> Self {
        let capacity = NonZeroUsize::new(ROBOTS_CACHE_SIZE).expect("non-zero cache size");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
            user_agent: user_agent.to_string(),
            force,
        }
    }

    /// Valid cached rules for a host, if any.
    pub fn cached(&self, host: &str) -> Option<CachedRobots> {
        let mut cache = self.cache.lock();
        cache
            .get(host)
            .filter(|robots| robots.valid(self.ttl))
            .cloned()
    }

    /// Fetch and cache rules for the link's host, returning the rules
    /// and the raw text when a fresh fetch happened (so the caller can
    /// persist and submit it).
    pub async fn ensure(
        &self,
        link: &Link,
        session: &FetchSession,
    ) -> Result<(CachedRobots, Option<String>)> {
        if let Some(robots) = self.cached(&link.host) {
            return Ok((robots, None));
        }

        let robots_url = link
            .url
            .join("/robots.txt")
            .map_err(crate::error::CrawlError::from)?;

        let (robots, raw) = match session.get(&robots_url).await {
            Ok(response) if response.status == 200 => {
                let text = String::from_utf8_lossy(&response.body).into_owned();
                (CachedRobots::parse(&text, &self.user_agent), Some(text))
            }
            // non-200 and transport failures both mean "no rules"
            Ok(_) | Err(_) => (CachedRobots::allow_all(), None),
        };

        self.cache.lock().put(link.host.clone(), robots.clone());
        Ok((robots, raw))
    }

    /// May this link be fetched? `FORCE` and the root path always pass;
    /// a host with no cached rules passes too.
    pub fn allowed(&self, link: &Link) -> bool {
        if self.force {
            return true;
        }
        if matches!(link.path(), "" | "/") {
            return true;
        }
        match self.cached(&link.host) {
            Some(robots) => robots.is_allowed(link.path()),
            None => true,
        }
    }
}

/// One fetched sitemap document.
pub struct SitemapDoc {
    /// The sitemap's own link (for artifact naming).
    pub link: Link,
    /// Raw XML.
    pub xml: String,
    /// Page links listed by the sitemap.
    pub pages: Vec<Link>,
}

/// Fetch the host's sitemaps: those declared in robots, else the
/// `/sitemap.xml` fallback. One level of sitemap-index indirection is
/// followed. Unreachable documents are skipped.
pub async fn fetch_sitemaps(
    robots: &CachedRobots,
    link: &Link,
    session: &FetchSession,
) -> Vec<SitemapDoc> {
    let mut queue: Vec<String> = if robots.sitemaps().is_empty() {
        match link.url.join("/sitemap.xml") {
            Ok(url) => vec![url.to_string()],
            Err(_) => Vec::new(),
        }
    } else {
        robots.sitemaps().to_vec()
    };

    let mut docs = Vec::new();
    let mut followed_index = false;

    while let Some(sitemap_url) = queue.pop() {
        let Ok(sitemap_link) = Link::parse(&sitemap_url) else {
            continue;
        };
        let response = match session.get(&sitemap_link.url).await {
            Ok(r) if r.status == 200 => r,
            Ok(r) => {
                tracing::debug!("Sitemap {} returned {}", sitemap_link, r.status);
                continue;
            }
            Err(e) => {
                tracing::debug!("Sitemap {} fetch failed: {}", sitemap_link, e);
                continue;
            }
        };

        let xml = String::from_utf8_lossy(&response.body).into_owned();
        let parsed = parse_sitemap(&xml);

        if !parsed.nested.is_empty() && !followed_index {
            followed_index = true;
            queue.extend(parsed.nested);
        }

        let pages = parsed
            .pages
            .iter()
            .filter_map(|loc| {
                link.url
                    .join(loc)
                    .ok()
                    .and_then(|url| Link::parse(url.as_str()).ok())
            })
            .collect();

        docs.push(SitemapDoc {
            link: sitemap_link,
            xml,
            pages,
        });
    }
    docs
}

/// `<loc>` values split by whether they sit under `<url>` (pages) or
/// `<sitemap>` (nested sitemap index entries).
struct ParsedSitemap {
    pages: Vec<String>,
    nested: Vec<String>,
}

fn parse_sitemap(xml: &str) -> ParsedSitemap {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut pages = Vec::new();
    let mut nested = Vec::new();
    let mut in_url = false;
    let mut in_sitemap = false;
    let mut in_loc = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" => in_url = true,
                b"sitemap" => in_sitemap = true,
                b"loc" => in_loc = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"url" => in_url = false,
                b"sitemap" => in_sitemap = false,
                b"loc" => in_loc = false,
                _ => {}
            },
            Ok(Event::Text(text)) if in_loc => {
                if let Ok(value) = text.unescape() {
                    let value = value.trim().to_string();
                    if value.is_empty() {
                        continue;
                    }
                    if in_sitemap {
                        nested.push(value);
                    } else if in_url {
                        pages.push(value);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!("Sitemap parse aborted: {}", e);
                break;
            }
            _ => {}
        }
    }

    ParsedSitemap { pages, nested }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UA: &str = "darkmap/0.1.0";

    #[test]
    fn specific_group_overrides_wildcard() {
        let content = "
User-agent: *
Disallow: /private/

User-agent: darkmap
Disallow: /admin/
";
        let robots = CachedRobots::parse(content, UA);
        assert!(!robots.is_allowed("/admin/settings"));
        // the wildcard group no longer applies
        assert!(robots.is_allowed("/private/page"));
    }

    #[test]
    fn allow_beats_disallow_on_longer_match() {
        let content = "
User-agent: *
Disallow: /private/
Allow: /private/public/
";
        let robots = CachedRobots::parse(content, UA);
        assert!(!robots.is_allowed("/private/secret"));
        assert!(robots.is_allowed("/private/public/page"));
    }

    #[test]
    fn wildcard_and_anchor_patterns() {
        let content = "
User-agent: *
Disallow: /*.pdf$
Disallow: /tmp*/cache
";
        let robots = CachedRobots::parse(content, UA);
        assert!(!robots.is_allowed("/docs/manual.pdf"));
        assert!(robots.is_allowed("/docs/manual.pdf?x=1"));
        assert!(!robots.is_allowed("/tmp123/cache"));
        assert!(robots.is_allowed("/docs/manual.html"));
    }

    #[test]
    fn shared_group_lists_several_agents() {
        let content = "
User-agent: googlebot
User-agent: darkmap
Disallow: /private/

User-agent: *
Disallow: /
";
        let robots = CachedRobots::parse(content, UA);
        assert!(!robots.is_allowed("/private/page"));
        // only the named group applies, not the wildcard catch-all
        assert!(robots.is_allowed("/public/page"));
    }

    #[test]
    fn equal_length_tie_goes_to_allow() {
        let content = "
User-agent: *
Disallow: /dual/
Allow: /dual/
";
        let robots = CachedRobots::parse(content, UA);
        // both rules match with equal pattern length
        assert!(robots.is_allowed("/dual/page"));
    }

    #[test]
    fn pattern_matching_prefix_star_and_pin() {
        assert!(rule_matches("/admin/", "/admin/test"));
        assert!(!rule_matches("/admin/", "/public/test"));
        assert!(rule_matches("/images/*.jpg", "/images/cat.jpg"));
        assert!(rule_matches("/page.html$", "/page.html"));
        assert!(!rule_matches("/page.html$", "/page.html?query"));
        assert!(rule_matches("*", "/anything"));
        assert!(!rule_matches("", "/anything"));
    }

    #[test]
    fn sitemap_directives_are_collected() {
        let content = "
User-agent: other-bot
Disallow: /
Sitemap: https://example.com/sitemap-a.xml
Sitemap: https://example.com/sitemap-b.xml
";
        let robots = CachedRobots::parse(content, UA);
        assert_eq!(robots.sitemaps().len(), 2);
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let content = "
# full line comment
User-agent: *  # trailing comment
Disallow: /hidden/
";
        let robots = CachedRobots::parse(content, UA);
        assert!(!robots.is_allowed("/hidden/page"));
    }

    #[test]
    fn manager_root_path_always_allowed() {
        let manager = RobotsManager::new(UA, Some(Duration::from_secs(60)), false);
        let content = "User-agent: *\nDisallow: /";
        manager
            .cache
            .lock()
            .put("example.com".to_string(), CachedRobots::parse(content, UA));

        let root = Link::parse("https://example.com/").unwrap();
        let page = Link::parse("https://example.com/page").unwrap();
        assert!(manager.allowed(&root));
        assert!(!manager.allowed(&page));
    }

    #[test]
    fn manager_force_bypasses_rules() {
        let manager = RobotsManager::new(UA, Some(Duration::from_secs(60)), true);
        let content = "User-agent: *\nDisallow: /";
        manager
            .cache
            .lock()
            .put("example.com".to_string(), CachedRobots::parse(content, UA));
        let page = Link::parse("https://example.com/page").unwrap();
        assert!(manager.allowed(&page));
    }

    #[test]
    fn manager_unknown_host_is_allowed() {
        let manager = RobotsManager::new(UA, Some(Duration::from_secs(60)), false);
        let page = Link::parse("https://unseen.example.com/page").unwrap();
        assert!(manager.allowed(&page));
    }

    #[test]
    fn cache_respects_ttl() {
        let manager = RobotsManager::new(UA, Some(Duration::ZERO), false);
        manager
            .cache
            .lock()
            .put("example.com".to_string(), CachedRobots::allow_all());
        // zero TTL expires immediately
        assert!(manager.cached("example.com").is_none());

        let forever = RobotsManager::new(UA, None, false);
        forever
            .cache
            .lock()
            .put("example.com".to_string(), CachedRobots::allow_all());
        assert!(forever.cached("example.com").is_some());
    }

    #[test]
    fn parse_sitemap_urlset() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.com/a</loc></url>
  <url><loc>https://example.com/b</loc><lastmod>2024-01-01</lastmod></url>
</urlset>"#;
        let parsed = parse_sitemap(xml);
        assert_eq!(parsed.pages, vec![
            "https://example.com/a".to_string(),
            "https://example.com/b".to_string(),
        ]);
        assert!(parsed.nested.is_empty());
    }

    #[test]
    fn parse_sitemap_index() {
        let xml = r#"<sitemapindex>
  <sitemap><loc>https://example.com/sitemap-1.xml</loc></sitemap>
</sitemapindex>"#;
        let parsed = parse_sitemap(xml);
        assert!(parsed.pages.is_empty());
        assert_eq!(parsed.nested, vec!["https://example.com/sitemap-1.xml".to_string()]);
    }

    #[test]
    fn parse_sitemap_tolerates_garbage() {
        let parsed = parse_sitemap("this is not xml at all");
        assert!(parsed.pages.is_empty());
        assert!(parsed.nested.is_empty());
    }
}
