//! Filter gates
//!
//! Allow/deny evaluation against hostname, MIME type and proxy family.
//! Each gate is driven by a white list and a black list of regular
//! expressions plus a fallback polarity: a white match allows, a black
//! match denies, otherwise the fallback decides.

use regex::Regex;

use crate::config::FilterConfig;
use crate::link::ProxyTag;

/// Compiled filter gates, built once at startup.
#[derive(Debug)]
pub struct FilterGates {
    host_white: Vec<Regex>,
    host_black: Vec<Regex>,
    host_fallback_deny: bool,
    mime_white: Vec<Regex>,
    mime_black: Vec<Regex>,
    mime_fallback_deny: bool,
    proxy_white: Vec<String>,
    proxy_black: Vec<String>,
    proxy_fallback_deny: bool,
}

/// Compile a pattern list, skipping invalid entries with a warning.
fn compile(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(&format!("(?i){}", p)) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("Invalid filter pattern '{}': {}", p, e);
                None
            }
        })
        .collect()
}

impl FilterGates {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            host_white: compile(&config.link_white_list),
            host_black: compile(&config.link_black_list),
            host_fallback_deny: config.link_fallback,
            mime_white: compile(&config.mime_white_list),
            mime_black: compile(&config.mime_black_list),
            mime_fallback_deny: config.mime_fallback,
            proxy_white: lowercase_all(&config.proxy_white_list),
            proxy_black: lowercase_all(&config.proxy_black_list),
            proxy_fallback_deny: config.proxy_fallback,
        }
    }

    /// May links on this hostname be crawled?
    pub fn allow_host(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        evaluate(&self.host_white, &self.host_black, self.host_fallback_deny, &host)
    }

    /// May a response with this content type progress past fetching?
    pub fn allow_mime(&self, content_type: &str) -> bool {
        let mime = content_type.to_lowercase();
        evaluate(&self.mime_white, &self.mime_black, self.mime_fallback_deny, &mime)
    }

    /// May links of this proxy family be processed at all?
    ///
    /// `javascript:` pseudo-links are never crawlable regardless of
    /// configuration.
    pub fn allow_proxy(&self, tag: &ProxyTag) -> bool {
        if matches!(tag, ProxyTag::Script) {
            return false;
        }
        let name = tag.as_str();
        if self.proxy_white.iter().any(|t| t == name) {
            return true;
        }
        if self.proxy_black.iter().any(|t| t == name) {
            return false;
        }
        !self.proxy_fallback_deny
    }
}

fn lowercase_all(tags: &[String]) -> Vec<String> {
    tags.iter().map(|t| t.to_lowercase()).collect()
}

fn evaluate(white: &[Regex], black: &[Regex], fallback_deny: bool, input: &str) -> bool {
    if white.iter().any(|re| re.is_match(input)) {
        return true;
    }
    if black.iter().any(|re| re.is_match(input)) {
        return false;
    }
    !fallback_deny
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;

    fn gates(config: FilterConfig) -> FilterGates {
        FilterGates::new(&config)
    }

    #[test]
    fn default_config_allows_everything() {
        let g = gates(FilterConfig::default());
        assert!(g.allow_host("example.com"));
        assert!(g.allow_mime("text/html"));
        assert!(g.allow_proxy(&ProxyTag::Tor));
        assert!(g.allow_proxy(&ProxyTag::Null));
    }

    #[test]
    fn black_list_denies() {
        let g = gates(FilterConfig {
            link_black_list: vec![r"\.example\.com".to_string()],
            ..FilterConfig::default()
        });
        assert!(!g.allow_host("evil.example.com"));
        assert!(g.allow_host("example.org"));
    }

    #[test]
    fn white_list_wins_over_black_list() {
        let g = gates(FilterConfig {
            link_white_list: vec!["good".to_string()],
            link_black_list: vec!["example".to_string()],
            ..FilterConfig::default()
        });
        assert!(g.allow_host("good.example.com"));
        assert!(!g.allow_host("bad.example.com"));
    }

    #[test]
    fn fallback_polarity_denies_unmatched() {
        let g = gates(FilterConfig {
            link_white_list: vec![r"\.onion$".to_string()],
            link_fallback: true,
            ..FilterConfig::default()
        });
        assert!(g.allow_host("abc.onion"));
        assert!(!g.allow_host("example.com"));
    }

    #[test]
    fn mime_matching_is_case_insensitive() {
        let g = gates(FilterConfig {
            mime_black_list: vec!["image/".to_string()],
            ..FilterConfig::default()
        });
        assert!(!g.allow_mime("Image/PNG"));
        assert!(g.allow_mime("text/html"));
    }

    #[test]
    fn script_proxy_always_denied() {
        let g = gates(FilterConfig {
            proxy_white_list: vec!["script".to_string()],
            ..FilterConfig::default()
        });
        assert!(!g.allow_proxy(&ProxyTag::Script));
    }

    #[test]
    fn proxy_literal_comparison() {
        let g = gates(FilterConfig {
            proxy_black_list: vec!["TOR".to_string()],
            ..FilterConfig::default()
        });
        assert!(!g.allow_proxy(&ProxyTag::Tor));
        assert!(g.allow_proxy(&ProxyTag::I2p));
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let g = gates(FilterConfig {
            link_black_list: vec!["(unclosed".to_string(), "real".to_string()],
            ..FilterConfig::default()
        });
        assert!(!g.allow_host("real.example.com"));
        assert!(g.allow_host("other.example.com"));
    }
}
