//! Transport registry
//!
//! Maps a proxy family to the machinery that can carry it: a
//! preconfigured HTTP session for the fetch pool and a browser profile
//! for the render pool. The identity entry (no proxy) carries clearnet
//! traffic and is the fallback for families without their own entry.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::redirect::Policy;
use url::Url;

use crate::config::Config;
use crate::error::{CrawlError, Result};
use crate::link::ProxyTag;

/// Response captured by a fetch session.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// URL after redirects.
    pub final_url: Url,
    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Cookies set by the response.
    pub cookies: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Response {
    /// Lowercased media type without parameters. Sniffs HTML when the
    /// server sent no `Content-Type` at all.
    pub fn content_type(&self) -> String {
        match self.header("content-type") {
            Some(value) => value
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_lowercase(),
            None => {
                if self.body.trim_ascii_start().starts_with(b"<") {
                    "text/html".to_string()
                } else {
                    "application/octet-stream".to_string()
                }
            }
        }
    }

    /// First header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the document should go through link extraction.
    pub fn is_html(&self) -> bool {
        matches!(
            self.content_type().as_str(),
            "text/html" | "application/xhtml+xml"
        )
    }

    /// Whether the status is in the retryable 4xx/5xx band.
    pub fn is_error_status(&self) -> bool {
        (400..600).contains(&self.status)
    }
}

/// One proxy family's HTTP session: a configured client plus the
/// timeout it promises to honour.
#[derive(Clone)]
pub struct FetchSession {
    client: reqwest::Client,
    timeout: Duration,
}

impl FetchSession {
    /// Perform a GET, following redirects, classifying failures.
    pub async fn get(&self, url: &Url) -> Result<Response> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| classify(e, self.timeout))?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let cookies: Vec<(String, String)> = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| classify(e, self.timeout))?
            .to_vec();

        Ok(Response {
            status,
            final_url,
            headers,
            cookies,
            body,
        })
    }

    /// HEAD request used by the optional content-type pre-check on
    /// extracted links.
    pub async fn head(&self, url: &Url) -> Result<(u16, Option<String>)> {
        let response = self
            .client
            .head(url.as_str())
            .send()
            .await
            .map_err(|e| classify(e, self.timeout))?;
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_lowercase());
        Ok((response.status().as_u16(), content_type))
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> CrawlError {
    if err.is_timeout() {
        CrawlError::Timeout(timeout)
    } else if err.is_builder() {
        CrawlError::InvalidScheme(
            err.url()
                .map(|u| u.scheme().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        )
    } else {
        CrawlError::Network(err.to_string())
    }
}

/// Browser launch profile for a proxy family: extra Chromium arguments
/// wiring the right proxy in.
#[derive(Debug, Clone, Default)]
pub struct BrowserProfile {
    pub args: Vec<String>,
}

struct TransportEntry {
    session: FetchSession,
    browser: BrowserProfile,
}

/// Registry of transports, built once at startup and immutable after.
pub struct TransportRegistry {
    entries: HashMap<ProxyTag, TransportEntry>,
    identity: TransportEntry,
}

impl TransportRegistry {
    /// Build sessions and browser profiles for every supported family.
    pub fn new(config: &Config) -> Result<Self> {
        let timeout = config.proxy.request_timeout();
        let ua = &config.user_agent;

        let identity = TransportEntry {
            session: build_session(ua, None, timeout)?,
            browser: BrowserProfile::default(),
        };

        let mut entries = HashMap::new();

        let tor_socks = format!("socks5h://127.0.0.1:{}", config.proxy.tor_port);
        entries.insert(
            ProxyTag::Tor,
            TransportEntry {
                session: build_session(
                    &format!("{} (Tor Proxy)", ua),
                    Some(tor_socks.as_str()),
                    timeout,
                )?,
                browser: BrowserProfile {
                    args: vec![
                        format!("--proxy-server=socks5://127.0.0.1:{}", config.proxy.tor_port),
                        // keep .onion resolution inside the proxy
                        "--host-resolver-rules=MAP * ~NOTFOUND , EXCLUDE localhost".to_string(),
                    ],
                },
            },
        );

        let i2p_http = format!("http://127.0.0.1:{}", config.proxy.i2p_port);
        entries.insert(
            ProxyTag::I2p,
            TransportEntry {
                session: build_session(
                    &format!("{} (I2P Proxy)", ua),
                    Some(i2p_http.as_str()),
                    timeout,
                )?,
                browser: BrowserProfile {
                    args: vec![format!(
                        "--proxy-server=http://127.0.0.1:{}",
                        config.proxy.i2p_port
                    )],
                },
            },
        );

        // ZeroNet and Freenet sites are reached through their local
        // gateways over plain HTTP; only the user agent differs.
        for (tag, family) in [
            (ProxyTag::Zeronet, "ZeroNet"),
            (ProxyTag::Freenet, "Freenet"),
            (ProxyTag::Tor2web, "Tor2web"),
        ] {
            entries.insert(
                tag,
                TransportEntry {
                    session: build_session(&format!("{} ({} Proxy)", ua, family), None, timeout)?,
                    browser: BrowserProfile::default(),
                },
            );
        }

        Ok(Self { entries, identity })
    }

    fn entry(&self, tag: &ProxyTag) -> &TransportEntry {
        self.entries.get(tag).unwrap_or(&self.identity)
    }

    /// Fetch session for the family; the identity session when the
    /// family has no dedicated transport.
    pub fn session(&self, tag: &ProxyTag) -> FetchSession {
        self.entry(tag).session.clone()
    }

    /// Browser profile for the family.
    pub fn browser_profile(&self, tag: &ProxyTag) -> BrowserProfile {
        self.entry(tag).browser.clone()
    }
}

fn build_session(user_agent: &str, proxy: Option<&str>, timeout: Duration) -> Result<FetchSession> {
    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .cookie_store(true)
        .gzip(true)
        .brotli(true);

    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| CrawlError::Network(format!("invalid proxy {}: {}", proxy_url, e)))?;
        builder = builder.proxy(proxy);
    }

    let client = builder
        .build()
        .map_err(|e| CrawlError::Network(format!("client build failed: {}", e)))?;

    Ok(FetchSession { client, timeout })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(content_type: Option<&str>, body: &[u8], status: u16) -> Response {
        Response {
            status,
            final_url: Url::parse("https://example.com/").unwrap(),
            headers: content_type
                .map(|ct| vec![("Content-Type".to_string(), ct.to_string())])
                .unwrap_or_default(),
            cookies: Vec::new(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn content_type_strips_parameters_and_case() {
        let r = response(Some("Text/HTML; charset=utf-8"), b"", 200);
        assert_eq!(r.content_type(), "text/html");
        assert!(r.is_html());
    }

    #[test]
    fn missing_content_type_sniffs_html() {
        let r = response(None, b"  <html><body>hi</body></html>", 200);
        assert_eq!(r.content_type(), "text/html");
        let r = response(None, b"\x89PNG\r\n", 200);
        assert_eq!(r.content_type(), "application/octet-stream");
    }

    #[test]
    fn xhtml_counts_as_html() {
        let r = response(Some("application/xhtml+xml"), b"", 200);
        assert!(r.is_html());
        let r = response(Some("application/json"), b"", 200);
        assert!(!r.is_html());
    }

    #[test]
    fn error_status_band() {
        assert!(response(None, b"", 404).is_error_status());
        assert!(response(None, b"", 503).is_error_status());
        assert!(!response(None, b"", 200).is_error_status());
        assert!(!response(None, b"", 301).is_error_status());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let r = response(Some("text/plain"), b"", 200);
        assert_eq!(r.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(r.header("x-missing"), None);
    }

    #[test]
    fn registry_falls_back_to_identity() {
        let config = Config::default();
        let registry = TransportRegistry::new(&config).unwrap();
        // families without a dedicated entry share the identity session
        let _ = registry.session(&ProxyTag::Null);
        let _ = registry.session(&ProxyTag::Other("gopher".to_string()));
        assert!(registry.browser_profile(&ProxyTag::Tor).args.len() >= 2);
        assert!(registry.browser_profile(&ProxyTag::Null).args.is_empty());
    }
}
