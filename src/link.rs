//! Link model
//!
//! [`Link`] is the key data structure of the engine: a canonicalized
//! URL together with its proxy family, effective hostname and a stable
//! 16-byte digest. Identity is the digest; everything else is derived.
//!
//! Canonicalization case-folds the scheme and host, strips default
//! ports and collapses an empty path to `/`, leaving query and fragment
//! intact. No path normalization beyond that.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use url::Url;

use crate::error::CrawlError;

/// ZeroNet local gateway port (`ZERONET_PORT`, default 43110).
pub fn zeronet_port() -> u16 {
    static PORT: OnceLock<u16> = OnceLock::new();
    *PORT.get_or_init(|| {
        std::env::var("ZERONET_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(43110)
    })
}

/// Freenet local gateway port (`FREENET_PORT`, default 8888).
pub fn freenet_port() -> u16 {
    static PORT: OnceLock<u16> = OnceLock::new();
    *PORT.get_or_init(|| {
        std::env::var("FREENET_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8888)
    })
}

/// Proxy family of a link, derived from its scheme and host.
///
/// The first six are fetchable network transports; the rest are
/// non-network link families that get recorded to sink files and never
/// enter the render queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyTag {
    /// Direct Internet, no proxy.
    Null,
    /// Tor SOCKS5 (`.onion` hosts).
    Tor,
    /// Tor-to-web gateway (`.onion.sh` hosts), reached over clearnet.
    Tor2web,
    /// I2P HTTP proxy (`.i2p` hosts or the local console ports).
    I2p,
    /// ZeroNet local gateway.
    Zeronet,
    /// Freenet local gateway.
    Freenet,
    /// `data:` URI; payload saved, never fetched.
    Data,
    /// `mailto:` address.
    Mail,
    /// `tel:` number.
    Tel,
    /// `irc:` channel.
    Irc,
    /// `magnet:` link.
    Magnet,
    /// `ed2k:` link.
    Ed2k,
    /// `bitcoin:` address.
    Bitcoin,
    /// `ethereum:` address.
    Ethereum,
    /// `javascript:` pseudo-link; always filtered.
    Script,
    /// Any other scheme; recorded as invalid.
    Other(String),
}

impl ProxyTag {
    /// Canonical lowercase name, used in storage paths and filter lists.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Tor => "tor",
            Self::Tor2web => "tor2web",
            Self::I2p => "i2p",
            Self::Zeronet => "zeronet",
            Self::Freenet => "freenet",
            Self::Data => "data",
            Self::Mail => "mail",
            Self::Tel => "tel",
            Self::Irc => "irc",
            Self::Magnet => "magnet",
            Self::Ed2k => "ed2k",
            Self::Bitcoin => "bitcoin",
            Self::Ethereum => "ethereum",
            Self::Script => "script",
            Self::Other(s) => s,
        }
    }

    /// Whether links of this family are fetched over the network.
    pub fn is_fetchable(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::Tor | Self::Tor2web | Self::I2p | Self::Zeronet | Self::Freenet
        )
    }

    /// Sink file stem under `misc/` for non-fetchable families.
    ///
    /// `data:` URIs are handled separately (payload dump rather than a
    /// line-per-URL file) and `script` links never survive the proxy
    /// gate, so neither has a sink here.
    pub fn sink_family(&self) -> Option<&str> {
        match self {
            Self::Mail => Some("mail"),
            Self::Tel => Some("tel"),
            Self::Irc => Some("irc"),
            Self::Magnet => Some("magnet"),
            Self::Ed2k => Some("ed2k"),
            Self::Bitcoin => Some("bitcoin"),
            Self::Ethereum => Some("ethereum"),
            Self::Other(_) => Some("invalid"),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable 16-byte digest of a canonical URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkDigest(pub [u8; 16]);

impl LinkDigest {
    /// Digest the canonical URL string.
    pub fn of(canonical: &str) -> Self {
        Self(xxhash_rust::xxh3::xxh3_128(canonical.as_bytes()).to_be_bytes())
    }
}

impl fmt::Display for LinkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A canonicalized URL with derived routing metadata.
///
/// Immutable once constructed; two links compare equal iff their
/// digests match.
#[derive(Debug, Clone)]
pub struct Link {
    /// Canonical absolute URL.
    pub url: Url,
    /// Proxy family.
    pub proxy: ProxyTag,
    /// Effective hostname. For ZeroNet/Freenet gateway URLs this is the
    /// first path segment; for non-network families a placeholder like
    /// `(mail)`.
    pub host: String,
    /// Stable digest of the canonical URL.
    pub hash: LinkDigest,
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Link {}

impl std::hash::Hash for Link {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl Link {
    /// Parse and canonicalize a raw URL string.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CrawlError::MalformedUrl {
                input: raw.to_string(),
                reason: "empty URL".to_string(),
            });
        }

        // The url crate already case-folds scheme and host, strips
        // default ports, and forces `/` on empty special-scheme paths.
        let url = Url::parse(trimmed).map_err(|e| CrawlError::MalformedUrl {
            input: trimmed.to_string(),
            reason: e.to_string(),
        })?;

        let (proxy, host) = classify(&url);
        let hash = LinkDigest::of(url.as_str());

        Ok(Self { url, proxy, host, hash })
    }

    /// Scheme of the canonical URL.
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Path component of the canonical URL.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Artifact directory for this link: `<root>/<proxy>/<scheme>/<host>`.
    pub fn base_dir(&self, root: &Path) -> PathBuf {
        root.join(self.proxy.as_str())
            .join(self.scheme())
            .join(&self.host)
    }
}

/// Derive proxy family and effective hostname from a parsed URL.
fn classify(url: &Url) -> (ProxyTag, String) {
    let scheme = url.scheme();

    match scheme {
        "data" => return (ProxyTag::Data, "(data)".to_string()),
        "javascript" => return (ProxyTag::Script, "(script)".to_string()),
        "bitcoin" => return (ProxyTag::Bitcoin, "(bitcoin)".to_string()),
        "ed2k" => return (ProxyTag::Ed2k, "(ed2k)".to_string()),
        "magnet" => return (ProxyTag::Magnet, "(magnet)".to_string()),
        "mailto" => return (ProxyTag::Mail, "(mail)".to_string()),
        "tel" => return (ProxyTag::Tel, "(tel)".to_string()),
        "irc" => return (ProxyTag::Irc, "(irc)".to_string()),
        "ethereum" => return (ProxyTag::Ethereum, "(ethereum)".to_string()),
        "http" | "https" | "ftp" | "ws" | "wss" => {}
        other => return (ProxyTag::Other(other.to_string()), format!("({})", other)),
    }

    let host = match url.host_str() {
        Some(h) => h.to_string(),
        None => return (ProxyTag::Null, "(null)".to_string()),
    };

    if host.ends_with(".onion") {
        return (ProxyTag::Tor, host);
    }
    if host.ends_with(".onion.sh") {
        return (ProxyTag::Tor2web, host);
    }
    if host.ends_with(".i2p") {
        return (ProxyTag::I2p, host);
    }

    if matches!(host.as_str(), "127.0.0.1" | "localhost") {
        // c.f. https://geti2p.net/en/docs/api/i2ptunnel
        if matches!(url.port(), Some(7657) | Some(7658)) {
            return (ProxyTag::I2p, host);
        }
        // ZeroNet/Freenet addresses live behind a local gateway; the
        // site identity is the first path segment, never the root.
        for (port, tag) in [
            (zeronet_port(), ProxyTag::Zeronet),
            (freenet_port(), ProxyTag::Freenet),
        ] {
            if url.port() == Some(port) {
                if let Some(site) = first_path_segment(url) {
                    return (tag, site);
                }
                return (ProxyTag::Null, host);
            }
        }
    }

    (ProxyTag::Null, host)
}

fn first_path_segment(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next().map(str::to_string))
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(raw: &str) -> ProxyTag {
        Link::parse(raw).unwrap().proxy
    }

    #[test]
    fn clearnet_is_null() {
        assert_eq!(tag("https://example.com/page"), ProxyTag::Null);
        assert_eq!(tag("http://example.com"), ProxyTag::Null);
    }

    #[test]
    fn onion_routes_through_tor() {
        let link = Link::parse("http://3g2upl4pq6kufc4m.onion/").unwrap();
        assert_eq!(link.proxy, ProxyTag::Tor);
        assert_eq!(link.host, "3g2upl4pq6kufc4m.onion");
    }

    #[test]
    fn onion_sh_is_tor2web() {
        assert_eq!(tag("https://abc.onion.sh/page"), ProxyTag::Tor2web);
    }

    #[test]
    fn i2p_by_suffix_and_console_port() {
        assert_eq!(tag("http://stats.i2p/"), ProxyTag::I2p);
        assert_eq!(tag("http://127.0.0.1:7657/home"), ProxyTag::I2p);
        assert_eq!(tag("http://localhost:7658/"), ProxyTag::I2p);
    }

    #[test]
    fn zeronet_site_becomes_hostname() {
        let link = Link::parse("http://127.0.0.1:43110/1HeLLo4uzjaLetFx6NH3PMwFP3qbRbTf3D").unwrap();
        assert_eq!(link.proxy, ProxyTag::Zeronet);
        assert_eq!(link.host, "1HeLLo4uzjaLetFx6NH3PMwFP3qbRbTf3D");
    }

    #[test]
    fn gateway_root_path_stays_null() {
        assert_eq!(tag("http://127.0.0.1:43110/"), ProxyTag::Null);
    }

    #[test]
    fn non_network_families() {
        assert_eq!(tag("mailto:x@y.example"), ProxyTag::Mail);
        assert_eq!(tag("tel:+1-202-555-0100"), ProxyTag::Tel);
        assert_eq!(tag("magnet:?xt=urn:btih:deadbeef"), ProxyTag::Magnet);
        assert_eq!(tag("bitcoin:1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"), ProxyTag::Bitcoin);
        assert_eq!(tag("javascript:void(0)"), ProxyTag::Script);
        assert_eq!(tag("data:text/plain;base64,SGVsbG8="), ProxyTag::Data);
    }

    #[test]
    fn unknown_scheme_is_other() {
        let link = Link::parse("gopher://old.example/1/").unwrap();
        assert_eq!(link.proxy, ProxyTag::Other("gopher".to_string()));
        assert_eq!(link.proxy.sink_family(), Some("invalid"));
        assert!(!link.proxy.is_fetchable());
    }

    #[test]
    fn canonicalization_folds_case_and_default_port() {
        let a = Link::parse("HTTPS://Example.COM:443/Path?q=1#frag").unwrap();
        let b = Link::parse("https://example.com/Path?q=1#frag").unwrap();
        assert_eq!(a.hash, b.hash);
        // query and fragment survive, path case does not fold
        assert_eq!(a.url.as_str(), "https://example.com/Path?q=1#frag");
    }

    #[test]
    fn empty_path_collapses_to_root() {
        let link = Link::parse("https://example.com").unwrap();
        assert_eq!(link.path(), "/");
    }

    #[test]
    fn whitespace_trimmed_and_empty_rejected() {
        assert!(Link::parse("  https://example.com/  ").is_ok());
        assert!(matches!(
            Link::parse("   "),
            Err(CrawlError::MalformedUrl { .. })
        ));
    }

    #[test]
    fn digest_is_stable_and_hex_rendered() {
        let link = Link::parse("https://example.com/").unwrap();
        let again = Link::parse("https://example.com/").unwrap();
        assert_eq!(link.hash, again.hash);
        let hex = link.hash.to_string();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn base_dir_layout() {
        let link = Link::parse("http://abc.onion/deep/page").unwrap();
        let base = link.base_dir(Path::new("/data"));
        assert_eq!(base, PathBuf::from("/data/tor/http/abc.onion"));
    }
}
