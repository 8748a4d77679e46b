//! darkmap: dark-web crawling engine
//!
//! Two cooperating worker pools over a shared URL frontier:
//! - a **fetch pool** performing plain HTTP GETs through per-family
//!   proxies (clearnet, Tor, I2P, ZeroNet, Freenet), and
//! - a **render pool** driving headless Chromium for fully rendered
//!   HTML and full-page screenshots.
//!
//! Links extracted at either stage re-enter the frontier; per-link
//! locks and a freshness window keep repeat work at bay; per-host
//! `robots.txt` is honoured unless forced; results flow to a
//! submission API with a local-JSON fallback.

pub mod browser;
pub mod config;
pub mod crawl;
pub mod error;
pub mod extract;
pub mod filters;
pub mod frontier;
pub mod link;
pub mod robots;
pub mod scheduler;
pub mod sites;
pub mod storage;
pub mod submit;
pub mod transport;

pub use config::Config;
pub use error::{CrawlError, Result};
pub use link::{Link, LinkDigest, ProxyTag};
