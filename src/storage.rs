//! Artifact storage
//!
//! Owns the on-disk layout under `PATH_DATA`:
//!
//! ```text
//! data
//! ├── link.csv                     one row per first-seen link hash
//! ├── misc
//! │   ├── mail.txt … invalid.txt   line-per-URL sinks per family
//! │   └── data/<hash>_<ts>.dat     data: URI payloads
//! ├── api/<date>/…                 submission fallback JSON
//! └── <proxy>/<scheme>/<host>
//!     ├── robots.txt
//!     ├── sitemap_<hash>.xml
//!     ├── <hash>_<ts>.json         response headers
//!     ├── <hash>_<ts>_raw.html     fetched body (HTML)
//!     ├── <hash>_<ts>.dat          fetched body (other)
//!     ├── <hash>_<ts>.html         rendered source
//!     └── <hash>_<ts>.png          screenshot
//! ```
//!
//! Sink files and `link.csv` are append-only and guarded by per-file
//! locks so parallel workers never interleave partial lines.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use crate::error::Result;
use crate::link::{Link, LinkDigest};

/// Storage façade shared by all workers.
pub struct Storage {
    root: PathBuf,
    link_log: Mutex<()>,
    seen_links: DashSet<LinkDigest>,
    sink_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Storage {
    /// Prepare the directory tree and the `link.csv` header.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        fs::create_dir_all(root.join("misc").join("data"))?;
        fs::create_dir_all(root.join("api"))?;

        let link_csv = root.join("link.csv");
        if !link_csv.exists() {
            fs::write(&link_csv, "proxy,scheme,host,hash,link\n")?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            link_log: Mutex::new(()),
            seen_links: DashSet::new(),
            sink_locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem-safe timestamp used in artifact names.
    pub fn timestamp() -> String {
        chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f").to_string()
    }

    fn base_dir(&self, link: &Link) -> Result<PathBuf> {
        let base = link.base_dir(&self.root);
        fs::create_dir_all(&base)?;
        Ok(base)
    }

    /// Append the link to `link.csv` once per first-seen hash. Rows are
    /// never rewritten or removed.
    pub fn save_link(&self, link: &Link) -> Result<()> {
        if !self.seen_links.insert(link.hash) {
            return Ok(());
        }
        let _guard = self.link_log.lock();
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.root.join("link.csv"))?;
        writeln!(
            file,
            "{},{},{},{},{}",
            link.proxy,
            link.scheme(),
            link.host,
            link.hash,
            link.url
        )?;
        Ok(())
    }

    /// Append a raw URL to the family sink file `misc/<family>.txt`.
    pub fn sink_url(&self, family: &str, url: &str) -> Result<()> {
        let lock = self
            .sink_locks
            .entry(family.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();

        let path = self.root.join("misc").join(format!("{}.txt", family));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", url)?;
        Ok(())
    }

    /// Save a `data:` URI payload under `misc/data/`.
    pub fn save_data_uri(&self, link: &Link, ts: &str) -> Result<PathBuf> {
        let path = self
            .root
            .join("misc")
            .join("data")
            .join(format!("{}_{}.dat", link.hash, ts));
        fs::write(&path, link.url.as_str())?;
        Ok(path)
    }

    /// Save `robots.txt`, prefixed with the URL it came from.
    pub fn save_robots(&self, link: &Link, text: &str) -> Result<PathBuf> {
        let path = self.base_dir(link)?.join("robots.txt");
        fs::write(&path, format!("# {}\n{}", link.url, text))?;
        Ok(path)
    }

    /// Save a sitemap document as `sitemap_<hash>.xml`.
    pub fn save_sitemap(&self, sitemap_link: &Link, xml: &str) -> Result<PathBuf> {
        let path = self
            .base_dir(sitemap_link)?
            .join(format!("sitemap_{}.xml", sitemap_link.hash));
        fs::write(&path, format!("<!-- {} -->\n{}", sitemap_link.url, xml))?;
        self.save_link(sitemap_link)?;
        Ok(path)
    }

    /// Save response headers and cookies as JSON.
    pub fn save_headers(
        &self,
        link: &Link,
        payload: &serde_json::Value,
        ts: &str,
    ) -> Result<PathBuf> {
        let path = self
            .base_dir(link)?
            .join(format!("{}_{}.json", link.hash, ts));
        fs::write(&path, serde_json::to_string_pretty(payload).unwrap_or_default())?;
        self.save_link(link)?;
        Ok(path)
    }

    /// Save a fetched body: `_raw.html` for HTML, `.dat` otherwise.
    pub fn save_body(&self, link: &Link, body: &[u8], html: bool, ts: &str) -> Result<PathBuf> {
        let name = if html {
            format!("{}_{}_raw.html", link.hash, ts)
        } else {
            format!("{}_{}.dat", link.hash, ts)
        };
        let path = self.base_dir(link)?.join(name);
        fs::write(&path, body)?;
        Ok(path)
    }

    /// Save rendered page source.
    pub fn save_rendered(&self, link: &Link, html: &str, ts: &str) -> Result<PathBuf> {
        let path = self
            .base_dir(link)?
            .join(format!("{}_{}.html", link.hash, ts));
        fs::write(&path, html)?;
        self.save_link(link)?;
        Ok(path)
    }

    /// Save a full-page screenshot.
    pub fn save_screenshot(&self, link: &Link, png: &[u8], ts: &str) -> Result<PathBuf> {
        let path = self
            .base_dir(link)?
            .join(format!("{}_{}.png", link.hash, ts));
        fs::write(&path, png)?;
        Ok(path)
    }

    /// Save a submission payload that could not be delivered, filed by
    /// calendar day for maintenance.
    pub fn save_api_fallback(
        &self,
        event: &str,
        link: &Link,
        payload: &serde_json::Value,
    ) -> Result<PathBuf> {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let dir = self
            .root
            .join("api")
            .join(today)
            .join(link.proxy.as_str())
            .join(link.scheme())
            .join(&link.host)
            .join(event);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}_{}.json", link.hash, Self::timestamp()));
        fs::write(&path, serde_json::to_string_pretty(payload).unwrap_or_default())?;
        Ok(path)
    }
}
