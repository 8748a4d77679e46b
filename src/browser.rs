//! Headless browser driver
//!
//! Wraps chromiumoxide: one Chromium process per driver, one tab per
//! load. Drivers are per-worker instances and never shared, so render
//! workers stay isolated from each other.

use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use url::Url;

use crate::error::{CrawlError, Result};
use crate::transport::BrowserProfile;

/// Navigation budget for a single load.
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(90);

/// Outcome of rendering one page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// Fully rendered document source.
    pub html: String,
    /// Full-page PNG screenshot; `None` when capture failed (the page
    /// itself is still usable).
    pub screenshot: Option<Vec<u8>>,
}

/// A headless Chromium instance configured for one proxy family.
pub struct RenderDriver {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    settle: Option<Duration>,
}

impl RenderDriver {
    /// Launch Chromium with the family's proxy arguments. `settle` is
    /// the extra wait after document-ready for late scripts.
    pub async fn launch(profile: &BrowserProfile, settle: Option<Duration>) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run");

        if let Some(bin) = find_chrome_binary() {
            builder = builder.chrome_executable(bin);
        }
        for arg in &profile.args {
            builder = builder.arg(arg.as_str());
        }

        let config = builder
            .build()
            .map_err(|e| CrawlError::Browser(format!("browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CrawlError::Browser(format!("launch failed: {}", e)))?;

        // The CDP handler must be polled continuously for the
        // connection to stay alive.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::debug!("CDP handler closed: {:?}", event);
                    break;
                }
            }
        });

        Ok(Self {
            browser,
            handler_task,
            settle,
        })
    }

    /// Navigate to the URL, wait for document-ready plus the settle
    /// time, and return the rendered source and a full-page screenshot.
    pub async fn load(&self, url: &Url) -> Result<RenderedPage> {
        let result = tokio::time::timeout(NAVIGATION_TIMEOUT, async {
            let page = self
                .browser
                .new_page(url.as_str())
                .await
                .map_err(|e| CrawlError::Browser(format!("navigate {}: {}", url, e)))?;

            page.wait_for_navigation()
                .await
                .map_err(|e| CrawlError::Browser(format!("navigation wait: {}", e)))?;

            // some pages keep painting well past document-ready
            if let Some(settle) = self.settle {
                tokio::time::sleep(settle).await;
            }

            let html = page
                .content()
                .await
                .map_err(|e| CrawlError::Browser(format!("page source: {}", e)))?;

            let screenshot = match page
                .screenshot(
                    ScreenshotParams::builder()
                        .format(CaptureScreenshotFormat::Png)
                        .full_page(true)
                        .build(),
                )
                .await
            {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!("Screenshot failed for {}: {}", url, e);
                    None
                }
            };

            let _ = page.close().await;

            Ok(RenderedPage { html, screenshot })
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(CrawlError::Timeout(NAVIGATION_TIMEOUT)),
        }
    }

    /// Shut the browser down. Dropping without closing leaks the
    /// Chromium process until the handler task notices.
    pub async fn close(mut self) {
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

/// Locate a usable Chrome/Chromium binary, honouring `CHROME_BIN`.
/// Returns `None` to let chromiumoxide run its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_lookup_does_not_panic() {
        // just exercises the candidate scan on whatever host runs tests
        let _ = find_chrome_binary();
    }

    #[test]
    fn rendered_page_is_cloneable() {
        let page = RenderedPage {
            html: "<html></html>".to_string(),
            screenshot: None,
        };
        let copy = page.clone();
        assert_eq!(copy.html, page.html);
    }
}
