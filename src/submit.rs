//! Submission sink
//!
//! Fire-and-forget reporting of three events to an external API:
//! a newly onboarded host, a fetched document, a rendered document.
//! Each POST is retried up to the configured budget; on exhaustion (or
//! when the endpoint is unset) the JSON payload is written under
//! `{PATH_DATA}/api/` instead. Submission failures never fail a crawl.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

use crate::config::SubmitConfig;
use crate::error::{CrawlError, Result};
use crate::link::Link;
use crate::storage::Storage;
use crate::transport::Response;

/// The three submission events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitEvent {
    NewHost,
    Requests,
    Selenium,
}

impl SubmitEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewHost => "new_host",
            Self::Requests => "requests",
            Self::Selenium => "selenium",
        }
    }
}

/// Submission client shared by all workers.
pub struct Submitter {
    client: reqwest::Client,
    config: SubmitConfig,
    storage: Arc<Storage>,
}

impl Submitter {
    pub fn new(config: SubmitConfig, storage: Arc<Storage>, user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            storage,
        }
    }

    fn endpoint(&self, event: SubmitEvent) -> Option<&str> {
        match event {
            SubmitEvent::NewHost => self.config.api_new_host.as_deref(),
            SubmitEvent::Requests => self.config.api_requests.as_deref(),
            SubmitEvent::Selenium => self.config.api_selenium.as_deref(),
        }
    }

    /// Deliver one payload: POST with retries, falling back to a local
    /// JSON file. Never propagates an error to the caller.
    async fn dispatch(&self, event: SubmitEvent, link: &Link, payload: Value) {
        let Some(endpoint) = self.endpoint(event) else {
            self.save_fallback(event, link, &payload);
            return;
        };

        if let Err(e) = self.post_with_retry(endpoint, event, link, &payload).await {
            tracing::warn!("{} ({} for {}); saving locally", e, event.as_str(), link);
            self.save_fallback(event, link, &payload);
        }
    }

    /// POST one payload within the retry budget. Exhausting the budget
    /// is a [`CrawlError::Submission`].
    async fn post_with_retry(
        &self,
        endpoint: &str,
        event: SubmitEvent,
        link: &Link,
        payload: &Value,
    ) -> Result<()> {
        let attempts = self.config.api_retry.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match self.client.post(endpoint).json(payload).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => reason = format!("status {}", response.status()),
                Err(e) => reason = e.to_string(),
            }
            tracing::debug!(
                "Submission {} for {} attempt {}/{}: {}",
                event.as_str(),
                link,
                attempt,
                attempts,
                reason
            );
        }

        Err(CrawlError::Submission { attempts, reason })
    }

    fn save_fallback(&self, event: SubmitEvent, link: &Link, payload: &Value) {
        if let Err(e) = self.storage.save_api_fallback(event.as_str(), link, payload) {
            tracing::error!("Failed to save {} payload for {}: {}", event.as_str(), link, e);
        }
    }

    /// Report a newly onboarded host with its robots.txt and sitemaps.
    pub async fn submit_new_host(
        &self,
        link: &Link,
        robots: Option<&str>,
        sitemaps: &[(String, String)],
        partial: bool,
    ) {
        let payload = json!({
            "[metadata]": metadata(link),
            "Timestamp": chrono::Utc::now().to_rfc3339(),
            "Partial": partial,
            "Robots": robots.map(|text| json!({
                "path": format!("{}/{}/{}/robots.txt", link.proxy, link.scheme(), link.host),
                "data": BASE64.encode(text),
            })),
            "Sitemaps": if sitemaps.is_empty() {
                Value::Null
            } else {
                sitemaps
                    .iter()
                    .map(|(path, xml)| json!({"path": path, "data": BASE64.encode(xml)}))
                    .collect()
            },
        });
        self.dispatch(SubmitEvent::NewHost, link, payload).await;
    }

    /// Report a fetched document with headers, cookies and body.
    pub async fn submit_requests(&self, link: &Link, response: &Response, html: bool) {
        let headers: Value = response
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>()
            .into();
        let cookies: Value = response
            .cookies
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>()
            .into();

        let payload = json!({
            "[metadata]": metadata(link),
            "Timestamp": chrono::Utc::now().to_rfc3339(),
            "URL": response.final_url.as_str(),
            "Method": "GET",
            "Status-Code": response.status,
            "Cookies": cookies,
            "Response": headers,
            "Document": BASE64.encode(&response.body),
            "HTML": html,
        });
        self.dispatch(SubmitEvent::Requests, link, payload).await;
    }

    /// Report a rendered document and its screenshot.
    pub async fn submit_selenium(&self, link: &Link, html: &str, screenshot: Option<&[u8]>) {
        let payload = json!({
            "[metadata]": metadata(link),
            "Timestamp": chrono::Utc::now().to_rfc3339(),
            "URL": link.url.as_str(),
            "Document": html,
            "Screenshot": screenshot.map(|png| BASE64.encode(png)),
        });
        self.dispatch(SubmitEvent::Selenium, link, payload).await;
    }
}

/// Link identity block shared by all three payloads.
fn metadata(link: &Link) -> Value {
    json!({
        "url": link.url.as_str(),
        "proxy": link.proxy.as_str(),
        "host": link.host,
        "base": format!("{}/{}/{}", link.proxy, link.scheme(), link.host),
        "name": link.hash.to_string(),
    })
}
