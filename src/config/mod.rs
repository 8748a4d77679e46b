//! Configuration for the crawling engine
//!
//! The configuration surface is a flat set of environment variables
//! (all durations in seconds); `Config::from_env` assembles them into a
//! typed tree and `validate` collects every error in one pass so the
//! operator can fix the whole environment at once.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Default user agent base for all HTTP traffic. The transport layer
/// appends the proxy family, e.g. `darkmap/0.1.0 (Tor Proxy)`.
pub const DEFAULT_USER_AGENT: &str = concat!("darkmap/", env!("CARGO_PKG_VERSION"));

/// Sentinel HTML produced by the renderer for pages that never loaded.
pub const EMPTY_PAGE: &str = "<html><head></head><body></body></html>";

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Flag variables follow the `0`/`1` convention.
fn env_flag(key: &str, default: bool) -> bool {
    match env_string(key).as_deref() {
        Some(v) => v == "1",
        None => default,
    }
}

/// Seconds value where a non-finite number means "unbounded".
fn env_secs(key: &str, default: f64) -> Option<f64> {
    let value = env_parse(key, default);
    value.is_finite().then_some(value)
}

/// JSON array of strings, e.g. `LINK_BLACK_LIST='[".*\\.gov"]'`.
fn env_json_list(key: &str) -> Vec<String> {
    match env_string(key) {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("Ignoring malformed {}: {}", key, e);
                Vec::new()
            }
        },
        None => Vec::new(),
    }
}

fn secs_to_duration(secs: Option<f64>) -> Option<Duration> {
    secs.map(Duration::from_secs_f64)
}

/// Frontier store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierConfig {
    /// Maximum links popped per round (`MAX_POOL`).
    pub max_pool: usize,
    /// Bulk insert chunk size (`BULK_SIZE`).
    pub bulk_size: usize,
    /// Lock acquisition budget in seconds (`LOCK_TIMEOUT`); non-finite
    /// means block forever.
    pub lock_timeout_secs: Option<f64>,
    /// Backend retry interval in seconds (`RETRY_INTERVAL`).
    pub retry_interval_secs: f64,
    /// Redis connection URL (`REDIS_URL`); absent selects the
    /// in-process backend.
    pub redis_url: Option<String>,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            max_pool: 100,
            bulk_size: 100,
            lock_timeout_secs: Some(10.0),
            retry_interval_secs: 10.0,
            redis_url: None,
        }
    }
}

impl FrontierConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        secs_to_duration(self.lock_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.retry_interval_secs)
    }
}

/// Worker pool and round loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker parallelism degree (`DARC_CPU`).
    pub cpu: usize,
    /// Parallel process-pool mode (`DARC_MULTIPROCESSING`).
    pub multiprocessing: bool,
    /// Parallel thread-pool mode (`DARC_MULTITHREADING`).
    pub multithreading: bool,
    /// Empty-queue sleep in seconds (`DARC_WAIT`).
    pub wait_secs: Option<f64>,
    /// Exit after one drained round (`DARC_REBOOT`).
    pub reboot: bool,
    /// Ignore robots.txt (`DARC_FORCE`).
    pub force: bool,
    /// Debug mode (`DARC_DEBUG`).
    pub debug: bool,
    /// Verbose mode (`DARC_VERBOSE`, implied by debug).
    pub verbose: bool,
    /// Filter extracted links before enqueueing (`DARC_CHECK`).
    pub check: bool,
    /// HEAD-check extracted links' content type (`DARC_CHECK_CONTENT_TYPE`).
    pub check_ng: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu: default_parallelism(),
            multiprocessing: true,
            multithreading: false,
            wait_secs: Some(60.0),
            reboot: false,
            force: false,
            debug: false,
            verbose: false,
            check: false,
            check_ng: false,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl SchedulerConfig {
    pub fn wait(&self) -> Duration {
        secs_to_duration(self.wait_secs).unwrap_or(Duration::from_secs(60))
    }

    /// Whether workers run in parallel at all.
    pub fn parallel(&self) -> bool {
        self.multiprocessing || self.multithreading
    }
}

/// White/black list patterns and fallback polarities for the gates.
///
/// A `true` fallback denies anything neither list matched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    pub link_white_list: Vec<String>,
    pub link_black_list: Vec<String>,
    pub link_fallback: bool,
    pub mime_white_list: Vec<String>,
    pub mime_black_list: Vec<String>,
    pub mime_fallback: bool,
    pub proxy_white_list: Vec<String>,
    pub proxy_black_list: Vec<String>,
    pub proxy_fallback: bool,
}

/// Freshness window and renderer settle time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Freshness window in seconds (`TIME_CACHE`); non-finite means the
    /// window never expires (every URL processed at most once).
    pub time_cache_secs: Option<f64>,
    /// Extra wait after document-ready in seconds (`SE_WAIT`).
    pub se_wait_secs: Option<f64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            time_cache_secs: Some(60.0),
            se_wait_secs: Some(60.0),
        }
    }
}

impl CacheConfig {
    pub fn time_cache(&self) -> Option<Duration> {
        secs_to_duration(self.time_cache_secs)
    }

    pub fn se_wait(&self) -> Option<Duration> {
        secs_to_duration(self.se_wait_secs)
    }

    /// Backoff applied when a link is re-enqueued after a transient
    /// failure. Falls back to one minute when the window is unbounded.
    pub fn backoff(&self) -> Duration {
        self.time_cache().unwrap_or(Duration::from_secs(60))
    }
}

/// Local proxy daemon endpoints, one per transport family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Tor SOCKS5 port (`TOR_PORT`).
    pub tor_port: u16,
    /// I2P HTTP proxy port (`I2P_PORT`).
    pub i2p_port: u16,
    /// ZeroNet gateway port (`ZERONET_PORT`).
    pub zeronet_port: u16,
    /// Freenet gateway port (`FREENET_PORT`).
    pub freenet_port: u16,
    /// Request timeout in seconds for plain fetches (`DARC_TIMEOUT`).
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tor_port: 9050,
            i2p_port: 4444,
            zeronet_port: 43110,
            freenet_port: 8888,
            request_timeout_secs: 60,
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Data storage root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for artifacts (`PATH_DATA`).
    pub path_data: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path_data: PathBuf::from("data"),
        }
    }
}

/// Submission API endpoints. A `None` endpoint writes JSON locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitConfig {
    pub api_new_host: Option<String>,
    pub api_requests: Option<String>,
    pub api_selenium: Option<String>,
    /// Retry budget per submission (`API_RETRY`).
    pub api_retry: u32,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            api_new_host: None,
            api_requests: None,
            api_selenium: None,
            api_retry: 3,
        }
    }
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub frontier: FrontierConfig,
    pub scheduler: SchedulerConfig,
    pub filters: FilterConfig,
    pub cache: CacheConfig,
    pub proxy: ProxyConfig,
    pub storage: StorageConfig,
    pub submit: SubmitConfig,
    /// User agent base (`DARKMAP_UA`).
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frontier: FrontierConfig::default(),
            scheduler: SchedulerConfig::default(),
            filters: FilterConfig::default(),
            cache: CacheConfig::default(),
            proxy: ProxyConfig::default(),
            storage: StorageConfig::default(),
            submit: SubmitConfig::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Config {
    /// Assemble the configuration from the environment.
    pub fn from_env() -> Self {
        let debug = env_flag("DARC_DEBUG", false);
        Self {
            frontier: FrontierConfig {
                max_pool: env_parse("MAX_POOL", 100),
                bulk_size: env_parse("BULK_SIZE", 100),
                lock_timeout_secs: env_secs("LOCK_TIMEOUT", 10.0),
                retry_interval_secs: env_parse("RETRY_INTERVAL", 10.0),
                redis_url: env_string("REDIS_URL"),
            },
            scheduler: SchedulerConfig {
                cpu: env_parse("DARC_CPU", default_parallelism()),
                multiprocessing: env_flag("DARC_MULTIPROCESSING", true),
                multithreading: env_flag("DARC_MULTITHREADING", false),
                wait_secs: env_secs("DARC_WAIT", 60.0),
                reboot: env_flag("DARC_REBOOT", false),
                force: env_flag("DARC_FORCE", false),
                debug,
                verbose: env_flag("DARC_VERBOSE", false) || debug,
                check: env_flag("DARC_CHECK", false) || env_flag("DARC_CHECK_CONTENT_TYPE", false),
                check_ng: env_flag("DARC_CHECK_CONTENT_TYPE", false),
            },
            filters: FilterConfig {
                link_white_list: env_json_list("LINK_WHITE_LIST"),
                link_black_list: env_json_list("LINK_BLACK_LIST"),
                link_fallback: env_flag("LINK_FALLBACK", false),
                mime_white_list: env_json_list("MIME_WHITE_LIST"),
                mime_black_list: env_json_list("MIME_BLACK_LIST"),
                mime_fallback: env_flag("MIME_FALLBACK", false),
                proxy_white_list: env_json_list("PROXY_WHITE_LIST"),
                proxy_black_list: env_json_list("PROXY_BLACK_LIST"),
                proxy_fallback: env_flag("PROXY_FALLBACK", false),
            },
            cache: CacheConfig {
                time_cache_secs: env_secs("TIME_CACHE", 60.0),
                se_wait_secs: env_secs("SE_WAIT", 60.0),
            },
            proxy: ProxyConfig {
                tor_port: env_parse("TOR_PORT", 9050),
                i2p_port: env_parse("I2P_PORT", 4444),
                zeronet_port: env_parse("ZERONET_PORT", 43110),
                freenet_port: env_parse("FREENET_PORT", 8888),
                request_timeout_secs: env_parse("DARC_TIMEOUT", 60),
            },
            storage: StorageConfig {
                path_data: PathBuf::from(
                    env_string("PATH_DATA").unwrap_or_else(|| "data".to_string()),
                ),
            },
            submit: SubmitConfig {
                api_new_host: env_string("API_NEW_HOST"),
                api_requests: env_string("API_REQUESTS"),
                api_selenium: env_string("API_SELENIUM"),
                api_retry: env_parse("API_RETRY", 3),
            },
            user_agent: env_string("DARKMAP_UA").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }

    /// Validate all fields, collecting every error before reporting.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.scheduler.multiprocessing && self.scheduler.multithreading {
            errors.push(
                "cannot enable multiprocessing and multithreading at the same time".to_string(),
            );
        }
        if self.scheduler.cpu == 0 {
            errors.push("DARC_CPU must be positive".to_string());
        }
        if self.frontier.max_pool == 0 {
            errors.push("MAX_POOL must be positive".to_string());
        }
        if self.frontier.bulk_size == 0 {
            errors.push("BULK_SIZE must be positive".to_string());
        }
        if self.storage.path_data.as_os_str().is_empty() {
            errors.push("PATH_DATA must not be empty".to_string());
        }
        if let Some(secs) = self.cache.time_cache_secs {
            if secs < 0.0 {
                errors.push("TIME_CACHE must be non-negative".to_string());
            }
        }
        if let Some(secs) = self.cache.se_wait_secs {
            if secs < 0.0 {
                errors.push("SE_WAIT must be non-negative".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}
