//! URL frontier
//!
//! The frontier mediates all cross-worker state: the two pending
//! queues, the hosts-seen set, the visit log and the per-link locks.
//! Workers never talk to each other directly.
//!
//! Two backends provide the same contract: an in-process
//! [`memory::MemoryFrontier`] for single-process deployments and tests,
//! and a [`redis::RedisFrontier`] for deployments where the crawler and
//! loader run as separate processes.

pub mod memory;
pub mod redis;

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::error::Result;
use crate::link::{Link, LinkDigest};

/// The two pending queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// URLs awaiting a plain HTTP fetch.
    Fetch,
    /// URLs that fetched successfully and await rendering.
    Render,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Render => "render",
        }
    }
}

/// Which stage a visit-log entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisitKind {
    Fetched,
    Rendered,
}

impl VisitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Rendered => "rendered",
        }
    }
}

/// Hosts-seen bookkeeping flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostFlags {
    pub robots_fetched: bool,
    pub sitemap_fetched: bool,
}

/// Opaque proof of lock ownership, returned by `acquire_lock` and
/// consumed by `release_lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub(crate) hash: LinkDigest,
    pub(crate) token: String,
}

impl LockToken {
    pub fn hash(&self) -> LinkDigest {
        self.hash
    }
}

/// Shared frontier contract.
///
/// All operations are safe under concurrent callers. Queue ordering is
/// FIFO by enqueue time with ties broken lexicographically by hash; a
/// `pop` never returns an entry whose `not-before` time is still in the
/// future.
#[async_trait]
pub trait FrontierStore: Send + Sync {
    /// Bulk-insert links with enqueue time "now". For an existing entry
    /// whose `not-before` has already passed the enqueue time is
    /// refreshed; an entry still in its backoff window is left alone.
    async fn add_many(&self, queue: Queue, links: &[Link]) -> Result<()>;

    /// Re-insert a link with `not-before = now + delay`, replacing any
    /// existing entry. Used for backoff after transient failures.
    async fn requeue(&self, queue: Queue, link: &Link, delay: Duration) -> Result<()>;

    /// Remove up to `max` ready entries in FIFO order.
    async fn pop(&self, queue: Queue, max: usize) -> Result<Vec<Link>>;

    /// Idempotent removal.
    async fn drop_link(&self, queue: Queue, link: &Link) -> Result<()>;

    /// Number of entries currently in the queue (ready or not).
    async fn queue_len(&self, queue: Queue) -> Result<usize>;

    /// Number of entries whose `not-before` time has passed, i.e. what
    /// a `pop` could return right now. Drives the reboot-mode drain
    /// check: backing-off entries do not keep the engine alive.
    async fn ready_len(&self, queue: Queue) -> Result<usize>;

    /// Whether the hostname has been onboarded before.
    async fn has_host(&self, host: &str) -> Result<bool>;

    /// Insert or update the hosts-seen entry, OR-ing the flags into any
    /// existing entry.
    async fn mark_host(&self, host: &str, flags: HostFlags) -> Result<()>;

    /// Record a visit. Timestamps are monotonically non-decreasing per
    /// entry; an older timestamp never overwrites a newer one.
    async fn record_visit(&self, hash: LinkDigest, kind: VisitKind, at: SystemTime) -> Result<()>;

    /// Timestamp of the last visit of the given kind, if any.
    async fn last_visit(&self, hash: LinkDigest, kind: VisitKind) -> Result<Option<SystemTime>>;

    /// Acquire the per-link mutual exclusion lock, blocking up to
    /// `timeout` (`None` blocks indefinitely). Fails with
    /// [`crate::error::CrawlError::LockBusy`] on expiry.
    async fn acquire_lock(
        &self,
        hash: LinkDigest,
        timeout: Option<Duration>,
    ) -> Result<LockToken>;

    /// Release a previously acquired lock. Releasing a lock that has
    /// been lost (expired and re-acquired elsewhere) is a no-op.
    async fn release_lock(&self, token: LockToken) -> Result<()>;
}

/// Is the last visit recent enough to skip reprocessing?
///
/// A `None` window means "forever": any recorded visit is fresh.
pub fn is_fresh(last: Option<SystemTime>, window: Option<Duration>, now: SystemTime) -> bool {
    match (last, window) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(at), Some(window)) => now
            .duration_since(at)
            .map(|elapsed| elapsed <= window)
            .unwrap_or(true),
    }
}
