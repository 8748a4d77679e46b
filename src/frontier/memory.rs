//! In-process frontier backend
//!
//! Queue state lives in a mutex-guarded ordered map per queue; locks,
//! hosts and the visit log use concurrent maps. Suitable for
//! single-process deployments and tests; multi-process deployments use
//! the redis backend instead.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{CrawlError, Result};
use crate::link::{Link, LinkDigest};

use super::{FrontierStore, HostFlags, LockToken, Queue, VisitKind};

/// How often a blocked lock acquisition re-polls.
const LOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct Record {
    link: Link,
    enqueue: SystemTime,
    not_before: Option<SystemTime>,
}

impl Record {
    fn ready(&self, now: SystemTime) -> bool {
        match self.not_before {
            Some(at) => at <= now,
            None => true,
        }
    }
}

/// One queue: records keyed by digest plus an ordering index keyed by
/// (enqueue time, digest), which yields FIFO with hash tie-break.
#[derive(Default)]
struct QueueState {
    records: HashMap<LinkDigest, Record>,
    order: BTreeMap<(SystemTime, LinkDigest), LinkDigest>,
}

impl QueueState {
    fn insert(&mut self, record: Record) {
        let hash = record.link.hash;
        if let Some(old) = self.records.insert(hash, record) {
            self.order.remove(&(old.enqueue, hash));
        }
        let enqueue = self.records[&hash].enqueue;
        self.order.insert((enqueue, hash), hash);
    }

    fn remove(&mut self, hash: LinkDigest) {
        if let Some(old) = self.records.remove(&hash) {
            self.order.remove(&(old.enqueue, hash));
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HostEntry {
    #[allow(dead_code)]
    first_seen: SystemTime,
    flags: HostFlags,
}

#[derive(Debug, Clone, Copy, Default)]
struct VisitEntry {
    fetched: Option<SystemTime>,
    rendered: Option<SystemTime>,
}

/// In-memory implementation of the frontier contract.
pub struct MemoryFrontier {
    fetch: Mutex<QueueState>,
    render: Mutex<QueueState>,
    hosts: DashMap<String, HostEntry>,
    visits: DashMap<LinkDigest, VisitEntry>,
    locks: DashMap<LinkDigest, String>,
}

impl MemoryFrontier {
    pub fn new() -> Self {
        Self {
            fetch: Mutex::new(QueueState::default()),
            render: Mutex::new(QueueState::default()),
            hosts: DashMap::new(),
            visits: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn queue(&self, queue: Queue) -> &Mutex<QueueState> {
        match queue {
            Queue::Fetch => &self.fetch,
            Queue::Render => &self.render,
        }
    }
}

impl Default for MemoryFrontier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrontierStore for MemoryFrontier {
    async fn add_many(&self, queue: Queue, links: &[Link]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }
        let now = SystemTime::now();
        let mut state = self.queue(queue).lock();
        for link in links {
            match state.records.get(&link.hash) {
                // still backing off: leave the existing entry alone
                Some(existing) if !existing.ready(now) => continue,
                _ => {}
            }
            state.insert(Record {
                link: link.clone(),
                enqueue: now,
                not_before: None,
            });
        }
        Ok(())
    }

    async fn requeue(&self, queue: Queue, link: &Link, delay: Duration) -> Result<()> {
        let now = SystemTime::now();
        let mut state = self.queue(queue).lock();
        state.insert(Record {
            link: link.clone(),
            enqueue: now,
            not_before: Some(now + delay),
        });
        Ok(())
    }

    async fn pop(&self, queue: Queue, max: usize) -> Result<Vec<Link>> {
        let now = SystemTime::now();
        let mut state = self.queue(queue).lock();

        let ready: Vec<LinkDigest> = state
            .order
            .values()
            .filter(|hash| state.records[hash].ready(now))
            .take(max)
            .copied()
            .collect();

        let mut links = Vec::with_capacity(ready.len());
        for hash in ready {
            if let Some(record) = state.records.get(&hash) {
                links.push(record.link.clone());
            }
            state.remove(hash);
        }
        Ok(links)
    }

    async fn drop_link(&self, queue: Queue, link: &Link) -> Result<()> {
        self.queue(queue).lock().remove(link.hash);
        Ok(())
    }

    async fn queue_len(&self, queue: Queue) -> Result<usize> {
        Ok(self.queue(queue).lock().records.len())
    }

    async fn ready_len(&self, queue: Queue) -> Result<usize> {
        let now = SystemTime::now();
        let state = self.queue(queue).lock();
        Ok(state.records.values().filter(|r| r.ready(now)).count())
    }

    async fn has_host(&self, host: &str) -> Result<bool> {
        Ok(self.hosts.contains_key(host))
    }

    async fn mark_host(&self, host: &str, flags: HostFlags) -> Result<()> {
        self.hosts
            .entry(host.to_string())
            .and_modify(|entry| {
                entry.flags.robots_fetched |= flags.robots_fetched;
                entry.flags.sitemap_fetched |= flags.sitemap_fetched;
            })
            .or_insert(HostEntry {
                first_seen: SystemTime::now(),
                flags,
            });
        Ok(())
    }

    async fn record_visit(&self, hash: LinkDigest, kind: VisitKind, at: SystemTime) -> Result<()> {
        let mut entry = self.visits.entry(hash).or_default();
        let slot = match kind {
            VisitKind::Fetched => &mut entry.fetched,
            VisitKind::Rendered => &mut entry.rendered,
        };
        if slot.map(|prev| at >= prev).unwrap_or(true) {
            *slot = Some(at);
        }
        Ok(())
    }

    async fn last_visit(&self, hash: LinkDigest, kind: VisitKind) -> Result<Option<SystemTime>> {
        Ok(self.visits.get(&hash).and_then(|entry| match kind {
            VisitKind::Fetched => entry.fetched,
            VisitKind::Rendered => entry.rendered,
        }))
    }

    async fn acquire_lock(
        &self,
        hash: LinkDigest,
        timeout: Option<Duration>,
    ) -> Result<LockToken> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);

        loop {
            let mut acquired = false;
            self.locks.entry(hash).or_insert_with(|| {
                acquired = true;
                token.clone()
            });
            if acquired {
                return Ok(LockToken { hash, token });
            }
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    return Err(CrawlError::LockBusy);
                }
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    async fn release_lock(&self, token: LockToken) -> Result<()> {
        self.locks
            .remove_if(&token.hash, |_, held| *held == token.token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(url: &str) -> Link {
        Link::parse(url).unwrap()
    }

    #[tokio::test]
    async fn add_and_pop_fifo() {
        let frontier = MemoryFrontier::new();
        let a = link("https://example.com/a");
        let b = link("https://example.com/b");

        frontier.add_many(Queue::Fetch, &[a.clone()]).await.unwrap();
        frontier.add_many(Queue::Fetch, &[b.clone()]).await.unwrap();

        let popped = frontier.pop(Queue::Fetch, 10).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(popped[0], a);
        assert_eq!(popped[1], b);
        assert_eq!(frontier.queue_len(Queue::Fetch).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let frontier = MemoryFrontier::new();
        let a = link("https://example.com/a");

        frontier
            .add_many(Queue::Fetch, &[a.clone(), a.clone()])
            .await
            .unwrap();
        frontier.add_many(Queue::Fetch, &[a.clone()]).await.unwrap();

        assert_eq!(frontier.queue_len(Queue::Fetch).await.unwrap(), 1);
        assert_eq!(frontier.pop(Queue::Fetch, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pop_respects_max_cap() {
        let frontier = MemoryFrontier::new();
        for i in 0..5 {
            frontier
                .add_many(Queue::Fetch, &[link(&format!("https://example.com/{}", i))])
                .await
                .unwrap();
        }
        let popped = frontier.pop(Queue::Fetch, 3).await.unwrap();
        assert_eq!(popped.len(), 3);
        assert_eq!(frontier.queue_len(Queue::Fetch).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn requeue_hides_entry_until_backoff_expires() {
        let frontier = MemoryFrontier::new();
        let a = link("https://example.com/a");

        frontier
            .requeue(Queue::Fetch, &a, Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(frontier.pop(Queue::Fetch, 10).await.unwrap().is_empty());
        assert_eq!(frontier.queue_len(Queue::Fetch).await.unwrap(), 1);
        assert_eq!(frontier.ready_len(Queue::Fetch).await.unwrap(), 0);

        // an add during the backoff window must not reset the delay
        frontier.add_many(Queue::Fetch, &[a.clone()]).await.unwrap();
        assert!(frontier.pop(Queue::Fetch, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_with_zero_delay_is_immediately_ready() {
        let frontier = MemoryFrontier::new();
        let a = link("https://example.com/a");
        frontier
            .requeue(Queue::Fetch, &a, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(frontier.ready_len(Queue::Fetch).await.unwrap(), 1);
        assert_eq!(frontier.pop(Queue::Fetch, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drop_link_is_idempotent() {
        let frontier = MemoryFrontier::new();
        let a = link("https://example.com/a");
        frontier.add_many(Queue::Render, &[a.clone()]).await.unwrap();
        frontier.drop_link(Queue::Render, &a).await.unwrap();
        frontier.drop_link(Queue::Render, &a).await.unwrap();
        assert_eq!(frontier.queue_len(Queue::Render).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queues_are_independent() {
        let frontier = MemoryFrontier::new();
        let a = link("https://example.com/a");
        frontier.add_many(Queue::Fetch, &[a.clone()]).await.unwrap();
        frontier.add_many(Queue::Render, &[a.clone()]).await.unwrap();
        assert_eq!(frontier.queue_len(Queue::Fetch).await.unwrap(), 1);
        assert_eq!(frontier.queue_len(Queue::Render).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn host_flags_accumulate() {
        let frontier = MemoryFrontier::new();
        assert!(!frontier.has_host("example.com").await.unwrap());

        frontier
            .mark_host(
                "example.com",
                HostFlags { robots_fetched: true, sitemap_fetched: false },
            )
            .await
            .unwrap();
        frontier
            .mark_host(
                "example.com",
                HostFlags { robots_fetched: false, sitemap_fetched: true },
            )
            .await
            .unwrap();

        assert!(frontier.has_host("example.com").await.unwrap());
        let entry = frontier.hosts.get("example.com").unwrap();
        assert!(entry.flags.robots_fetched);
        assert!(entry.flags.sitemap_fetched);
    }

    #[tokio::test]
    async fn visit_log_is_monotonic() {
        let frontier = MemoryFrontier::new();
        let hash = link("https://example.com/a").hash;
        let now = SystemTime::now();
        let earlier = now - Duration::from_secs(60);

        frontier
            .record_visit(hash, VisitKind::Fetched, now)
            .await
            .unwrap();
        frontier
            .record_visit(hash, VisitKind::Fetched, earlier)
            .await
            .unwrap();

        assert_eq!(
            frontier.last_visit(hash, VisitKind::Fetched).await.unwrap(),
            Some(now)
        );
        assert_eq!(
            frontier.last_visit(hash, VisitKind::Rendered).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn lock_excludes_second_holder() {
        let frontier = MemoryFrontier::new();
        let hash = link("https://example.com/a").hash;

        let token = frontier.acquire_lock(hash, None).await.unwrap();
        let busy = frontier
            .acquire_lock(hash, Some(Duration::from_millis(120)))
            .await;
        assert!(matches!(busy, Err(CrawlError::LockBusy)));

        frontier.release_lock(token).await.unwrap();
        let token = frontier
            .acquire_lock(hash, Some(Duration::from_millis(120)))
            .await
            .unwrap();
        frontier.release_lock(token).await.unwrap();
    }

    #[tokio::test]
    async fn stale_release_does_not_unlock_new_holder() {
        let frontier = MemoryFrontier::new();
        let hash = link("https://example.com/a").hash;

        let first = frontier.acquire_lock(hash, None).await.unwrap();
        let stale = LockToken { hash, token: "stale".to_string() };
        frontier.release_lock(stale).await.unwrap();

        // the real holder is still in place
        let busy = frontier
            .acquire_lock(hash, Some(Duration::from_millis(80)))
            .await;
        assert!(matches!(busy, Err(CrawlError::LockBusy)));
        frontier.release_lock(first).await.unwrap();
    }
}
