//! Redis frontier backend
//!
//! Queues are sorted sets whose score is the entry's ready time (epoch
//! seconds): a fresh enqueue scores "now", a backoff re-enqueue scores
//! "now + delay", and popping takes members with score ≤ now in score
//! order. Members are `"<hash> <url>"` so that equal scores order
//! lexicographically by hash and the link can be rebuilt without a
//! language-specific object graph.
//!
//! Per-link locks are `SET NX PX` keys holding a random token; release
//! only deletes the key while the token still matches.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::error::{CrawlError, Result};
use crate::link::{Link, LinkDigest};

use super::{FrontierStore, HostFlags, LockToken, Queue, VisitKind};

/// How often a blocked lock acquisition re-polls.
const LOCK_POLL: Duration = Duration::from_millis(100);

/// Guard TTL for the short queue-level critical section around pop.
const QUEUE_GUARD_TTL: Duration = Duration::from_secs(30);

fn queue_key(queue: Queue) -> String {
    format!("darkmap:queue:{}", queue.as_str())
}

fn visit_key(kind: VisitKind) -> String {
    format!("darkmap:visit:{}", kind.as_str())
}

fn lock_key(hash: LinkDigest) -> String {
    format!("darkmap:lock:{}", hash)
}

fn member(link: &Link) -> String {
    format!("{} {}", link.hash, link.url)
}

fn epoch(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Redis-backed implementation of the frontier contract.
#[derive(Clone)]
pub struct RedisFrontier {
    conn: ConnectionManager,
    /// Per-link lock TTL; a liveness floor so a crashed worker cannot
    /// wedge a hash forever.
    lock_ttl: Duration,
    /// Bulk insert chunk size.
    bulk_size: usize,
}

impl RedisFrontier {
    /// Connect to the backend. Fails with `StoreUnavailable` when the
    /// server is unreachable.
    pub async fn connect(url: &str, lock_ttl: Duration, bulk_size: usize) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| CrawlError::StoreUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CrawlError::StoreUnavailable(e.to_string()))?;
        Ok(Self {
            conn,
            lock_ttl,
            bulk_size: bulk_size.max(1),
        })
    }

    /// Try to take a short-lived guard key once.
    async fn try_guard(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired)
    }

    /// Delete a guard key, but only while we still own it.
    async fn drop_guard(&self, key: &str, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let held: Option<String> = conn.get(key).await?;
        if held.as_deref() == Some(token) {
            let _: () = conn.del(key).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FrontierStore for RedisFrontier {
    async fn add_many(&self, queue: Queue, links: &[Link]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }
        let key = queue_key(queue);
        let now = epoch(SystemTime::now());
        let mut conn = self.conn.clone();

        for chunk in links.chunks(self.bulk_size) {
            // GT only moves an existing member forward in time, which is
            // exactly the dedup rule: a member still backing off keeps
            // its future score, a ready member refreshes to now.
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(&key).arg("GT").arg("CH");
            for link in chunk {
                cmd.arg(now).arg(member(link));
            }
            let _: i64 = cmd.query_async(&mut conn).await?;
        }
        Ok(())
    }

    async fn requeue(&self, queue: Queue, link: &Link, delay: Duration) -> Result<()> {
        let key = queue_key(queue);
        let score = epoch(SystemTime::now() + delay);
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(&key)
            .arg(score)
            .arg(member(link))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, queue: Queue, max: usize) -> Result<Vec<Link>> {
        let key = queue_key(queue);
        let guard_key = format!("darkmap:lock:queue:{}", queue.as_str());
        let guard_token = uuid::Uuid::new_v4().to_string();

        // Serialize competing poppers so a batch is removed atomically
        // from the observers' perspective.
        if !self.try_guard(&guard_key, &guard_token, QUEUE_GUARD_TTL).await? {
            return Ok(Vec::new());
        }

        let result = async {
            let now = epoch(SystemTime::now());
            let mut conn = self.conn.clone();

            let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&key)
                .arg("-inf")
                .arg(now)
                .arg("LIMIT")
                .arg(0)
                .arg(max as i64)
                .query_async(&mut conn)
                .await?;

            if !members.is_empty() {
                let mut cmd = redis::cmd("ZREM");
                cmd.arg(&key);
                for m in &members {
                    cmd.arg(m);
                }
                let _: i64 = cmd.query_async(&mut conn).await?;
            }

            let mut links = Vec::with_capacity(members.len());
            for m in members {
                let url = m.split_once(' ').map(|(_, url)| url).unwrap_or(&m);
                match Link::parse(url) {
                    Ok(link) => links.push(link),
                    Err(e) => tracing::warn!("Dropping undecodable queue member: {}", e),
                }
            }
            Ok(links)
        }
        .await;

        self.drop_guard(&guard_key, &guard_token).await?;
        result
    }

    async fn drop_link(&self, queue: Queue, link: &Link) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(queue_key(queue), member(link)).await?;
        Ok(())
    }

    async fn queue_len(&self, queue: Queue) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.zcard(queue_key(queue)).await?;
        Ok(len)
    }

    async fn ready_len(&self, queue: Queue) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("ZCOUNT")
            .arg(queue_key(queue))
            .arg("-inf")
            .arg(epoch(SystemTime::now()))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn has_host(&self, host: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.hexists("darkmap:hosts", host).await?;
        Ok(exists)
    }

    async fn mark_host(&self, host: &str, flags: HostFlags) -> Result<()> {
        let mut conn = self.conn.clone();
        let existing: Option<String> = conn.hget("darkmap:hosts", host).await?;
        let merged = match existing.and_then(|raw| serde_json::from_str::<StoredHost>(&raw).ok()) {
            Some(prev) => StoredHost {
                first_seen: prev.first_seen,
                robots_fetched: prev.robots_fetched || flags.robots_fetched,
                sitemap_fetched: prev.sitemap_fetched || flags.sitemap_fetched,
            },
            None => StoredHost {
                first_seen: epoch(SystemTime::now()),
                robots_fetched: flags.robots_fetched,
                sitemap_fetched: flags.sitemap_fetched,
            },
        };
        let raw = serde_json::to_string(&merged)
            .map_err(|e| CrawlError::StoreUnavailable(e.to_string()))?;
        let _: () = conn.hset("darkmap:hosts", host, raw).await?;
        Ok(())
    }

    async fn record_visit(&self, hash: LinkDigest, kind: VisitKind, at: SystemTime) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = visit_key(kind);
        let field = hash.to_string();
        let stamp = epoch(at);
        let previous: Option<f64> = conn.hget(&key, &field).await?;
        if previous.map(|prev| stamp >= prev).unwrap_or(true) {
            let _: () = conn.hset(&key, &field, stamp).await?;
        }
        Ok(())
    }

    async fn last_visit(&self, hash: LinkDigest, kind: VisitKind) -> Result<Option<SystemTime>> {
        let mut conn = self.conn.clone();
        let stamp: Option<f64> = conn.hget(visit_key(kind), hash.to_string()).await?;
        Ok(stamp.map(|s| UNIX_EPOCH + Duration::from_secs_f64(s.max(0.0))))
    }

    async fn acquire_lock(
        &self,
        hash: LinkDigest,
        timeout: Option<Duration>,
    ) -> Result<LockToken> {
        let key = lock_key(hash);
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);

        loop {
            if self.try_guard(&key, &token, self.lock_ttl).await? {
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
        self.drop_guard(&lock_key(token.hash), &token.token).await
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredHost {
    first_seen: f64,
    robots_fetched: bool,
    sitemap_fetched: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_URL: &str = "redis://127.0.0.1:6379";

    async fn test_frontier() -> Option<RedisFrontier> {
        match RedisFrontier::connect(TEST_URL, Duration::from_secs(5), 100).await {
            Ok(frontier) => Some(frontier),
            Err(_) => {
                println!("Redis not available, skipping test");
                None
            }
        }
    }

    fn link(url: &str) -> Link {
        Link::parse(url).unwrap()
    }

    #[tokio::test]
    async fn member_encoding_round_trips() {
        let l = link("https://example.com/page?q=1");
        let encoded = member(&l);
        let (hash, url) = encoded.split_once(' ').unwrap();
        assert_eq!(hash, l.hash.to_string());
        assert_eq!(Link::parse(url).unwrap(), l);
    }

    #[tokio::test]
    async fn add_pop_and_backoff() {
        let Some(frontier) = test_frontier().await else { return };
        let mut conn = frontier.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(queue_key(Queue::Fetch))
            .query_async(&mut conn)
            .await
            .unwrap();

        let a = link("https://rs-test-a.example/");
        let b = link("https://rs-test-b.example/");
        frontier
            .add_many(Queue::Fetch, &[a.clone(), b.clone()])
            .await
            .unwrap();
        assert_eq!(frontier.queue_len(Queue::Fetch).await.unwrap(), 2);

        // backoff hides a from pop
        frontier
            .requeue(Queue::Fetch, &a, Duration::from_secs(3600))
            .await
            .unwrap();
        let popped = frontier.pop(Queue::Fetch, 10).await.unwrap();
        assert_eq!(popped, vec![b]);

        frontier.drop_link(Queue::Fetch, &a).await.unwrap();
        assert_eq!(frontier.queue_len(Queue::Fetch).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lock_round_trip() {
        let Some(frontier) = test_frontier().await else { return };
        let hash = link("https://rs-test-lock.example/").hash;

        let token = frontier.acquire_lock(hash, None).await.unwrap();
        let busy = frontier
            .acquire_lock(hash, Some(Duration::from_millis(250)))
            .await;
        assert!(matches!(busy, Err(CrawlError::LockBusy)));

        frontier.release_lock(token).await.unwrap();
        let token = frontier
            .acquire_lock(hash, Some(Duration::from_millis(250)))
            .await
            .unwrap();
        frontier.release_lock(token).await.unwrap();
    }
}
