//! Per-site URL frontier: a bounded FIFO task queue plus the `visited` and
//! `in_progress` membership sets, all guarded by a single mutex. Dedup is
//! strictly by canonical URL, and a URL is in exactly one state at a time.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Notify;

use super::blocklist::{BlockClassifier, BlockRule, BlockStats};
use super::canonical::{canonicalize_in_scope, CanonicalError, SiteScope};

pub const DEFAULT_FRONTIER_CAPACITY: usize = 10_000;

/// A unit of crawl work. The URL is always canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierTask {
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: u32,
}

/// Outcome of an enqueue attempt. Only `Queued` adds work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Duplicate,
    Blocked(BlockRule),
    OutOfScope,
    Invalid,
    QueueFull,
    Closed,
}

impl EnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued)
    }
}

struct Inner {
    queue: VecDeque<FrontierTask>,
    /// Mirror of `queue` membership for O(1) dedup checks.
    queued: HashSet<String>,
    visited: HashSet<String>,
    in_progress: HashSet<String>,
    closed: bool,
}

pub struct Frontier {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    scope: SiteScope,
    classifier: Arc<BlockClassifier>,
    stats: Arc<BlockStats>,
}

impl Frontier {
    pub fn new(
        scope: SiteScope,
        classifier: Arc<BlockClassifier>,
        stats: Arc<BlockStats>,
        capacity: usize,
    ) -> Self {
        Frontier {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                visited: HashSet::new(),
                in_progress: HashSet::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            scope,
            classifier,
            stats,
        }
    }

    /// Canonicalize, filter and append a URL. Discards (and counts) anything
    /// invalid, out of scope, blocked, already known or overflowing.
    pub fn enqueue(&self, raw_url: &str, parent_url: Option<&str>, depth: u32) -> EnqueueOutcome {
        let canonical = match canonicalize_in_scope(raw_url, &self.scope) {
            Ok(c) => c,
            Err(CanonicalError::OutOfScope(_)) => {
                self.stats.count_out_of_scope();
                return EnqueueOutcome::OutOfScope;
            }
            Err(CanonicalError::InvalidUrl(_)) => {
                self.stats.count_invalid();
                return EnqueueOutcome::Invalid;
            }
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return EnqueueOutcome::Closed;
        }
        if inner.visited.contains(&canonical)
            || inner.in_progress.contains(&canonical)
            || inner.queued.contains(&canonical)
        {
            return EnqueueOutcome::Duplicate;
        }
        if let Some(rule) = self.classifier.classify(&canonical) {
            // Blocked URLs go straight to visited so they are never retried.
            inner.visited.insert(canonical);
            self.stats.count_rule(rule);
            return EnqueueOutcome::Blocked(rule);
        }
        if inner.queue.len() >= self.capacity {
            self.stats.count_queue_full();
            return EnqueueOutcome::QueueFull;
        }

        inner.queued.insert(canonical.clone());
        inner.queue.push_back(FrontierTask {
            url: canonical,
            parent_url: parent_url.map(|p| p.to_string()),
            depth,
        });
        drop(inner);
        // Wake every registered waiter; each re-checks the queue under the
        // lock, and a waiter that loses the race re-registers before it
        // sleeps again.
        self.notify.notify_waiters();
        EnqueueOutcome::Queued
    }

    /// Wait for the next task. Atomically moves the URL into `in_progress`.
    /// Returns `None` once the frontier has been closed.
    pub async fn dequeue(&self) -> Option<FrontierTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register in the wait list before checking the queue. A plain
            // `Notified` future only registers on first poll, and
            // `notify_waiters` wakes registered waiters only, so checking
            // first would let a notification slip through and park this
            // worker with work still queued.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return None;
                }
                if let Some(task) = inner.queue.pop_front() {
                    inner.queued.remove(&task.url);
                    inner.in_progress.insert(task.url.clone());
                    return Some(task);
                }
            }
            notified.await;
        }
    }

    /// Completed work: the URL becomes permanently visited.
    pub fn mark_done(&self, url: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_progress.remove(url);
        inner.visited.insert(url.to_string());
    }

    /// Permanently failed work. Same terminal state as `mark_done`; the
    /// distinction lives in the caller's counters.
    pub fn mark_failed(&self, url: &str) {
        self.mark_done(url);
    }

    /// Give the URL back to the head of the queue. The retry budget is the
    /// caller's to enforce.
    pub fn mark_retry(&self, url: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.in_progress.remove(url) {
            return;
        }
        let task = FrontierTask {
            url: url.to_string(),
            parent_url: None,
            depth: 0,
        };
        inner.queued.insert(url.to_string());
        inner.queue.push_front(task);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Queued plus in-flight work. Zero (with all workers idle) signals drain.
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.queue.len() + inner.in_progress.len()
    }

    pub fn visited_count(&self) -> usize {
        self.inner.lock().unwrap().visited.len()
    }

    /// Close the frontier: all current and future `dequeue` calls return
    /// `None` immediately.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frontier() -> Frontier {
        let scope = SiteScope::from_seed("https://x.test/").unwrap();
        Frontier::new(
            scope,
            Arc::new(BlockClassifier::new()),
            Arc::new(BlockStats::new()),
            DEFAULT_FRONTIER_CAPACITY,
        )
    }

    #[tokio::test]
    async fn test_enqueue_dedup_across_variants() {
        let f = frontier();
        assert!(f.enqueue("https://x.test/a", None, 0).is_queued());
        assert_eq!(
            f.enqueue("http://x.test/a/", None, 0),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(
            f.enqueue("https://www.x.test/a?utm_source=y", None, 0),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(f.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_moves_to_in_progress() {
        let f = frontier();
        f.enqueue("https://x.test/a", None, 0);
        let task = f.dequeue().await.unwrap();
        assert_eq!(task.url, "https://x.test/a");
        // Still pending while in flight, and not re-enqueueable.
        assert_eq!(f.pending_count(), 1);
        assert_eq!(
            f.enqueue("https://x.test/a", None, 1),
            EnqueueOutcome::Duplicate
        );

        f.mark_done(&task.url);
        assert_eq!(f.pending_count(), 0);
        assert_eq!(
            f.enqueue("https://x.test/a", None, 1),
            EnqueueOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_blocked_urls_marked_visited() {
        let f = frontier();
        assert_eq!(
            f.enqueue("https://x.test/page/42/", None, 0),
            EnqueueOutcome::Blocked(BlockRule::Pagination)
        );
        assert_eq!(f.pending_count(), 0);
        assert_eq!(f.visited_count(), 1);
        assert_eq!(
            f.enqueue("https://x.test/page/42/", None, 0),
            EnqueueOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_out_of_scope_and_invalid() {
        let f = frontier();
        assert_eq!(
            f.enqueue("https://other.test/a", None, 0),
            EnqueueOutcome::OutOfScope
        );
        assert_eq!(f.enqueue("mailto:a@b", None, 0), EnqueueOutcome::Invalid);
        assert_eq!(f.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let scope = SiteScope::from_seed("https://x.test/").unwrap();
        let f = Frontier::new(
            scope,
            Arc::new(BlockClassifier::new()),
            Arc::new(BlockStats::new()),
            2,
        );
        assert!(f.enqueue("https://x.test/1", None, 0).is_queued());
        assert!(f.enqueue("https://x.test/2", None, 0).is_queued());
        assert_eq!(
            f.enqueue("https://x.test/3", None, 0),
            EnqueueOutcome::QueueFull
        );
        assert_eq!(f.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_close_unblocks_waiters() {
        let f = Arc::new(frontier());
        let waiter = {
            let f = f.clone();
            tokio::spawn(async move { f.dequeue().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        f.close();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(
            f.enqueue("https://x.test/late", None, 0),
            EnqueueOutcome::Closed
        );
    }

    #[tokio::test]
    async fn test_enqueue_wakes_blocked_waiter() {
        let f = Arc::new(frontier());
        let waiter = {
            let f = f.clone();
            tokio::spawn(async move { f.dequeue().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(f.enqueue("https://x.test/later", None, 0).is_queued());
        let task = waiter.await.unwrap().unwrap();
        assert_eq!(task.url, "https://x.test/later");
    }

    #[tokio::test]
    async fn test_mark_retry_requeues_at_head() {
        let f = frontier();
        f.enqueue("https://x.test/a", None, 0);
        f.enqueue("https://x.test/b", None, 0);
        let a = f.dequeue().await.unwrap();
        assert_eq!(a.url, "https://x.test/a");
        f.mark_retry(&a.url);
        let again = f.dequeue().await.unwrap();
        assert_eq!(again.url, "https://x.test/a");
    }

    #[tokio::test]
    async fn test_at_most_one_in_flight() {
        let f = Arc::new(frontier());
        for i in 0..50 {
            f.enqueue(&format!("https://x.test/p{i}"), None, 0);
        }
        let mut handles = Vec::new();
        for _ in 0..8 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(task) = f.dequeue().await {
                    seen.push(task.url.clone());
                    tokio::task::yield_now().await;
                    f.mark_done(&task.url);
                    if f.pending_count() == 0 {
                        f.close();
                    }
                }
                seen
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 50, "every URL fetched exactly once");
        assert_eq!(unique.len(), 50);
    }
}
