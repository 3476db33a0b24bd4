//! The per-URL worker loop. A worker owns a URL only between dequeue and the
//! terminal `mark_done`/`mark_failed`; everything else it touches is shared
//! and synchronized elsewhere.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::frontier::{EnqueueOutcome, Frontier};
use super::{CrawlError, PageProcessor};

/// Worker-observable state used by the scaling loop: whether the worker has
/// entered its dequeue loop, and for how long it has been idle.
#[derive(Debug)]
pub struct WorkerState {
    ready: AtomicBool,
    idle_since: Mutex<Option<Instant>>,
    pub cancel: CancellationToken,
}

impl WorkerState {
    pub fn new(cancel: CancellationToken) -> Self {
        WorkerState {
            ready: AtomicBool::new(false),
            idle_since: Mutex::new(None),
            cancel,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// How long this worker has been waiting for work, if it is waiting.
    pub fn idle_for(&self) -> Option<Duration> {
        self.idle_since
            .lock()
            .unwrap()
            .map(|since| since.elapsed())
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    fn set_idle(&self) {
        let mut idle = self.idle_since.lock().unwrap();
        if idle.is_none() {
            *idle = Some(Instant::now());
        }
    }

    fn set_busy(&self) {
        *self.idle_since.lock().unwrap() = None;
    }
}

/// Shared per-job accounting plus the fatal-error slot that tears the whole
/// site job down.
#[derive(Debug, Default)]
pub struct JobCounters {
    pages_crawled: AtomicU32,
    pages_failed: AtomicU32,
    fatal: Mutex<Option<String>>,
}

impl JobCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pages_crawled(&self) -> u32 {
        self.pages_crawled.load(Ordering::Relaxed)
    }

    pub fn pages_failed(&self) -> u32 {
        self.pages_failed.load(Ordering::Relaxed)
    }

    pub fn fatal(&self) -> Option<String> {
        self.fatal.lock().unwrap().clone()
    }

    fn count_crawled(&self) {
        self.pages_crawled.fetch_add(1, Ordering::Relaxed);
    }

    fn count_failed(&self) {
        self.pages_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn set_fatal(&self, msg: String) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            *fatal = Some(msg);
        }
    }
}

pub struct Worker {
    pub id: usize,
    pub frontier: Arc<Frontier>,
    pub processor: Arc<PageProcessor>,
    pub state: Arc<WorkerState>,
    pub counters: Arc<JobCounters>,
    pub crawl_delay: Duration,
}

impl Worker {
    /// Pull tasks until the frontier closes or the worker is told to stop.
    /// A failing URL never takes the worker down with it.
    pub async fn run(self) {
        self.state.mark_ready();
        let mut first_request = true;

        loop {
            self.state.set_idle();
            let task = tokio::select! {
                _ = self.state.cancel.cancelled() => break,
                task = self.frontier.dequeue() => task,
            };
            let Some(task) = task else { break };
            self.state.set_busy();

            if !first_request && !self.crawl_delay.is_zero() {
                tokio::time::sleep(self.crawl_delay).await;
            }
            first_request = false;

            match self.processor.process(&task).await {
                Ok(outcome) => {
                    let status = outcome
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "---".to_string());
                    println!(
                        "[Worker-{}] {} {} ({} ms{})",
                        self.id,
                        status,
                        task.url,
                        outcome.elapsed_ms,
                        if outcome.rendered { ", rendered" } else { "" }
                    );

                    for link in &outcome.new_links {
                        if self.frontier.enqueue(link, Some(&task.url), task.depth + 1)
                            == EnqueueOutcome::QueueFull
                        {
                            tracing::warn!(url = %link, "frontier full, dropping link");
                        }
                    }

                    if outcome.fetched_ok {
                        self.counters.count_crawled();
                        self.frontier.mark_done(&task.url);
                    } else {
                        self.counters.count_failed();
                        self.frontier.mark_failed(&task.url);
                    }
                }
                Err(CrawlError::Store(e)) => {
                    // The database being gone dooms the site job, not just
                    // this URL. Flag it and stop pulling work.
                    tracing::error!(url = %task.url, error = %e, "store unavailable");
                    self.counters.count_failed();
                    self.counters.set_fatal(format!("database unavailable: {e}"));
                    self.frontier.mark_failed(&task.url);
                    break;
                }
                Err(e) => {
                    tracing::warn!(url = %task.url, error = %e, "page processing failed");
                    self.counters.count_failed();
                    self.frontier.mark_failed(&task.url);
                }
            }
        }

        self.state.set_idle();
        tracing::debug!(worker = self.id, "worker stopped");
    }
}
