//! Site job lifecycle: seed resolution, worker pool with dynamic scaling,
//! drain detection, and the multi-site scheduler that caps how many site
//! jobs run at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::compare::ComparePolicy;
use crate::config::Config;
use crate::crawler::blocklist::{BlockClassifier, BlockStats};
use crate::crawler::canonical::{canonicalize, SiteScope};
use crate::crawler::fetcher::{Fetch, HttpFetcher};
use crate::crawler::frontier::Frontier;
use crate::crawler::parser::SpaHints;
use crate::crawler::worker::{JobCounters, Worker, WorkerState};
use crate::crawler::PageProcessor;
use crate::models::{CrawlJobRecord, CrawlStats, JobStatusKind, Site};
use crate::renderer::cache::RenderCache;
use crate::renderer::{RenderPolicy, Renderer};
use crate::storage::snapshots::SnapshotStore;
use crate::storage::Store;

const SCALE_TICK: Duration = Duration::from_secs(2);
const SCALE_UP_PENDING: usize = 100;
const SCALE_DOWN_PENDING: usize = 10;
const IDLE_RETIRE_AFTER: Duration = Duration::from_secs(5);
/// Drain requires this many consecutive all-idle, zero-pending ticks.
const DRAIN_TICKS: u32 = 2;

/// Terminal result of one site job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub site_id: i64,
    pub status: JobStatusKind,
    pub stats: CrawlStats,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == JobStatusKind::Completed
    }
}

/// Resolves a configured seed into the URL the crawl actually starts from.
#[async_trait]
pub trait SeedResolver: Send + Sync {
    async fn resolve(&self, seed_url: &str) -> String;
}

/// Probes https/http and apex/`www.` variants of the seed and picks the
/// first variant that answers.
pub struct ProbingResolver {
    client: reqwest::Client,
}

impl ProbingResolver {
    pub fn new(user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        ProbingResolver { client }
    }

    fn candidates(seed: &str) -> Vec<String> {
        let (host, path) = match Url::parse(seed) {
            Ok(url) => {
                let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
                (host, url.path().to_string())
            }
            Err(_) => (seed.trim().trim_end_matches('/').to_ascii_lowercase(), "/".to_string()),
        };
        if host.is_empty() {
            return vec![seed.to_string()];
        }
        let apex = host.strip_prefix("www.").unwrap_or(&host).to_string();
        vec![
            format!("https://{apex}{path}"),
            format!("https://www.{apex}{path}"),
            format!("http://{apex}{path}"),
            format!("http://www.{apex}{path}"),
        ]
    }
}

#[async_trait]
impl SeedResolver for ProbingResolver {
    async fn resolve(&self, seed_url: &str) -> String {
        for candidate in Self::candidates(seed_url) {
            match self.client.get(&candidate).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.url().to_string();
                }
                Ok(_) | Err(_) => continue,
            }
        }
        // Nothing answered; let canonicalization and the fetcher report it.
        if Url::parse(seed_url).is_ok() {
            seed_url.to_string()
        } else {
            format!("https://{}", seed_url.trim())
        }
    }
}

/// Pass-through resolver for seeds that are already known-good.
pub struct StaticResolver;

#[async_trait]
impl SeedResolver for StaticResolver {
    async fn resolve(&self, seed_url: &str) -> String {
        seed_url.to_string()
    }
}

/// What the scaling loop should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleAction {
    SpawnOne,
    RetireOne,
    Hold,
}

fn scale_decision(
    pending: usize,
    active_workers: usize,
    min_workers: usize,
    max_workers: usize,
    has_idle_excess: bool,
) -> ScaleAction {
    if pending > SCALE_UP_PENDING && active_workers < max_workers {
        ScaleAction::SpawnOne
    } else if pending < SCALE_DOWN_PENDING && active_workers > min_workers && has_idle_excess {
        ScaleAction::RetireOne
    } else {
        ScaleAction::Hold
    }
}

/// Runs one site's crawl from seed to drain.
pub struct SiteJobRunner {
    pub config: Arc<Config>,
    pub store: Store,
    pub snapshots: SnapshotStore,
    pub render_cache: Arc<RenderCache>,
    pub renderer: Option<Renderer>,
    pub fetcher: Arc<dyn Fetch>,
    pub resolver: Arc<dyn SeedResolver>,
    pub classifier: Arc<BlockClassifier>,
    pub cancel: CancellationToken,
}

impl SiteJobRunner {
    pub async fn run_site(&self, site: &Site) -> JobOutcome {
        let job_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        println!(
            "=== [{}] site {} ({}) job {} ===",
            self.config.crawl_mode, site.site_id, site.seed_url, job_id
        );

        let resolved = self.resolver.resolve(&site.seed_url).await;
        let canonical_seed = match canonicalize(&resolved) {
            Ok(c) => c,
            Err(e) => {
                return self
                    .fail_without_workers(site, &job_id, &resolved, &format!("invalid seed: {e}"))
                    .await;
            }
        };
        let scope = match SiteScope::from_seed(&canonical_seed) {
            Ok(s) => s,
            Err(e) => {
                return self
                    .fail_without_workers(site, &job_id, &canonical_seed, &format!("bad seed scope: {e}"))
                    .await;
            }
        };

        let job = CrawlJobRecord {
            job_id: job_id.clone(),
            site_id: site.site_id,
            customer_id: site.customer_id,
            start_url: canonical_seed.clone(),
            status: JobStatusKind::Running,
            pages_crawled: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_msg: None,
        };
        if let Err(e) = self.store.insert_job(&job).await {
            tracing::error!(site_id = site.site_id, error = %e, "failed to create crawl job");
            return JobOutcome {
                job_id,
                site_id: site.site_id,
                status: JobStatusKind::Failed,
                stats: CrawlStats::default(),
                error: Some(format!("database unavailable: {e}")),
            };
        }

        let block_stats = Arc::new(BlockStats::new());
        let frontier = Arc::new(Frontier::new(
            scope,
            self.classifier.clone(),
            block_stats.clone(),
            self.config.frontier_capacity,
        ));
        frontier.enqueue(&canonical_seed, None, 0);

        let processor = Arc::new(PageProcessor {
            mode: self.config.crawl_mode,
            job_id: job_id.clone(),
            site: site.clone(),
            fetcher: self.fetcher.clone(),
            renderer: self.renderer.clone(),
            render_cache: self.render_cache.clone(),
            spa_hints: Arc::new(SpaHints::new()),
            store: self.store.clone(),
            snapshots: self.snapshots.clone(),
            compare_policy: ComparePolicy::default(),
        });
        let counters = Arc::new(JobCounters::new());
        let job_cancel = self.cancel.child_token();

        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut workers: Vec<Arc<WorkerState>> = Vec::new();
        let mut next_worker_id = 0usize;

        let mut spawn_worker = |join_set: &mut JoinSet<()>, workers: &mut Vec<Arc<WorkerState>>| {
            let state = Arc::new(WorkerState::new(job_cancel.child_token()));
            let worker = Worker {
                id: next_worker_id,
                frontier: frontier.clone(),
                processor: processor.clone(),
                state: state.clone(),
                counters: counters.clone(),
                crawl_delay: self.config.crawl_delay,
            };
            next_worker_id += 1;
            workers.push(state);
            join_set.spawn(worker.run());
        };

        for _ in 0..self.config.min_workers {
            spawn_worker(&mut join_set, &mut workers);
        }

        let mut tick = tokio::time::interval(SCALE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // first tick fires immediately

        let mut drained_ticks = 0u32;
        let mut cancelled = false;
        let mut fatal: Option<String> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = tick.tick() => {}
            }

            if let Some(msg) = counters.fatal() {
                fatal = Some(msg);
                break;
            }

            // Forget retired workers; they exit on their own tokens.
            workers.retain(|w| !w.is_cancelled());

            let pending = frontier.pending_count();
            let active = workers.iter().filter(|w| w.is_ready()).count();
            fn long_idle(w: &WorkerState) -> bool {
                w.is_ready() && w.idle_for().map(|d| d >= IDLE_RETIRE_AFTER).unwrap_or(false)
            }
            let idle_excess = workers.iter().any(|w| long_idle(w));

            match scale_decision(
                pending,
                active,
                self.config.min_workers,
                self.config.max_workers,
                idle_excess,
            ) {
                ScaleAction::SpawnOne => {
                    tracing::debug!(pending, workers = active, "scaling up");
                    spawn_worker(&mut join_set, &mut workers);
                }
                ScaleAction::RetireOne => {
                    if let Some(idle_worker) = workers.iter().find(|w| long_idle(w)) {
                        tracing::debug!(pending, workers = active, "scaling down");
                        idle_worker.cancel.cancel();
                    }
                }
                ScaleAction::Hold => {}
            }

            // Drain: nothing queued or in flight, and every started worker
            // has settled into its dequeue wait, two ticks in a row.
            let all_started = workers.iter().all(|w| w.is_ready());
            let all_idle = workers.iter().all(|w| w.idle_for().is_some());
            if pending == 0 && all_started && all_idle {
                drained_ticks += 1;
                if drained_ticks >= DRAIN_TICKS {
                    break;
                }
            } else {
                drained_ticks = 0;
            }
        }

        frontier.close();
        job_cancel.cancel();
        while join_set.join_next().await.is_some() {}

        for line in block_stats.report_lines() {
            println!("{line}");
        }

        let stats = CrawlStats {
            pages_crawled: counters.pages_crawled(),
            pages_failed: counters.pages_failed(),
            urls_blocked: block_stats.total_blocked(),
            elapsed_s: started.elapsed().as_secs_f64(),
        };

        let (status, error) = if let Some(msg) = fatal {
            (JobStatusKind::Failed, Some(msg))
        } else if cancelled {
            (JobStatusKind::Failed, Some("cancelled".to_string()))
        } else {
            (JobStatusKind::Completed, None)
        };

        if let Err(e) = self
            .store
            .finish_job(&job_id, status, stats.pages_crawled, error.as_deref())
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "failed to finalize crawl job");
        }

        println!(
            "=== job {} {}: {} crawled, {} failed, {} blocked in {:.1}s ===",
            job_id,
            status.as_str(),
            stats.pages_crawled,
            stats.pages_failed,
            stats.urls_blocked,
            stats.elapsed_s
        );

        JobOutcome {
            job_id,
            site_id: site.site_id,
            status,
            stats,
            error,
        }
    }

    async fn fail_without_workers(
        &self,
        site: &Site,
        job_id: &str,
        start_url: &str,
        reason: &str,
    ) -> JobOutcome {
        tracing::error!(site_id = site.site_id, reason, "site job failed before crawl");
        let job = CrawlJobRecord {
            job_id: job_id.to_string(),
            site_id: site.site_id,
            customer_id: site.customer_id,
            start_url: start_url.to_string(),
            status: JobStatusKind::Running,
            pages_crawled: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_msg: None,
        };
        if self.store.insert_job(&job).await.is_ok() {
            let _ = self
                .store
                .finish_job(job_id, JobStatusKind::Failed, 0, Some(reason))
                .await;
        }
        JobOutcome {
            job_id: job_id.to_string(),
            site_id: site.site_id,
            status: JobStatusKind::Failed,
            stats: CrawlStats::default(),
            error: Some(reason.to_string()),
        }
    }
}

/// Composes site jobs. Owns the process-wide render cache and runs at most
/// `max_parallel_sites` site jobs concurrently; one site's failure never
/// touches another's.
pub struct Scheduler {
    config: Arc<Config>,
    store: Store,
    snapshots: SnapshotStore,
    render_cache: Arc<RenderCache>,
    renderer: Option<Renderer>,
    fetcher: Arc<dyn Fetch>,
    resolver: Arc<dyn SeedResolver>,
    classifier: Arc<BlockClassifier>,
}

impl Scheduler {
    pub fn new(config: Arc<Config>, store: Store) -> Self {
        let render_policy = RenderPolicy {
            goto_timeout_ms: config.js_goto_timeout.as_millis() as u64,
            hydration_wait_ms: config.js_wait_timeout.as_millis() as u64,
            stability_ms: config.js_stability_time.as_millis() as u64,
            ..RenderPolicy::default()
        };
        Scheduler {
            snapshots: SnapshotStore::new(&config.snapshot_root),
            render_cache: Arc::new(RenderCache::new(
                config.render_cache_capacity,
                config.render_cache_ttl,
            )),
            renderer: Some(Renderer::new(
                config.max_concurrent_renders,
                config.renderer_script_path.clone(),
                render_policy,
            )),
            fetcher: Arc::new(HttpFetcher::new(&config.user_agent, config.request_timeout)),
            resolver: Arc::new(ProbingResolver::new(&config.user_agent)),
            classifier: Arc::new(BlockClassifier::new()),
            config,
            store,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetch>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SeedResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_renderer(mut self, renderer: Option<Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Run one job per site, bounded by the site-parallelism semaphore.
    pub async fn run(&self, sites: Vec<Site>, cancel: CancellationToken) -> Vec<JobOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_sites.max(1)));
        let mut join_set: JoinSet<JobOutcome> = JoinSet::new();

        for site in sites {
            let semaphore = semaphore.clone();
            let runner = SiteJobRunner {
                config: self.config.clone(),
                store: self.store.clone(),
                snapshots: self.snapshots.clone(),
                render_cache: self.render_cache.clone(),
                renderer: self.renderer.clone(),
                fetcher: self.fetcher.clone(),
                resolver: self.resolver.clone(),
                classifier: self.classifier.clone(),
                cancel: cancel.clone(),
            };
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("site semaphore closed");
                runner.run_site(&site).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "site job panicked"),
            }
        }
        outcomes.sort_by_key(|o| o.site_id);
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_up_when_backlogged() {
        assert_eq!(scale_decision(500, 5, 5, 50, false), ScaleAction::SpawnOne);
        assert_eq!(scale_decision(101, 49, 5, 50, false), ScaleAction::SpawnOne);
    }

    #[test]
    fn test_scale_capped_at_max() {
        assert_eq!(scale_decision(500, 50, 5, 50, false), ScaleAction::Hold);
    }

    #[test]
    fn test_scale_down_only_when_idle() {
        assert_eq!(scale_decision(2, 10, 5, 50, true), ScaleAction::RetireOne);
        assert_eq!(scale_decision(2, 10, 5, 50, false), ScaleAction::Hold);
    }

    #[test]
    fn test_never_below_min_workers() {
        assert_eq!(scale_decision(0, 5, 5, 50, true), ScaleAction::Hold);
    }

    #[test]
    fn test_hold_in_steady_state() {
        assert_eq!(scale_decision(50, 10, 5, 50, true), ScaleAction::Hold);
    }

    #[test]
    fn test_probe_candidates() {
        let candidates = ProbingResolver::candidates("https://www.example.com/start");
        assert_eq!(
            candidates,
            vec![
                "https://example.com/start",
                "https://www.example.com/start",
                "http://example.com/start",
                "http://www.example.com/start",
            ]
        );

        let bare = ProbingResolver::candidates("example.com");
        assert_eq!(bare[0], "https://example.com/");
        assert_eq!(bare.len(), 4);
    }
}
