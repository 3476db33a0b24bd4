//! End-to-end pipeline tests over an in-process site graph: a scripted
//! fetcher replaces the network, the store is an in-memory SQLite, and
//! snapshots land in a tempdir. These exercise the frontier, the worker
//! pool, drain detection and all three crawl modes together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sitewarden::config::{Config, CrawlMode};
use sitewarden::crawler::fetcher::{Fetch, FetchClassification, FetchOutcome};
use sitewarden::jobs::{Scheduler, StaticResolver};
use sitewarden::models::Site;
use sitewarden::storage::snapshots::SnapshotStore;
use sitewarden::storage::Store;

/// Serves a fixed URL → HTML map and counts how often each URL is fetched.
struct StubFetcher {
    pages: HashMap<String, String>,
    hits: Mutex<HashMap<String, u32>>,
}

impl StubFetcher {
    fn new(pages: &[(&str, &str)]) -> Self {
        StubFetcher {
            pages: pages
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn hits_for(&self, url: &str) -> u32 {
        *self.hits.lock().unwrap().get(url).unwrap_or(&0)
    }
}

#[async_trait]
impl Fetch for StubFetcher {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        *self
            .hits
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;

        match self.pages.get(url) {
            Some(body) => FetchOutcome {
                final_url: url.to_string(),
                status: Some(200),
                content_type: Some("text/html; charset=utf-8".to_string()),
                elapsed_ms: 1,
                body: Some(body.clone()),
                classification: FetchClassification::Ok,
            },
            None => FetchOutcome {
                final_url: url.to_string(),
                status: Some(404),
                content_type: Some("text/html".to_string()),
                elapsed_ms: 1,
                body: None,
                classification: FetchClassification::ClientError,
            },
        }
    }
}

fn test_config(mode: CrawlMode) -> Arc<Config> {
    Arc::new(Config {
        crawl_mode: mode,
        min_workers: 2,
        max_workers: 4,
        max_parallel_sites: 2,
        request_timeout: Duration::from_secs(5),
        crawl_delay: Duration::ZERO,
        js_goto_timeout: Duration::from_secs(5),
        js_wait_timeout: Duration::from_secs(1),
        js_stability_time: Duration::from_secs(1),
        db_pool_size: 1,
        db_acquire_timeout: Duration::from_secs(10),
        database_url: "sqlite::memory:".to_string(),
        user_agent: "SitewardenTest/1.0".to_string(),
        renderer_script_path: "scripts/render-page.mjs".to_string(),
        max_concurrent_renders: 1,
        render_cache_capacity: 64,
        render_cache_ttl: Duration::from_secs(3600),
        snapshot_root: "unused".to_string(),
        frontier_capacity: 10_000,
    })
}

async fn memory_store() -> Store {
    Store::connect("sqlite::memory:", 1, Duration::from_secs(10))
        .await
        .unwrap()
}

fn the_site() -> Site {
    Site {
        site_id: 1,
        customer_id: 10,
        seed_url: "https://x.test/".to_string(),
        enabled: true,
    }
}

const HOME: &str = r##"<html><body>
    <h1>Example Shop</h1>
    <p>Welcome to Example Shop. Quality products since 1999.</p>
    <a href="/about">About</a>
    <a href="/blog">Blog</a>
    <a href="/assets/logo.png">Logo</a>
    <a href="/page/2/">Next</a>
    <a href="https://other.test/x">Partner</a>
    <a href="#top">Top</a>
    <a href="mailto:hi@x.test">Mail</a>
</body></html>"##;

const ABOUT: &str = r#"<html><body>
    <h1>About us</h1>
    <p>A small family business.</p>
    <a href="/">Home</a>
</body></html>"#;

const BLOG: &str = r#"<html><body>
    <h1>Blog</h1>
    <p>Latest news about our products and stores.</p>
    <a href="/about">About</a>
</body></html>"#;

fn healthy_pages() -> Vec<(&'static str, &'static str)> {
    vec![
        ("https://x.test/", HOME),
        ("https://x.test/about", ABOUT),
        ("https://x.test/blog", BLOG),
    ]
}

fn scheduler(
    config: Arc<Config>,
    store: Store,
    fetcher: Arc<StubFetcher>,
    snapshots: SnapshotStore,
) -> Scheduler {
    Scheduler::new(config, store)
        .with_fetcher(fetcher)
        .with_resolver(Arc::new(StaticResolver))
        .with_renderer(None)
        .with_snapshots(snapshots)
}

#[tokio::test]
async fn test_crawl_mode_drains_and_records_pages() {
    let store = memory_store().await;
    store.upsert_site(&the_site()).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new(&healthy_pages()));
    let snapshots = SnapshotStore::new(tempfile::tempdir().unwrap().keep());

    let outcomes = scheduler(
        test_config(CrawlMode::Crawl),
        store.clone(),
        fetcher.clone(),
        snapshots,
    )
    .run(vec![the_site()], CancellationToken::new())
    .await;

    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert!(outcome.is_completed(), "job failed: {:?}", outcome.error);
    assert_eq!(outcome.stats.pages_crawled, 3);
    assert_eq!(outcome.stats.pages_failed, 0);
    // logo.png (STATIC) and /page/2/ (PAGINATION) never reach a worker.
    assert_eq!(outcome.stats.urls_blocked, 2);

    // Every page fetched exactly once despite the link cycle.
    assert_eq!(fetcher.hits_for("https://x.test/"), 1);
    assert_eq!(fetcher.hits_for("https://x.test/about"), 1);
    assert_eq!(fetcher.hits_for("https://x.test/blog"), 1);
    assert_eq!(fetcher.hits_for("https://other.test/x"), 0);

    assert_eq!(store.count_pages(&outcome.job_id).await.unwrap(), 3);
    let job = store.fetch_job(&outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.pages_crawled, 3);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_baseline_then_compare_detects_defacement() {
    let store = memory_store().await;
    store.upsert_site(&the_site()).await.unwrap();
    let snapshot_dir = tempfile::tempdir().unwrap();
    let snapshots = SnapshotStore::new(snapshot_dir.path());

    // Pass 1: record baselines for the healthy site.
    let healthy = Arc::new(StubFetcher::new(&healthy_pages()));
    let outcomes = scheduler(
        test_config(CrawlMode::Baseline),
        store.clone(),
        healthy,
        snapshots.clone(),
    )
    .run(vec![the_site()], CancellationToken::new())
    .await;
    assert!(outcomes[0].is_completed(), "baseline job: {:?}", outcomes[0].error);

    let baseline = store
        .latest_baseline(1, "https://x.test/about")
        .await
        .unwrap()
        .expect("about page baselined");
    let snapshot_text = snapshots
        .load(std::path::Path::new(baseline.snapshot_path.as_deref().unwrap()))
        .unwrap();
    assert!(snapshot_text.contains("A small family business."));

    // Pass 2: the live site now carries an injected script on the home page
    // and a fully replaced blog post.
    let defaced_home = HOME.replace(
        "Quality products since 1999.",
        r#"Discount products since 1999.</p><script src="https://evil.test/h.js"></script><p>"#,
    );
    let defaced_blog = BLOG.replace(
        "Latest news about our products and stores.",
        "HACKED BY DR EVIL your site is owned now",
    );
    let defaced = Arc::new(StubFetcher::new(&[
        ("https://x.test/", defaced_home.as_str()),
        ("https://x.test/about", ABOUT),
        ("https://x.test/blog", defaced_blog.as_str()),
    ]));

    let outcomes = scheduler(
        test_config(CrawlMode::Compare),
        store.clone(),
        defaced,
        snapshots.clone(),
    )
    .run(vec![the_site()], CancellationToken::new())
    .await;
    assert!(outcomes[0].is_completed(), "compare job: {:?}", outcomes[0].error);

    let verdicts = store.list_verdicts(1).await.unwrap();
    assert_eq!(verdicts.len(), 3);
    let by_url: HashMap<&str, &sitewarden::storage::VerdictRow> =
        verdicts.iter().map(|v| (v.url.as_str(), v)).collect();

    let home = by_url["https://x.test/"];
    assert_eq!(home.status, "DEFACED");
    assert_eq!(home.severity, "HIGH");
    assert!(home.diff_summary.contains("SCRIPT_ADDED"));

    let about = by_url["https://x.test/about"];
    assert_eq!(about.status, "CLEAN");
    assert_eq!(about.severity, "NONE");
    assert!(about.diff_summary.contains("HASH_MATCH"));

    let blog = by_url["https://x.test/blog"];
    assert_eq!(blog.status, "POTENTIAL_DEFACEMENT");
    assert_eq!(blog.severity, "MEDIUM");
    assert!(blog.diff_summary.contains("TEXT_REPLACEMENT"));
}

#[tokio::test]
async fn test_compare_without_baseline_fails_closed() {
    let store = memory_store().await;
    let site = Site {
        site_id: 2,
        customer_id: 20,
        seed_url: "https://solo.test/".to_string(),
        enabled: true,
    };
    store.upsert_site(&site).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new(&[(
        "https://solo.test/",
        "<html><body><p>only page</p></body></html>",
    )]));
    let snapshots = SnapshotStore::new(tempfile::tempdir().unwrap().keep());

    let outcomes = scheduler(
        test_config(CrawlMode::Compare),
        store.clone(),
        fetcher,
        snapshots,
    )
    .run(vec![site], CancellationToken::new())
    .await;
    assert!(outcomes[0].is_completed());

    let verdicts = store.list_verdicts(2).await.unwrap();
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts[0].status, "FAILED");
    assert_eq!(verdicts[0].severity, "NONE");
    assert!(verdicts[0].baseline_hash.is_none());
}
