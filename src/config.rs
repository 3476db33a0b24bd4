use std::env;
use std::str::FromStr;
use std::time::Duration;

/// What the pipeline does with a fetched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlMode {
    /// Record crawl metadata only.
    Crawl,
    /// Persist per-URL semantic baselines.
    Baseline,
    /// Compare live pages against stored baselines and emit verdicts.
    Compare,
}

impl FromStr for CrawlMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRAWL" => Ok(CrawlMode::Crawl),
            "BASELINE" => Ok(CrawlMode::Baseline),
            "COMPARE" => Ok(CrawlMode::Compare),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CrawlMode::Crawl => "CRAWL",
            CrawlMode::Baseline => "BASELINE",
            CrawlMode::Compare => "COMPARE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub crawl_mode: CrawlMode,
    pub min_workers: usize,
    pub max_workers: usize,
    pub max_parallel_sites: usize,
    pub request_timeout: Duration,
    pub crawl_delay: Duration,
    pub js_goto_timeout: Duration,
    pub js_wait_timeout: Duration,
    pub js_stability_time: Duration,
    pub db_pool_size: u32,
    pub db_acquire_timeout: Duration,
    pub database_url: String,
    pub user_agent: String,
    pub renderer_script_path: String,
    pub max_concurrent_renders: usize,
    pub render_cache_capacity: usize,
    pub render_cache_ttl: Duration,
    pub snapshot_root: String,
    pub frontier_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let crawl_mode = env::var("CRAWL_MODE")
            .unwrap_or_else(|_| "CRAWL".to_string())
            .parse::<CrawlMode>()
            .map_err(|_| {
                ConfigError::InvalidValue("CRAWL_MODE", "must be CRAWL, BASELINE or COMPARE")
            })?;

        let min_workers = parse_var("MIN_WORKERS", "5")?;
        let max_workers = parse_var("MAX_WORKERS", "50")?;
        if min_workers == 0 || max_workers < min_workers {
            return Err(ConfigError::InvalidValue(
                "MAX_WORKERS",
                "must be >= MIN_WORKERS, and MIN_WORKERS must be > 0",
            ));
        }

        let max_parallel_sites = parse_var("MAX_PARALLEL_SITES", "3")?;

        let request_timeout = Duration::from_secs(parse_var("REQUEST_TIMEOUT", "20")?);
        let crawl_delay = Duration::from_secs_f64(parse_var("CRAWL_DELAY", "1.0")?);
        let js_goto_timeout = Duration::from_secs(parse_var("JS_GOTO_TIMEOUT", "30")?);
        let js_wait_timeout = Duration::from_secs(parse_var("JS_WAIT_TIMEOUT", "8")?);
        let js_stability_time = Duration::from_secs(parse_var("JS_STABILITY_TIME", "5")?);

        // The store caps its pool at 32 connections regardless of the env.
        let db_pool_size = parse_var::<u32>("DB_POOL_SIZE", "16")?.min(32);
        let db_acquire_timeout = Duration::from_secs(parse_var("DB_SEMAPHORE", "10")?);
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://sitewarden.db".to_string());

        let user_agent =
            env::var("USER_AGENT").unwrap_or_else(|_| "SitewardenBot/1.0".to_string());

        let renderer_script_path = env::var("RENDERER_SCRIPT_PATH")
            .unwrap_or_else(|_| "scripts/render-page.mjs".to_string());
        let max_concurrent_renders = parse_var("MAX_CONCURRENT_RENDERERS", "3")?;
        let render_cache_capacity = parse_var("RENDER_CACHE_CAPACITY", "512")?;
        let render_cache_ttl = Duration::from_secs(parse_var("RENDER_CACHE_TTL", "3600")?);

        let snapshot_root = env::var("SNAPSHOT_ROOT").unwrap_or_else(|_| "baselines".to_string());
        let frontier_capacity = parse_var("FRONTIER_CAPACITY", "10000")?;

        Ok(Config {
            crawl_mode,
            min_workers,
            max_workers,
            max_parallel_sites,
            request_timeout,
            crawl_delay,
            js_goto_timeout,
            js_wait_timeout,
            js_stability_time,
            db_pool_size,
            db_acquire_timeout,
            database_url,
            user_agent,
            renderer_script_path,
            max_concurrent_renders,
            render_cache_capacity,
            render_cache_ttl,
            snapshot_root,
            frontier_capacity,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(name, "failed to parse"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}
