pub mod blocklist;
pub mod canonical;
pub mod fetcher;
pub mod frontier;
pub mod parser;
pub mod worker;

use std::sync::Arc;

use chrono::Utc;

use crate::compare::{self, ComparePolicy, LiveObservation};
use crate::config::CrawlMode;
use crate::fingerprint::{content_hash, semantic_normalize, NORM_VERSION};
use crate::models::{CrawlPageRecord, PageVersion, Site};
use crate::renderer::cache::{cache_key, RenderCache};
use crate::renderer::{RenderError, Renderer};
use crate::storage::snapshots::{SnapshotError, SnapshotStore};
use crate::storage::{Store, StoreError};
use fetcher::{Fetch, FetchOutcome};
use frontier::FrontierTask;
use parser::{extract_script_srcs, extract_urls, needs_js_rendering, SpaHints};

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Database unavailability is fatal to the whole site job.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// What one processed URL produced. Links are the worker's to enqueue.
#[derive(Debug, Default)]
pub struct PageOutcome {
    pub fetched_ok: bool,
    pub status: Option<u16>,
    pub elapsed_ms: u64,
    pub rendered: bool,
    pub new_links: Vec<String>,
}

/// Per-site pipeline binding fetch, render, normalization, hashing and the
/// mode dispatch. Shared read-only across a site's workers.
pub struct PageProcessor {
    pub mode: CrawlMode,
    pub job_id: String,
    pub site: Site,
    pub fetcher: Arc<dyn Fetch>,
    pub renderer: Option<Renderer>,
    pub render_cache: Arc<RenderCache>,
    pub spa_hints: Arc<SpaHints>,
    pub store: Store,
    pub snapshots: SnapshotStore,
    pub compare_policy: ComparePolicy,
}

impl PageProcessor {
    /// Process one dequeued task end to end. Fetch and render failures are
    /// recorded and folded into the outcome; only store and snapshot errors
    /// escape.
    pub async fn process(&self, task: &FrontierTask) -> Result<PageOutcome, CrawlError> {
        let url = &task.url;

        // Hosts known to serve SPA shells skip the plain fetch entirely.
        if self.spa_hints.is_hinted(url) {
            match self.render_with_cache(url).await {
                Ok(body) => return self.dispatch(task, body, None, true).await,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "direct render failed");
                    return self.record_render_failure(task).await;
                }
            }
        }

        let outcome = self.fetcher.fetch(url).await;
        if !outcome.is_ok() {
            self.record_fetch_failure(task, &outcome).await?;
            return Ok(PageOutcome {
                fetched_ok: false,
                status: outcome.status,
                elapsed_ms: outcome.elapsed_ms,
                rendered: false,
                new_links: Vec::new(),
            });
        }

        let fetched_body = outcome.body.clone().unwrap_or_default();
        let is_html = outcome
            .content_type
            .as_deref()
            .map(|ct| ct.contains("html"))
            .unwrap_or(false);

        if is_html && needs_js_rendering(&fetched_body) {
            self.spa_hints.mark(url);
            match self.render_with_cache(url).await {
                Ok(body) => return self.dispatch(task, body, Some(&outcome), true).await,
                Err(e) => {
                    // Partial body from the plain fetch is better than nothing.
                    tracing::warn!(url = %url, error = %e, "render failed, using fetched body");
                }
            }
        }

        self.dispatch(task, fetched_body, Some(&outcome), false).await
    }

    /// Normalize, hash and run the configured mode over a settled body.
    async fn dispatch(
        &self,
        task: &FrontierTask,
        body: String,
        fetch: Option<&FetchOutcome>,
        rendered: bool,
    ) -> Result<PageOutcome, CrawlError> {
        let url = &task.url;
        let normalized = semantic_normalize(&body);
        let script_srcs = extract_script_srcs(&body, url);

        match self.mode {
            CrawlMode::Crawl => {
                self.store.insert_page(&self.page_record(task, fetch, &body)).await?;
            }
            CrawlMode::Baseline => {
                let snapshots = self.snapshots.clone();
                let customer_id = self.site.customer_id;
                let site_id = self.site.site_id;
                let snapshot_url = url.clone();
                let text = normalized.text.clone();
                let path = tokio::task::spawn_blocking(move || {
                    snapshots.store(customer_id, site_id, &snapshot_url, &text)
                })
                .await
                .map_err(|e| CrawlError::Internal(e.to_string()))??;

                let version = PageVersion {
                    url: url.clone(),
                    normalized_text: normalized.text.clone(),
                    tag_paths: normalized.tag_paths.clone(),
                    script_srcs: script_srcs.clone(),
                    content_hash: normalized.content_hash(),
                    structural_hash: normalized.structural_hash(),
                    norm_version: NORM_VERSION.to_string(),
                    snapshot_path: Some(path.to_string_lossy().into_owned()),
                    created_at: Utc::now(),
                };
                self.store.upsert_baseline(site_id, &version).await?;
            }
            CrawlMode::Compare => {
                let verdict = match self.store.latest_baseline(self.site.site_id, url).await? {
                    None => compare::no_baseline_verdict(url, content_hash(&normalized.text)),
                    Some(row) => {
                        let baseline_text = if row.norm_version == NORM_VERSION {
                            self.load_snapshot_text(row.snapshot_path.as_deref()).await?
                        } else {
                            String::new()
                        };
                        let baseline = row.into_page_version(baseline_text);
                        let live = LiveObservation {
                            url: url.clone(),
                            normalized_text: normalized.text.clone(),
                            tag_paths: normalized.tag_paths.clone(),
                            script_srcs: script_srcs.clone(),
                        };
                        compare::evaluate(&live, &baseline, &self.compare_policy)
                    }
                };
                tracing::info!(
                    url = %url,
                    status = verdict.status.as_str(),
                    severity = verdict.severity.as_str(),
                    "verdict"
                );
                self.store.insert_verdict(self.site.site_id, &verdict).await?;
            }
        }

        Ok(PageOutcome {
            fetched_ok: true,
            status: fetch.and_then(|f| f.status).or(Some(200)),
            elapsed_ms: fetch.map(|f| f.elapsed_ms).unwrap_or(0),
            rendered,
            new_links: extract_urls(&body, url),
        })
    }

    async fn load_snapshot_text(&self, path: Option<&str>) -> Result<String, CrawlError> {
        let Some(path) = path else {
            return Ok(String::new());
        };
        let snapshots = self.snapshots.clone();
        let path = std::path::PathBuf::from(path);
        let text = tokio::task::spawn_blocking(move || snapshots.load(&path))
            .await
            .map_err(|e| CrawlError::Internal(e.to_string()))??;
        Ok(text)
    }

    async fn render_with_cache(&self, url: &str) -> Result<String, RenderError> {
        let key = cache_key(url);
        if let Some(hit) = self.render_cache.get(&key) {
            tracing::debug!(url = %url, "render cache hit");
            return Ok(hit.body);
        }
        let renderer = self
            .renderer
            .as_ref()
            .ok_or_else(|| RenderError::Failed("renderer disabled".to_string()))?;
        let artifact = renderer.render(url).await?;
        for warning in &artifact.warnings {
            tracing::debug!(url = %url, warning = %warning, "render warning");
        }
        self.render_cache
            .put(key, artifact.body.clone(), content_hash(&artifact.body));
        Ok(artifact.body)
    }

    fn page_record(
        &self,
        task: &FrontierTask,
        fetch: Option<&FetchOutcome>,
        body: &str,
    ) -> CrawlPageRecord {
        CrawlPageRecord {
            job_id: self.job_id.clone(),
            site_id: self.site.site_id,
            url: task.url.clone(),
            parent_url: task.parent_url.clone(),
            status_code: fetch.and_then(|f| f.status).or(Some(200)),
            content_type: fetch
                .and_then(|f| f.content_type.clone())
                .or_else(|| Some("text/html".to_string())),
            content_length: Some(body.len() as i64),
            response_time_ms: fetch.map(|f| f.elapsed_ms).unwrap_or(0) as i64,
            fetched_at: Utc::now(),
        }
    }

    /// Failed fetches still leave a page row with their classification code.
    async fn record_fetch_failure(
        &self,
        task: &FrontierTask,
        outcome: &FetchOutcome,
    ) -> Result<(), CrawlError> {
        tracing::warn!(
            url = %task.url,
            classification = outcome.classification.as_str(),
            status = ?outcome.status,
            "fetch failed"
        );
        self.store
            .insert_page(&CrawlPageRecord {
                job_id: self.job_id.clone(),
                site_id: self.site.site_id,
                url: task.url.clone(),
                parent_url: task.parent_url.clone(),
                status_code: outcome.status,
                content_type: outcome.content_type.clone(),
                content_length: None,
                response_time_ms: outcome.elapsed_ms as i64,
                fetched_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn record_render_failure(&self, task: &FrontierTask) -> Result<PageOutcome, CrawlError> {
        self.store
            .insert_page(&CrawlPageRecord {
                job_id: self.job_id.clone(),
                site_id: self.site.site_id,
                url: task.url.clone(),
                parent_url: task.parent_url.clone(),
                status_code: None,
                content_type: None,
                content_length: None,
                response_time_ms: 0,
                fetched_at: Utc::now(),
            })
            .await?;
        Ok(PageOutcome {
            fetched_ok: false,
            status: None,
            elapsed_ms: 0,
            rendered: false,
            new_links: Vec::new(),
        })
    }
}
