//! Relational store adapters. The core treats the database as a collaborator:
//! every insert is independent, no cross-row transactions, and the pool is
//! the only serialization point. SQL is runtime-checked.

pub mod snapshots;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::models::{CrawlJobRecord, CrawlPageRecord, JobStatusKind, PageVersion, Site, Verdict};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("bad stored JSON: {0}")]
    BadJson(#[from] serde_json::Error),
}

/// A `baselines` row. The snapshot file holds the normalized text; the row
/// holds everything the comparator needs besides it.
#[derive(Debug, Clone)]
pub struct BaselineRow {
    pub site_id: i64,
    pub url: String,
    pub html_hash: String,
    pub structural_hash: String,
    pub norm_version: String,
    pub snapshot_path: Option<String>,
    pub tag_paths: Vec<String>,
    pub script_srcs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BaselineRow {
    /// Combine the row with its snapshot text into a full page version.
    pub fn into_page_version(self, normalized_text: String) -> PageVersion {
        PageVersion {
            url: self.url,
            normalized_text,
            tag_paths: self.tag_paths,
            script_srcs: self.script_srcs,
            content_hash: self.html_hash,
            structural_hash: self.structural_hash,
            norm_version: self.norm_version,
            snapshot_path: self.snapshot_path,
            created_at: self.created_at,
        }
    }
}

/// A persisted `diff_evidence` row as read back from the store.
#[derive(Debug, Clone)]
pub struct VerdictRow {
    pub url: String,
    pub baseline_hash: Option<String>,
    pub observed_hash: String,
    pub diff_summary: String,
    pub severity: String,
    pub status: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(
        database_url: &str,
        pool_size: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.min(32))
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;
        let store = Store { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                site_id     INTEGER PRIMARY KEY,
                customer_id INTEGER NOT NULL,
                url         TEXT NOT NULL,
                enabled     INTEGER NOT NULL DEFAULT 1
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS crawl_jobs (
                job_id        TEXT PRIMARY KEY,
                site_id       INTEGER NOT NULL REFERENCES sites(site_id),
                customer_id   INTEGER NOT NULL,
                start_url     TEXT NOT NULL,
                status        TEXT NOT NULL,
                pages_crawled INTEGER NOT NULL DEFAULT 0,
                started_at    TEXT NOT NULL,
                completed_at  TEXT,
                error_msg     TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS crawl_pages (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id           TEXT NOT NULL REFERENCES crawl_jobs(job_id),
                site_id          INTEGER NOT NULL,
                url              TEXT NOT NULL,
                parent_url       TEXT,
                status_code      INTEGER,
                content_type     TEXT,
                content_length   INTEGER,
                response_time_ms INTEGER NOT NULL,
                fetched_at       TEXT NOT NULL,
                UNIQUE (job_id, url)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS baselines (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id          INTEGER NOT NULL,
                url              TEXT NOT NULL,
                html_hash        TEXT NOT NULL,
                structural_hash  TEXT NOT NULL,
                norm_version     TEXT NOT NULL,
                snapshot_path    TEXT,
                fingerprint_json TEXT NOT NULL,
                script_srcs_json TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                UNIQUE (site_id, url, norm_version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS diff_evidence (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id       INTEGER NOT NULL,
                url           TEXT NOT NULL,
                baseline_hash TEXT,
                observed_hash TEXT NOT NULL,
                diff_summary  TEXT NOT NULL,
                severity      TEXT NOT NULL,
                status        TEXT NOT NULL,
                detected_at   TEXT NOT NULL,
                closed_at     TEXT
            )
            "#,
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    // --- sites ---

    /// Insert or replace a site row. Sites are normally managed outside the
    /// crawler; this exists for bootstrap and tests.
    pub async fn upsert_site(&self, site: &Site) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sites (site_id, customer_id, url, enabled)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (site_id) DO UPDATE SET
                customer_id = excluded.customer_id,
                url = excluded.url,
                enabled = excluded.enabled
            "#,
        )
        .bind(site.site_id)
        .bind(site.customer_id)
        .bind(&site.seed_url)
        .bind(site.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Enabled sites, optionally restricted to one site or one customer.
    pub async fn list_enabled_sites(
        &self,
        site_id: Option<i64>,
        customer_id: Option<i64>,
    ) -> Result<Vec<Site>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT site_id, customer_id, url, enabled
            FROM sites
            WHERE enabled = 1
              AND (? IS NULL OR site_id = ?)
              AND (? IS NULL OR customer_id = ?)
            ORDER BY site_id
            "#,
        )
        .bind(site_id)
        .bind(site_id)
        .bind(customer_id)
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_site).collect())
    }

    // --- crawl jobs ---

    pub async fn insert_job(&self, job: &CrawlJobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO crawl_jobs
                (job_id, site_id, customer_id, start_url, status, pages_crawled, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(job.site_id)
        .bind(job.customer_id)
        .bind(&job.start_url)
        .bind(job.status.as_str())
        .bind(job.pages_crawled as i64)
        .bind(job.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatusKind,
        pages_crawled: u32,
        error_msg: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs
            SET status = ?, pages_crawled = ?, completed_at = ?, error_msg = ?
            WHERE job_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(pages_crawled as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(error_msg)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_job(&self, job_id: &str) -> Result<Option<CrawlJobRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, site_id, customer_id, start_url, status, pages_crawled,
                   started_at, completed_at, error_msg
            FROM crawl_jobs WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_job(&r)))
    }

    // --- crawl pages ---

    /// Append one fetched (or failed) page. Duplicate URLs within a job are
    /// ignored.
    pub async fn insert_page(&self, page: &CrawlPageRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO crawl_pages
                (job_id, site_id, url, parent_url, status_code, content_type,
                 content_length, response_time_ms, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (job_id, url) DO NOTHING
            "#,
        )
        .bind(&page.job_id)
        .bind(page.site_id)
        .bind(&page.url)
        .bind(&page.parent_url)
        .bind(page.status_code.map(|s| s as i64))
        .bind(&page.content_type)
        .bind(page.content_length)
        .bind(page.response_time_ms)
        .bind(page.fetched_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_pages(&self, job_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM crawl_pages WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // --- baselines ---

    /// Write a baseline for `(site_id, url, norm_version)`. Within one
    /// normalization version the row tracks the latest snapshot revision;
    /// older revisions stay on disk.
    pub async fn upsert_baseline(
        &self,
        site_id: i64,
        version: &PageVersion,
    ) -> Result<(), StoreError> {
        let fingerprint_json = serde_json::to_string(&version.tag_paths)?;
        let script_srcs_json = serde_json::to_string(&version.script_srcs)?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO baselines
                (site_id, url, html_hash, structural_hash, norm_version,
                 snapshot_path, fingerprint_json, script_srcs_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (site_id, url, norm_version) DO UPDATE SET
                html_hash = excluded.html_hash,
                structural_hash = excluded.structural_hash,
                snapshot_path = excluded.snapshot_path,
                fingerprint_json = excluded.fingerprint_json,
                script_srcs_json = excluded.script_srcs_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(site_id)
        .bind(&version.url)
        .bind(&version.content_hash)
        .bind(&version.structural_hash)
        .bind(&version.norm_version)
        .bind(&version.snapshot_path)
        .bind(fingerprint_json)
        .bind(script_srcs_json)
        .bind(version.created_at.to_rfc3339())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The most recently updated baseline for the URL, regardless of
    /// normalization version. Version mismatches are the comparator's call.
    pub async fn latest_baseline(
        &self,
        site_id: i64,
        url: &str,
    ) -> Result<Option<BaselineRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT site_id, url, html_hash, structural_hash, norm_version,
                   snapshot_path, fingerprint_json, script_srcs_json,
                   created_at, updated_at
            FROM baselines
            WHERE site_id = ? AND url = ?
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(site_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_baseline(&r)).transpose()
    }

    // --- verdicts ---

    /// Append a verdict as diff evidence. Verdict rows are immutable.
    pub async fn insert_verdict(&self, site_id: i64, verdict: &Verdict) -> Result<(), StoreError> {
        let diff_summary = serde_json::to_string(&serde_json::json!({
            "indicators": verdict.indicators,
            "structural_drift": verdict.structural_drift,
            "content_drift": verdict.content_drift,
            "confidence": verdict.confidence,
        }))?;
        sqlx::query(
            r#"
            INSERT INTO diff_evidence
                (site_id, url, baseline_hash, observed_hash, diff_summary,
                 severity, status, detected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(site_id)
        .bind(&verdict.url)
        .bind(&verdict.baseline_hash)
        .bind(&verdict.observed_hash)
        .bind(diff_summary)
        .bind(verdict.severity.as_str())
        .bind(verdict.status.as_str())
        .bind(verdict.detected_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Verdict rows for a site, newest first. This is the read surface the
    /// review UI consumes.
    pub async fn list_verdicts(&self, site_id: i64) -> Result<Vec<VerdictRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT url, baseline_hash, observed_hash, diff_summary, severity, status, detected_at
            FROM diff_evidence
            WHERE site_id = ?
            ORDER BY detected_at DESC, id DESC
            "#,
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| VerdictRow {
                url: r.get("url"),
                baseline_hash: r.get("baseline_hash"),
                observed_hash: r.get("observed_hash"),
                diff_summary: r.get("diff_summary"),
                severity: r.get("severity"),
                status: r.get("status"),
                detected_at: parse_datetime(r.get("detected_at")),
            })
            .collect())
    }

    pub async fn count_verdicts(&self, site_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM diff_evidence WHERE site_id = ?")
            .bind(site_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn row_to_site(row: &SqliteRow) -> Site {
    Site {
        site_id: row.get("site_id"),
        customer_id: row.get("customer_id"),
        seed_url: row.get("url"),
        enabled: row.get::<i64, _>("enabled") != 0,
    }
}

fn row_to_job(row: &SqliteRow) -> CrawlJobRecord {
    let status = match row.get::<&str, _>("status") {
        "completed" => JobStatusKind::Completed,
        "failed" => JobStatusKind::Failed,
        _ => JobStatusKind::Running,
    };
    CrawlJobRecord {
        job_id: row.get("job_id"),
        site_id: row.get("site_id"),
        customer_id: row.get("customer_id"),
        start_url: row.get("start_url"),
        status,
        pages_crawled: row.get::<i64, _>("pages_crawled") as u32,
        started_at: parse_datetime(row.get("started_at")),
        completed_at: row.get::<Option<&str>, _>("completed_at").map(parse_datetime),
        error_msg: row.get("error_msg"),
    }
}

fn row_to_baseline(row: &SqliteRow) -> Result<BaselineRow, StoreError> {
    let tag_paths: Vec<String> = serde_json::from_str(row.get("fingerprint_json"))?;
    let script_srcs: Vec<String> = serde_json::from_str(row.get("script_srcs_json"))?;
    Ok(BaselineRow {
        site_id: row.get("site_id"),
        url: row.get("url"),
        html_hash: row.get("html_hash"),
        structural_hash: row.get("structural_hash"),
        norm_version: row.get("norm_version"),
        snapshot_path: row.get("snapshot_path"),
        tag_paths,
        script_srcs,
        created_at: parse_datetime(row.get("created_at")),
        updated_at: parse_datetime(row.get("updated_at")),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
