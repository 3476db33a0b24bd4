use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Site ---

/// A monitored site. Rows are created and edited outside the crawler;
/// the core only reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub site_id: i64,
    pub customer_id: i64,
    pub seed_url: String,
    pub enabled: bool,
}

// --- Crawl job ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatusKind {
    Running,
    Completed,
    Failed,
}

impl JobStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatusKind::Running => "running",
            JobStatusKind::Completed => "completed",
            JobStatusKind::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJobRecord {
    pub job_id: String,
    pub site_id: i64,
    pub customer_id: i64,
    pub start_url: String,
    pub status: JobStatusKind,
    pub pages_crawled: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
}

// --- Crawl page (CRAWL mode record) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPageRecord {
    pub job_id: String,
    pub site_id: i64,
    pub url: String,
    pub parent_url: Option<String>,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub response_time_ms: i64,
    pub fetched_at: DateTime<Utc>,
}

// --- Page version (baseline snapshot) ---

/// A normalized-content snapshot of one URL. Immutable once written:
/// re-baselining produces a new snapshot revision, never an overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageVersion {
    pub url: String,
    pub normalized_text: String,
    /// Sorted multiset of tag-paths of the post-cleanup DOM.
    pub tag_paths: Vec<String>,
    pub script_srcs: Vec<String>,
    pub content_hash: String,
    pub structural_hash: String,
    pub norm_version: String,
    pub snapshot_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- Verdict ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Clean,
    PotentialDefacement,
    Defaced,
    Failed,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Clean => "CLEAN",
            VerdictStatus::PotentialDefacement => "POTENTIAL_DEFACEMENT",
            VerdictStatus::Defaced => "DEFACED",
            VerdictStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "NONE",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Labels attached to a verdict explaining which signals fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Indicator {
    HashMatch,
    ScriptAdded,
    ScriptRemoved,
    StructuralCollapse,
    TextReplacement,
    VersionMismatch,
}

impl Indicator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Indicator::HashMatch => "HASH_MATCH",
            Indicator::ScriptAdded => "SCRIPT_ADDED",
            Indicator::ScriptRemoved => "SCRIPT_REMOVED",
            Indicator::StructuralCollapse => "STRUCTURAL_COLLAPSE",
            Indicator::TextReplacement => "TEXT_REPLACEMENT",
            Indicator::VersionMismatch => "VERSION_MISMATCH",
        }
    }
}

/// The immutable output of one comparator run. Retries produce new verdicts;
/// a persisted verdict is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub url: String,
    pub baseline_hash: Option<String>,
    pub observed_hash: String,
    pub status: VerdictStatus,
    pub severity: Severity,
    pub confidence: f64,
    pub structural_drift: f64,
    pub content_drift: f64,
    pub indicators: Vec<Indicator>,
    pub detected_at: DateTime<Utc>,
}

impl Verdict {
    pub fn has_indicator(&self, indicator: Indicator) -> bool {
        self.indicators.contains(&indicator)
    }
}

// --- Per-job accounting ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlStats {
    pub pages_crawled: u32,
    pub pages_failed: u32,
    pub urls_blocked: u32,
    pub elapsed_s: f64,
}
