//! URL block rules. Deny-listed path classes, static asset extensions and
//! presentation-only query keys are dropped before they ever reach a worker.

use std::sync::atomic::{AtomicU32, Ordering};

use regex::Regex;
use url::Url;

/// The rule class that blocked a URL. Class names appear verbatim in the
/// BLOCKED URL REPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRule {
    Static,
    TagPage,
    AuthorPage,
    Pagination,
    Assets,
    Query,
}

impl BlockRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockRule::Static => "STATIC",
            BlockRule::TagPage => "TAG_PAGE",
            BlockRule::AuthorPage => "AUTHOR_PAGE",
            BlockRule::Pagination => "PAGINATION",
            BlockRule::Assets => "ASSETS",
            BlockRule::Query => "QUERY",
        }
    }

    const ALL: [BlockRule; 6] = [
        BlockRule::Static,
        BlockRule::TagPage,
        BlockRule::AuthorPage,
        BlockRule::Pagination,
        BlockRule::Assets,
        BlockRule::Query,
    ];
}

const STATIC_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".css", ".js", ".pdf", ".zip", ".rar", ".mp3",
    ".mp4", ".webm", ".woff", ".woff2", ".ttf", ".ico",
];

const BLOCKED_QUERY_KEYS: &[&str] = &["orderby", "sort", "order", "add-to-cart"];

/// Compiled deny rules, built once per process and shared across sites.
pub struct BlockClassifier {
    tag_page: Regex,
    author_page: Regex,
    pagination: Regex,
    assets: Regex,
}

impl Default for BlockClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockClassifier {
    pub fn new() -> Self {
        BlockClassifier {
            tag_page: Regex::new(r"/(product-)?tag/").unwrap(),
            author_page: Regex::new(r"/author/").unwrap(),
            pagination: Regex::new(r"/page/\d+/?").unwrap(),
            assets: Regex::new(r"/(assets|static)/").unwrap(),
        }
    }

    /// Classify a canonical URL against the deny rules. `None` means the URL
    /// may be crawled.
    pub fn classify(&self, canonical_url: &str) -> Option<BlockRule> {
        let url = Url::parse(canonical_url).ok()?;
        let path = url.path();
        let path_lower = path.to_ascii_lowercase();

        if STATIC_EXTENSIONS.iter().any(|ext| path_lower.ends_with(ext)) {
            return Some(BlockRule::Static);
        }
        if self.tag_page.is_match(path) {
            return Some(BlockRule::TagPage);
        }
        if self.author_page.is_match(path) {
            return Some(BlockRule::AuthorPage);
        }
        if self.pagination.is_match(path) {
            return Some(BlockRule::Pagination);
        }
        if self.assets.is_match(path) {
            return Some(BlockRule::Assets);
        }
        if url
            .query_pairs()
            .any(|(k, _)| BLOCKED_QUERY_KEYS.contains(&k.to_ascii_lowercase().as_str()))
        {
            return Some(BlockRule::Query);
        }
        None
    }
}

/// Per-job counters for discarded URLs. Everything here is dropped silently
/// at enqueue time and only surfaces in the end-of-job report.
#[derive(Debug, Default)]
pub struct BlockStats {
    by_rule: [AtomicU32; 6],
    invalid_url: AtomicU32,
    out_of_scope: AtomicU32,
    queue_full: AtomicU32,
}

impl BlockStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_rule(&self, rule: BlockRule) {
        let idx = BlockRule::ALL.iter().position(|r| *r == rule).unwrap();
        self.by_rule[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_invalid(&self) {
        self.invalid_url.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_out_of_scope(&self) {
        self.out_of_scope.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rule_count(&self, rule: BlockRule) -> u32 {
        let idx = BlockRule::ALL.iter().position(|r| *r == rule).unwrap();
        self.by_rule[idx].load(Ordering::Relaxed)
    }

    pub fn total_blocked(&self) -> u32 {
        self.by_rule.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Render the BLOCKED URL REPORT printed at the end of a site job.
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = vec!["BLOCKED URL REPORT".to_string()];
        for rule in BlockRule::ALL {
            lines.push(format!("  {:<12} {}", rule.as_str(), self.rule_count(rule)));
        }
        lines.push(format!(
            "  {:<12} {}",
            "OUT_OF_SCOPE",
            self.out_of_scope.load(Ordering::Relaxed)
        ));
        lines.push(format!(
            "  {:<12} {}",
            "INVALID_URL",
            self.invalid_url.load(Ordering::Relaxed)
        ));
        lines.push(format!(
            "  {:<12} {}",
            "QUEUE_FULL",
            self.queue_full.load(Ordering::Relaxed)
        ));
        lines
    }
}
