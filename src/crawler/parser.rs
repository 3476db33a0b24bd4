//! Link extraction and the render-decision heuristic.

use std::collections::HashSet;
use std::sync::Mutex;

use scraper::{Html, Selector};
use url::Url;

use super::canonical::repair_scheme;

/// Attribute sources that can reference other documents.
const URL_SOURCES: &[(&str, &str)] = &[
    ("a[href]", "href"),
    ("img[src]", "src"),
    ("link[href]", "href"),
    ("script[src]", "src"),
    ("iframe[src]", "src"),
];

/// Extract absolute http(s) URLs referenced by the document. Relative
/// references are resolved against `base`, fragment-only references are
/// dropped, and the result is deduplicated in document order.
pub fn extract_urls(html: &str, base: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let base = match Url::parse(base) {
        Ok(b) => b,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for (selector_str, attr) in URL_SOURCES {
        let selector = Selector::parse(selector_str).unwrap();
        for el in document.select(&selector) {
            let Some(value) = el.value().attr(attr) else {
                continue;
            };
            if let Some(resolved) = resolve_reference(value, &base) {
                if seen.insert(resolved.clone()) {
                    urls.push(resolved);
                }
            }
        }
    }
    urls
}

/// Absolute script sources of the document, for script-set comparison.
pub fn extract_script_srcs(html: &str, base: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let base = match Url::parse(base) {
        Ok(b) => b,
        Err(_) => return Vec::new(),
    };
    let selector = Selector::parse("script[src]").unwrap();

    let mut seen = HashSet::new();
    let mut srcs = Vec::new();
    for el in document.select(&selector) {
        let Some(value) = el.value().attr("src") else {
            continue;
        };
        if let Some(resolved) = resolve_reference(value, &base) {
            if seen.insert(resolved.clone()) {
                srcs.push(resolved);
            }
        }
    }
    srcs
}

fn resolve_reference(value: &str, base: &Url) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('#') {
        return None;
    }
    let repaired = repair_scheme(value);
    let resolved = base.join(&repaired).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

/// Markers left in server-delivered HTML by SPA frameworks whose real content
/// only exists after hydration.
const SPA_ROOT_MARKERS: &[&str] = &[
    r#"id="root""#,
    r#"id='root'"#,
    r#"id="app""#,
    r#"id='app'"#,
    "ng-app",
    "data-reactroot",
];

/// Heuristic: does this body need a headless render before normalization?
/// Fires on known SPA root markers or a low visible-text-to-script ratio.
pub fn needs_js_rendering(html: &str) -> bool {
    if SPA_ROOT_MARKERS.iter().any(|m| html.contains(m)) {
        return true;
    }

    let document = Html::parse_document(html);
    let body_selector = Selector::parse("body").unwrap();
    let script_selector = Selector::parse("script").unwrap();

    let text_len: usize = document
        .select(&body_selector)
        .next()
        .map(|body| {
            body.text()
                .map(|t| t.split_whitespace().map(str::len).sum::<usize>())
                .sum()
        })
        .unwrap_or(0);
    let script_len: usize = document
        .select(&script_selector)
        .map(|s| s.inner_html().len())
        .sum();

    script_len >= 2048 && text_len < script_len / 10
}

/// Hosts observed to serve SPA shells. Later URLs on a hinted host skip the
/// plain fetch and go straight to render.
#[derive(Debug, Default)]
pub struct SpaHints {
    hosts: Mutex<HashSet<String>>,
}

impl SpaHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, url: &str) {
        if let Some(host) = host_of(url) {
            self.hosts.lock().unwrap().insert(host);
        }
    }

    pub fn is_hinted(&self, url: &str) -> bool {
        match host_of(url) {
            Some(host) => self.hosts.lock().unwrap().contains(&host),
            None => false,
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}
