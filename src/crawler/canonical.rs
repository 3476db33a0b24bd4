//! URL canonicalization. The canonical form is the only legal identity for a
//! page: every enqueue, dedup lookup, cache key and persisted row goes through
//! [`canonicalize`] first, and the function is idempotent.

use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("URL outside the site's domain scope: {0}")]
    OutOfScope(String),
}

/// Query parameters that carry tracking or presentation state rather than
/// page identity. Removed before dedup so variants collapse to one URL.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "ref",
    "session",
    "sessionid",
    "sid",
    "orderby",
    "sort",
    "order",
    "add-to-cart",
];

/// Everything except RFC 3986 unreserved characters gets percent-encoded when
/// path segments are re-assembled.
const SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Repair `https:host/...` forms where the `//` after the scheme is missing.
/// Applied both to raw inputs and to href attributes found in documents.
pub(crate) fn repair_scheme(raw: &str) -> String {
    let bytes = raw.as_bytes();
    for scheme in ["https:", "http:"] {
        if bytes.len() > scheme.len()
            && bytes[..scheme.len()].eq_ignore_ascii_case(scheme.as_bytes())
            && bytes[scheme.len()].is_ascii_alphanumeric()
        {
            return format!("{}//{}", &raw[..scheme.len()], &raw[scheme.len()..]);
        }
    }
    raw.to_string()
}

/// Canonicalize a raw URL. Fails with `InvalidUrl` for non-web schemes,
/// bare fragments and unparseable input.
pub fn canonicalize(raw: &str) -> Result<String, CanonicalError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return Err(CanonicalError::InvalidUrl(raw.to_string()));
    }

    let repaired = repair_scheme(raw);
    let mut url =
        Url::parse(&repaired).map_err(|e| CanonicalError::InvalidUrl(format!("{raw}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(CanonicalError::InvalidUrl(raw.to_string())),
    }

    // http and https variants of a page are the same page; https is canonical.
    if url.scheme() == "http" {
        let _ = url.set_scheme("https");
    }

    let host = url
        .host_str()
        .ok_or_else(|| CanonicalError::InvalidUrl(raw.to_string()))?
        .to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        return Err(CanonicalError::InvalidUrl(raw.to_string()));
    }
    url.set_host(Some(&host))
        .map_err(|e| CanonicalError::InvalidUrl(format!("{raw}: {e}")))?;

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.retain(|(k, _)| !TRACKING_PARAMS.contains(&k.to_ascii_lowercase().as_str()));
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let normalized_path = normalize_path(url.path());
    url.set_path(&normalized_path);

    Ok(url.to_string())
}

/// Canonicalize and additionally enforce the site's domain scope.
pub fn canonicalize_in_scope(raw: &str, scope: &SiteScope) -> Result<String, CanonicalError> {
    let canonical = canonicalize(raw)?;
    if scope.contains(&canonical) {
        Ok(canonical)
    } else {
        Err(CanonicalError::OutOfScope(canonical))
    }
}

/// Collapse repeated slashes, resolve `.` / `..`, percent-decode unreserved
/// characters and re-encode everything else. Drops any trailing slash except
/// for the root path.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<String> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(normalize_segment(seg)),
        }
    }
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn normalize_segment(seg: &str) -> String {
    let decoded: Vec<u8> = percent_decode_str(seg).collect();
    percent_encode(&decoded, SEGMENT_ENCODE_SET).to_string()
}

/// The crawl scope derived from a site's canonical seed URL. The seed host
/// and any of its subdomains are in scope; everything else is `OutOfScope`.
#[derive(Debug, Clone)]
pub struct SiteScope {
    host: String,
}

impl SiteScope {
    pub fn from_seed(canonical_seed: &str) -> Result<Self, CanonicalError> {
        let url = Url::parse(canonical_seed)
            .map_err(|e| CanonicalError::InvalidUrl(format!("{canonical_seed}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| CanonicalError::InvalidUrl(canonical_seed.to_string()))?
            .to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
        Ok(SiteScope { host })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether a canonical URL belongs to this site.
    pub fn contains(&self, canonical_url: &str) -> bool {
        let Ok(url) = Url::parse(canonical_url) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        host == self.host || host.ends_with(&format!(".{}", self.host))
    }
}
