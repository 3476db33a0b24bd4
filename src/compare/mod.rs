//! The verdict engine. Pure: it never mutates baselines, never promotes
//! snapshots, never looks at other URLs. Same inputs and policy produce the
//! same verdict field for field (timestamps aside).

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::fingerprint::{content_hash, NORM_VERSION};
use crate::models::{Indicator, PageVersion, Severity, Verdict, VerdictStatus};

/// Tunables for the comparison. Everything below the noise floor is treated
/// as ordinary content churn.
#[derive(Debug, Clone)]
pub struct ComparePolicy {
    pub noise_floor: f64,
}

impl Default for ComparePolicy {
    fn default() -> Self {
        ComparePolicy { noise_floor: 0.05 }
    }
}

const STRUCTURAL_COLLAPSE_THRESHOLD: f64 = 0.6;
const TEXT_REPLACEMENT_THRESHOLD: f64 = 0.7;

/// The live page as observed by this crawl pass.
#[derive(Debug, Clone)]
pub struct LiveObservation {
    pub url: String,
    pub normalized_text: String,
    pub tag_paths: Vec<String>,
    pub script_srcs: Vec<String>,
}

/// Compare a live observation to its stored baseline.
pub fn evaluate(
    live: &LiveObservation,
    baseline: &PageVersion,
    policy: &ComparePolicy,
) -> Verdict {
    let observed_hash = content_hash(&live.normalized_text);

    if baseline.norm_version != NORM_VERSION {
        return Verdict {
            url: live.url.clone(),
            baseline_hash: Some(baseline.content_hash.clone()),
            observed_hash,
            status: VerdictStatus::Failed,
            severity: Severity::None,
            confidence: 0.0,
            structural_drift: 0.0,
            content_drift: 0.0,
            indicators: vec![Indicator::VersionMismatch],
            detected_at: Utc::now(),
        };
    }

    if observed_hash == baseline.content_hash {
        return Verdict {
            url: live.url.clone(),
            baseline_hash: Some(baseline.content_hash.clone()),
            observed_hash,
            status: VerdictStatus::Clean,
            severity: Severity::None,
            confidence: 1.0,
            structural_drift: 0.0,
            content_drift: 0.0,
            indicators: vec![Indicator::HashMatch],
            detected_at: Utc::now(),
        };
    }

    let structural_drift = jaccard_distance(&live.tag_paths, &baseline.tag_paths);
    let content_drift = cosine_distance(&live.normalized_text, &baseline.normalized_text);

    let live_scripts: HashSet<&String> = live.script_srcs.iter().collect();
    let base_scripts: HashSet<&String> = baseline.script_srcs.iter().collect();
    let script_added = live_scripts.difference(&base_scripts).next().is_some();
    let script_removed = base_scripts.difference(&live_scripts).next().is_some();

    let mut indicators = Vec::new();
    if script_added {
        indicators.push(Indicator::ScriptAdded);
    }
    if script_removed {
        indicators.push(Indicator::ScriptRemoved);
    }
    let structural_collapse = structural_drift >= STRUCTURAL_COLLAPSE_THRESHOLD;
    if structural_collapse {
        indicators.push(Indicator::StructuralCollapse);
    }
    let text_replacement = content_drift >= TEXT_REPLACEMENT_THRESHOLD;
    if text_replacement {
        indicators.push(Indicator::TextReplacement);
    }

    let (status, severity, confidence) = if script_added {
        let severity = if structural_collapse || text_replacement {
            Severity::Critical
        } else {
            Severity::High
        };
        (VerdictStatus::Defaced, severity, 0.9)
    } else if structural_collapse {
        (VerdictStatus::Defaced, Severity::High, 0.85)
    } else if text_replacement && !script_removed {
        (VerdictStatus::PotentialDefacement, Severity::Medium, 0.7)
    } else if structural_drift < policy.noise_floor && content_drift < policy.noise_floor {
        (VerdictStatus::Clean, Severity::None, 1.0 - content_drift)
    } else {
        (VerdictStatus::PotentialDefacement, Severity::Low, 0.5)
    };

    Verdict {
        url: live.url.clone(),
        baseline_hash: Some(baseline.content_hash.clone()),
        observed_hash,
        status,
        severity,
        confidence,
        structural_drift,
        content_drift,
        indicators,
        detected_at: Utc::now(),
    }
}

/// Verdict for a URL that has no stored baseline to compare against.
pub fn no_baseline_verdict(url: &str, observed_hash: String) -> Verdict {
    Verdict {
        url: url.to_string(),
        baseline_hash: None,
        observed_hash,
        status: VerdictStatus::Failed,
        severity: Severity::None,
        confidence: 0.0,
        structural_drift: 0.0,
        content_drift: 0.0,
        indicators: Vec::new(),
        detected_at: Utc::now(),
    }
}

/// Jaccard distance between two tag-path sets. Empty vs empty is identity.
pub fn jaccard_distance(a: &[String], b: &[String]) -> f64 {
    let sa: HashSet<&String> = a.iter().collect();
    let sb: HashSet<&String> = b.iter().collect();
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    1.0 - intersection / union
}

/// One minus the cosine similarity of the two texts' token multisets.
pub fn cosine_distance(a: &str, b: &str) -> f64 {
    let ta = token_counts(a);
    let tb = token_counts(b);
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 1.0;
    }

    let dot: f64 = ta
        .iter()
        .filter_map(|(token, ca)| tb.get(token).map(|cb| ca * cb))
        .sum();
    let norm_a: f64 = ta.values().map(|c| c * c).sum::<f64>().sqrt();
    let norm_b: f64 = tb.values().map(|c| c * c).sum::<f64>().sqrt();
    (1.0 - dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

fn token_counts(text: &str) -> HashMap<&str, f64> {
    let mut counts: HashMap<&str, f64> = HashMap::new();
    for token in text.split_whitespace() {
        *counts.entry(token).or_insert(0.0) += 1.0;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::structural_hash;

    fn baseline(text: &str, tag_paths: Vec<String>, scripts: Vec<String>) -> PageVersion {
        PageVersion {
            url: "https://x.test/".to_string(),
            normalized_text: text.to_string(),
            tag_paths: tag_paths.clone(),
            script_srcs: scripts,
            content_hash: content_hash(text),
            structural_hash: structural_hash(&tag_paths),
            norm_version: NORM_VERSION.to_string(),
            snapshot_path: None,
            created_at: Utc::now(),
        }
    }

    fn live(text: &str, tag_paths: Vec<String>, scripts: Vec<String>) -> LiveObservation {
        LiveObservation {
            url: "https://x.test/".to_string(),
            normalized_text: text.to_string(),
            tag_paths,
            script_srcs: scripts,
        }
    }

    fn paths(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("/html/body/div{i}")).collect()
    }

    #[test]
    fn test_clean_on_hash_match() {
        let b = baseline("same text", paths(4), vec!["a.js".to_string()]);
        let l = live("same text", paths(4), vec!["a.js".to_string()]);
        let v = evaluate(&l, &b, &ComparePolicy::default());
        assert_eq!(v.status, VerdictStatus::Clean);
        assert_eq!(v.severity, Severity::None);
        assert_eq!(v.confidence, 1.0);
        assert_eq!(v.indicators, vec![Indicator::HashMatch]);
    }

    #[test]
    fn test_defaced_on_script_injection() {
        let b = baseline(
            "welcome to our shop front page with products",
            paths(6),
            vec!["a.js".to_string()],
        );
        let l = live(
            "welcome to our shop front page with some products",
            paths(6),
            vec!["a.js".to_string(), "evil.js".to_string()],
        );
        let v = evaluate(&l, &b, &ComparePolicy::default());
        assert_eq!(v.status, VerdictStatus::Defaced);
        assert_eq!(v.severity, Severity::High);
        assert!((v.confidence - 0.9).abs() < 1e-9);
        assert!(v.has_indicator(Indicator::ScriptAdded));
    }

    #[test]
    fn test_critical_when_injection_plus_replacement() {
        let b = baseline(
            "company news products careers contact imprint",
            paths(8),
            vec![],
        );
        let l = live(
            "hacked by somebody entirely different words everywhere",
            paths(8),
            vec!["evil.js".to_string()],
        );
        let v = evaluate(&l, &b, &ComparePolicy::default());
        assert_eq!(v.status, VerdictStatus::Defaced);
        assert_eq!(v.severity, Severity::Critical);
        assert!(v.has_indicator(Indicator::ScriptAdded));
        assert!(v.has_indicator(Indicator::TextReplacement));
    }

    #[test]
    fn test_structural_collapse() {
        let b = baseline("some words here", paths(20), vec![]);
        let l = live("some words there", paths(2), vec![]);
        let v = evaluate(&l, &b, &ComparePolicy::default());
        assert!(v.structural_drift >= 0.6);
        assert_eq!(v.status, VerdictStatus::Defaced);
        assert_eq!(v.severity, Severity::High);
        assert!((v.confidence - 0.85).abs() < 1e-9);
        assert!(v.has_indicator(Indicator::StructuralCollapse));
    }

    #[test]
    fn test_potential_defacement_on_text_replacement() {
        let b = baseline(
            "alpha beta gamma delta epsilon zeta eta theta",
            paths(10),
            vec!["a.js".to_string()],
        );
        let mut near = paths(10);
        near[0] = "/html/body/div-x".to_string();
        let l = live(
            "one two three four five six seven eight",
            near,
            vec!["a.js".to_string()],
        );
        let v = evaluate(&l, &b, &ComparePolicy::default());
        assert!(v.content_drift >= 0.7, "content_drift = {}", v.content_drift);
        assert!(v.structural_drift < 0.6);
        assert_eq!(v.status, VerdictStatus::PotentialDefacement);
        assert_eq!(v.severity, Severity::Medium);
        assert!((v.confidence - 0.7).abs() < 1e-9);
        assert!(v.has_indicator(Indicator::TextReplacement));
    }

    #[test]
    fn test_clean_below_noise_floor() {
        let words: Vec<String> = (0..100).map(|i| format!("word{i}")).collect();
        let base_text = words.join(" ");
        let mut live_words = words.clone();
        live_words[99] = "changed".to_string();
        let l = live(&live_words.join(" "), paths(10), vec![]);
        let b = baseline(&base_text, paths(10), vec![]);
        let v = evaluate(&l, &b, &ComparePolicy::default());
        assert_eq!(v.status, VerdictStatus::Clean);
        assert_eq!(v.severity, Severity::None);
    }

    #[test]
    fn test_low_severity_drift_between_floors() {
        let words: Vec<String> = (0..10).map(|i| format!("word{i}")).collect();
        let mut live_words = words.clone();
        live_words[0] = "swapped".to_string();
        live_words[1] = "tokens".to_string();
        let l = live(&live_words.join(" "), paths(10), vec![]);
        let b = baseline(&words.join(" "), paths(10), vec![]);
        let v = evaluate(&l, &b, &ComparePolicy::default());
        assert_eq!(v.status, VerdictStatus::PotentialDefacement);
        assert_eq!(v.severity, Severity::Low);
        assert!((v.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_version_mismatch_fails() {
        let mut b = baseline("text", paths(3), vec![]);
        b.norm_version = "v0.9".to_string();
        let l = live("text", paths(3), vec![]);
        let v = evaluate(&l, &b, &ComparePolicy::default());
        assert_eq!(v.status, VerdictStatus::Failed);
        assert_eq!(v.indicators, vec![Indicator::VersionMismatch]);
    }

    #[test]
    fn test_no_baseline_verdict() {
        let v = no_baseline_verdict("https://x.test/", content_hash("x"));
        assert_eq!(v.status, VerdictStatus::Failed);
        assert_eq!(v.severity, Severity::None);
        assert!(v.baseline_hash.is_none());
    }

    #[test]
    fn test_comparator_deterministic() {
        let b = baseline("alpha beta gamma", paths(5), vec!["a.js".to_string()]);
        let l = live("alpha beta delta", paths(6), vec!["b.js".to_string()]);
        let policy = ComparePolicy::default();
        let v1 = evaluate(&l, &b, &policy);
        let v2 = evaluate(&l, &b, &policy);
        assert_eq!(v1.status, v2.status);
        assert_eq!(v1.severity, v2.severity);
        assert_eq!(v1.confidence, v2.confidence);
        assert_eq!(v1.structural_drift, v2.structural_drift);
        assert_eq!(v1.content_drift, v2.content_drift);
        assert_eq!(v1.indicators, v2.indicators);
    }

    #[test]
    fn test_distance_edge_cases() {
        assert_eq!(jaccard_distance(&[], &[]), 0.0);
        assert_eq!(jaccard_distance(&paths(3), &[]), 1.0);
        assert_eq!(jaccard_distance(&paths(3), &paths(3)), 0.0);

        assert_eq!(cosine_distance("", ""), 0.0);
        assert_eq!(cosine_distance("a b", ""), 1.0);
        assert!(cosine_distance("a b c", "a b c") < 1e-9);
        assert!((cosine_distance("a a a", "b b b") - 1.0).abs() < 1e-9);
    }
}
