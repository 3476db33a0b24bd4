//! Semantic normalization and fingerprinting. Normalization decides what
//! counts as "the same page", so its rule set carries an explicit version
//! tag: snapshots are only comparable within one tag.

use scraper::node::Element;
use scraper::{Html, Node};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Version tag of the normalization rule set. Stamped on every baseline;
/// bumping it invalidates nothing, it just forces fresh baselines.
pub const NORM_VERSION: &str = "v1.2";

/// Subtrees removed wholesale before any text or structure is collected.
const REMOVED_TAGS: &[&str] = &["script", "style", "noscript", "iframe"];

/// The canonical representation of one rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPage {
    /// NFC text with whitespace runs collapsed, in document order.
    pub text: String,
    /// Sorted multiset of tag-paths of the post-cleanup DOM.
    pub tag_paths: Vec<String>,
}

impl NormalizedPage {
    pub fn content_hash(&self) -> String {
        content_hash(&self.text)
    }

    pub fn structural_hash(&self) -> String {
        structural_hash(&self.tag_paths)
    }
}

/// Reduce an HTML document to its canonical text and structural fingerprint.
/// Parsing is lenient; malformed input degrades, it never fails.
pub fn semantic_normalize(html: &str) -> NormalizedPage {
    let document = Html::parse_document(html);
    let mut text_parts: Vec<String> = Vec::new();
    let mut tag_paths: Vec<String> = Vec::new();

    for child in document.tree.root().children() {
        walk(child, "", &mut text_parts, &mut tag_paths);
    }

    tag_paths.sort();
    NormalizedPage {
        text: text_parts.join(" "),
        tag_paths,
    }
}

fn walk(
    node: ego_tree::NodeRef<'_, Node>,
    path: &str,
    text_parts: &mut Vec<String>,
    tag_paths: &mut Vec<String>,
) {
    match node.value() {
        Node::Element(el) => {
            let name = el.name();
            if REMOVED_TAGS.contains(&name) || is_hidden(el) {
                return;
            }
            let child_path = format!("{path}/{name}");
            tag_paths.push(child_path.clone());
            for child in node.children() {
                walk(child, &child_path, text_parts, tag_paths);
            }
        }
        Node::Text(t) => {
            let normalized = normalize_text(&t.text);
            if !normalized.is_empty() {
                text_parts.push(normalized);
            }
        }
        // Comments, doctypes and processing instructions carry no content.
        _ => {}
    }
}

/// NFC-normalize and collapse all whitespace runs to a single space.
fn normalize_text(raw: &str) -> String {
    let composed: String = raw.nfc().collect();
    composed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Inline-hidden subtrees are invisible to visitors and excluded from the
/// canonical form. Only the `style` attribute can hide an element inline;
/// no other attribute influences the canonical text or the tag-path
/// fingerprint, so none is inspected.
fn is_hidden(el: &Element) -> bool {
    el.attr("style").is_some_and(|style| {
        let squashed = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        squashed.contains("display:none")
    })
}

/// SHA-256 of the canonical text, 64 lowercase hex chars.
pub fn content_hash(normalized_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_text.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 over the sorted tag-paths joined with `\n`.
pub fn structural_hash(tag_paths: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag_paths.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_stable_across_noise() {
        let a = r#"<html><body><h1>Welcome</h1><p>Hello   world</p></body></html>"#;
        let b = "<html><body><!-- LiteSpeed cache 2024-01-02 -->\n  <h1>Welcome</h1>\n  <script>track();</script>\n  <p>Hello world</p>\n</body></html>";
        let na = semantic_normalize(a);
        let nb = semantic_normalize(b);
        assert_eq!(na.text, nb.text);
        assert_eq!(na.content_hash(), nb.content_hash());
    }

    #[test]
    fn test_removed_subtrees() {
        let html = r#"<html><body>
            <style>.x{color:red}</style>
            <noscript>enable js</noscript>
            <iframe src="/ad"></iframe>
            <div style="display: none">secret</div>
            <p>visible</p>
        </body></html>"#;
        let n = semantic_normalize(html);
        assert_eq!(n.text, "visible");
        assert!(n.tag_paths.iter().all(|p| !p.contains("iframe")));
        assert!(n.tag_paths.iter().all(|p| !p.contains("style")));
    }

    #[test]
    fn test_nfc_and_whitespace() {
        // "é" precomposed vs combining-accent form.
        let composed = "<p>caf\u{00e9}</p>";
        let decomposed = "<p>cafe\u{0301}</p>";
        let a = semantic_normalize(composed);
        let b = semantic_normalize(decomposed);
        assert_eq!(a.text, b.text);

        let spaced = semantic_normalize("<p>a\n\t  b</p>");
        assert_eq!(spaced.text, "a b");
    }

    #[test]
    fn test_structural_fingerprint_ignores_text() {
        let a = semantic_normalize("<html><body><div><p>old text</p></div></body></html>");
        let b = semantic_normalize("<html><body><div><p>entirely new words</p></div></body></html>");
        assert_eq!(a.tag_paths, b.tag_paths);
        assert_eq!(a.structural_hash(), b.structural_hash());
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_structural_fingerprint_sees_structure() {
        let a = semantic_normalize("<html><body><div><p>x</p><p>y</p></div></body></html>");
        let b = semantic_normalize("<html><body><h1>x</h1></body></html>");
        assert_ne!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_tag_paths_shape() {
        let n = semantic_normalize("<html><body><p>x</p></body></html>");
        assert!(n.tag_paths.contains(&"/html".to_string()));
        assert!(n.tag_paths.contains(&"/html/body/p".to_string()));
        let mut sorted = n.tag_paths.clone();
        sorted.sort();
        assert_eq!(n.tag_paths, sorted);
    }

    #[test]
    fn test_hidden_style_variants() {
        let shown = semantic_normalize(r#"<p style="color: red">kept</p>"#);
        assert_eq!(shown.text, "kept");

        for style in ["display:none", "display: none", "color:red; DISPLAY : NONE"] {
            let n = semantic_normalize(&format!(r#"<p style="{style}">gone</p>"#));
            assert_eq!(n.text, "", "style {style:?} should hide the subtree");
        }
    }

    #[test]
    fn test_hash_format_and_determinism() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(h, content_hash("hello"));

        let paths = vec!["/html".to_string(), "/html/body".to_string()];
        assert_eq!(structural_hash(&paths), structural_hash(&paths));
    }
}
