//! `---` delimited `key: value` front-matter.
//!
//! Hand-parsed; the format is flat. Anything malformed degrades to defaults with a
//! warning so indexing never aborts on a bad header.

use tracing::warn;

use crate::types::{ConfidenceTier, Source};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontMatter {
    pub category: Option<String>,
    pub source: Source,
    /// Declared confidence, used as a cap on the derived tier.
    pub confidence: Option<ConfidenceTier>,
    pub last_verified: Option<String>,
    /// Provenance detail: a URL, a task id, a session id.
    pub origin: Option<String>,
}

/// Parse front-matter from `text`. Returns the metadata and the byte offset where the
/// body starts (0 when there is no front-matter).
pub fn parse(text: &str, file: &str) -> (FrontMatter, usize) {
    let mut fm = FrontMatter::default();

    let Some(first_len) = delimiter_len(text) else {
        return (fm, 0);
    };

    // Scan lines after the opening delimiter for the closing one.
    let mut pos = first_len;
    let mut header_end = None;
    for line in text[first_len..].split_inclusive('\n') {
        if line.trim_end() == "---" {
            header_end = Some((pos, pos + line.len()));
            break;
        }
        pos += line.len();
    }

    let Some((header_close, body_start)) = header_end else {
        warn!(file, "unterminated front-matter, treating file as plain text");
        return (fm, 0);
    };

    for (n, raw) in text[first_len..header_close].lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            warn!(file, line = n + 2, "malformed front-matter line ignored");
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "category" => fm.category = Some(value.to_string()),
            "source" => match value.parse::<Source>() {
                Ok(s) => fm.source = s,
                Err(e) => warn!(file, "{e}, defaulting to file"),
            },
            "confidence" => match value.parse::<ConfidenceTier>() {
                Ok(c) => fm.confidence = Some(c),
                Err(e) => warn!(file, "{e}, confidence will be derived"),
            },
            "last_verified" => fm.last_verified = Some(value.to_string()),
            "origin" => fm.origin = Some(value.to_string()),
            other => tracing::debug!(file, key = other, "unknown front-matter key"),
        }
    }

    (fm, body_start)
}

/// Render front-matter for a fact file. Keys are written in a fixed order.
pub fn render(fm: &FrontMatter) -> String {
    let mut out = String::from("---\n");
    out.push_str(&format!("source: {}\n", fm.source));
    if let Some(category) = &fm.category {
        out.push_str(&format!("category: {category}\n"));
    }
    if let Some(confidence) = fm.confidence {
        out.push_str(&format!("confidence: {confidence}\n"));
    }
    if let Some(last_verified) = &fm.last_verified {
        out.push_str(&format!("last_verified: {last_verified}\n"));
    }
    if let Some(origin) = &fm.origin {
        out.push_str(&format!("origin: {}\n", origin.replace('\n', " ")));
    }
    out.push_str("---\n");
    out
}

fn delimiter_len(text: &str) -> Option<usize> {
    if text.starts_with("---\n") {
        Some(4)
    } else if text.starts_with("---\r\n") {
        Some(5)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_keys_and_body_offset() {
        let text = "---\nsource: user_stated\ncategory: family\nconfidence: high\nlast_verified: 2026-01-02\norigin: chat\n---\nBody here.\n";
        let (fm, body) = parse(text, "f.md");
        assert_eq!(fm.source, Source::UserStated);
        assert_eq!(fm.category.as_deref(), Some("family"));
        assert_eq!(fm.confidence, Some(ConfidenceTier::High));
        assert_eq!(fm.last_verified.as_deref(), Some("2026-01-02"));
        assert_eq!(fm.origin.as_deref(), Some("chat"));
        assert_eq!(&text[body..], "Body here.\n");
    }

    #[test]
    fn missing_front_matter_gives_defaults() {
        let (fm, body) = parse("# Title\n\nText", "f.md");
        assert_eq!(fm, FrontMatter::default());
        assert_eq!(fm.source, Source::File);
        assert_eq!(body, 0);
    }

    #[test]
    fn malformed_values_degrade_to_defaults() {
        let text = "---\nsource: gossip\nconfidence: certain\nthis line has no colon\ncategory: \"home\"\n---\nx";
        let (fm, body) = parse(text, "f.md");
        assert_eq!(fm.source, Source::File);
        assert_eq!(fm.confidence, None);
        assert_eq!(fm.category.as_deref(), Some("home"));
        assert_eq!(&text[body..], "x");
    }

    #[test]
    fn unterminated_header_is_plain_text() {
        let (fm, body) = parse("---\nsource: web_search\nno end", "f.md");
        assert_eq!(fm.source, Source::File);
        assert_eq!(body, 0);
    }

    #[test]
    fn render_then_parse_preserves_fields() {
        let fm = FrontMatter {
            category: Some("home".into()),
            source: Source::WebSearch,
            confidence: Some(ConfidenceTier::Medium),
            last_verified: Some("2026-05-01T00:00:00Z".into()),
            origin: Some("https://example.com".into()),
        };
        let text = format!("{}The boiler was serviced.\n", render(&fm));
        let (parsed, body) = parse(&text, "f.md");
        assert_eq!(parsed, fm);
        assert_eq!(&text[body..], "The boiler was serviced.\n");
    }
}
