//! Markup sanitization
//!
//! Whitelist sanitizer for externally sourced markup that gets reused
//! server-side (tenant descriptions, ingested rich text). Everything not on
//! the whitelist is stripped or escaped; `script`/`style` bodies are dropped
//! entirely. Input is NFC-normalized first so lookalike sequences cannot
//! smuggle tags past the tokenizer.

use regex::Regex;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

/// Whitelist-based HTML sanitizer.
pub struct MarkupSanitizer {
    /// Tags kept with no attributes at all.
    simple_tags: HashSet<&'static str>,
    tag_regex: Regex,
    drop_body_regex: Regex,
    href_regex: Regex,
}

impl MarkupSanitizer {
    /// Sanitizer with the platform's default whitelist.
    pub fn new() -> Self {
        let simple_tags: HashSet<&'static str> = [
            "b", "i", "em", "strong", "p", "br", "ul", "ol", "li", "code", "pre",
        ]
        .into_iter()
        .collect();

        let tag_regex =
            Regex::new(r#"(?s)<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)((?:[^>"']|"[^"]*"|'[^']*')*)>"#)
                .unwrap();
        let drop_body_regex =
            Regex::new(r"(?is)<\s*(script|style)\b.*?</\s*(script|style)\s*>").unwrap();
        let href_regex =
            Regex::new(r#"(?i)href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).unwrap();

        Self {
            simple_tags,
            tag_regex,
            drop_body_regex,
            href_regex,
        }
    }

    /// Sanitize markup down to the whitelist. Disallowed tags are removed
    /// (their text content survives); text content is entity-escaped.
    pub fn sanitize(&self, input: &str) -> String {
        let normalized: String = input.nfc().collect();
        let stripped = self.drop_body_regex.replace_all(&normalized, "");

        let mut output = String::with_capacity(stripped.len());
        let mut cursor = 0;

        for m in self.tag_regex.find_iter(&stripped) {
            output.push_str(&escape_text(&stripped[cursor..m.start()]));
            cursor = m.end();

            let caps = self.tag_regex.captures(m.as_str()).unwrap();
            let closing = !caps[1].is_empty();
            let name = caps[2].to_lowercase();
            let attrs = caps.get(3).map_or("", |a| a.as_str());

            if self.simple_tags.contains(name.as_str()) {
                if closing {
                    output.push_str(&format!("</{}>", name));
                } else {
                    output.push_str(&format!("<{}>", name));
                }
            } else if name == "a" {
                if closing {
                    output.push_str("</a>");
                } else if let Some(href) = self.safe_href(attrs) {
                    output.push_str(&format!("<a href=\"{}\">", href));
                } else {
                    output.push_str("<a>");
                }
            }
            // Any other tag is dropped.
        }

        output.push_str(&escape_text(&stripped[cursor..]));
        output
    }

    /// Extract an href and keep it only if the scheme is http(s) or the URL
    /// is site-relative. `javascript:` and friends never survive.
    fn safe_href(&self, attrs: &str) -> Option<String> {
        let caps = self.href_regex.captures(attrs)?;
        let raw = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))?
            .as_str()
            .trim();

        let lowered = raw.to_lowercase();
        let allowed = lowered.starts_with("http://")
            || lowered.starts_with("https://")
            || (raw.starts_with('/') && !raw.starts_with("//"));

        if allowed {
            Some(escape_text(raw))
        } else {
            None
        }
    }
}

impl Default for MarkupSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
