// Sanitizer for externally supplied content (persisted snapshots, pasted
// HTML) before it is merged into the live document.
//
// Strips script and style elements, inline event-handler attributes and
// attributes whose value is a `javascript:` URL. Everything else, including
// sibling formatting markup, is left untouched. Passes repeat until nothing
// matches, so fragments that only form a tag after an inner removal are
// caught too.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use tandem_common::types::DocumentContent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub script_elements: usize,
    pub style_elements: usize,
    pub event_handlers: usize,
    pub javascript_urls: usize,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.script_elements + self.style_elements + self.event_handlers + self.javascript_urls
    }

    fn merge(&mut self, other: SanitizeReport) {
        self.script_elements += other.script_elements;
        self.style_elements += other.style_elements;
        self.event_handlers += other.event_handlers;
        self.javascript_urls += other.javascript_urls;
    }
}

struct Patterns {
    script_block: Regex,
    style_block: Regex,
    stray_script: Regex,
    stray_style: Regex,
    tag: Regex,
    event_handler: Regex,
    javascript_url: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        script_block: Regex::new(r"(?is)<script\b[^>]*>.*?(?:</\s*script\s*>|\z)")
            .expect("script block pattern should compile"),
        style_block: Regex::new(r"(?is)<style\b[^>]*>.*?(?:</\s*style\s*>|\z)")
            .expect("style block pattern should compile"),
        stray_script: Regex::new(r"(?i)</?\s*script[^>]*>?").expect("stray script pattern should compile"),
        stray_style: Regex::new(r"(?i)</?\s*style[^>]*>?").expect("stray style pattern should compile"),
        // Quoted attribute values may contain `>`; an unbalanced quote falls
        // back to a plain character so the tag still ends at the next `>`.
        tag: Regex::new(r#"<[A-Za-z](?:"[^"]*"|'[^']*'|[^'">]|["'])*>"#).expect("tag pattern should compile"),
        event_handler: Regex::new(r#"(?i)[\s/]+on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#)
            .expect("event handler pattern should compile"),
        javascript_url: Regex::new(
            r#"(?i)[\s/]+[a-z_:.-]+\s*=\s*(?:"\s*javascript:[^"]*"|'\s*javascript:[^']*'|javascript:[^\s>]*)"#,
        )
        .expect("javascript url pattern should compile"),
    })
}

/// Sanitize one fragment, returning the cleaned text and what was removed.
pub fn sanitize_fragment(input: &str) -> (String, SanitizeReport) {
    let mut output = input.to_string();
    let mut report = SanitizeReport::default();
    loop {
        let (next, pass) = sanitize_pass(&output);
        if pass.is_clean() {
            return (output, report);
        }
        report.merge(pass);
        output = next;
    }
}

fn sanitize_pass(input: &str) -> (String, SanitizeReport) {
    let patterns = patterns();
    let mut report = SanitizeReport::default();

    let (text, removed) = remove_all(&patterns.script_block, input);
    report.script_elements += removed;
    let (text, removed) = remove_all(&patterns.style_block, &text);
    report.style_elements += removed;
    let (text, removed) = remove_all(&patterns.stray_script, &text);
    report.script_elements += removed;
    let (text, removed) = remove_all(&patterns.stray_style, &text);
    report.style_elements += removed;

    let text = patterns
        .tag
        .replace_all(&text, |caps: &Captures<'_>| {
            let (tag, removed) = remove_all(&patterns.event_handler, &caps[0]);
            report.event_handlers += removed;
            let (tag, removed) = remove_all(&patterns.javascript_url, &tag);
            report.javascript_urls += removed;
            tag
        })
        .into_owned();

    (text, report)
}

fn remove_all(pattern: &Regex, input: &str) -> (String, usize) {
    let count = pattern.find_iter(input).count();
    if count == 0 {
        return (input.to_string(), 0);
    }
    (pattern.replace_all(input, "").into_owned(), count)
}

/// Sanitize both fields of a snapshot.
pub fn sanitize_content(content: &DocumentContent) -> (DocumentContent, SanitizeReport) {
    let (title, mut report) = sanitize_fragment(&content.title);
    let (body, body_report) = sanitize_fragment(&content.body);
    report.merge(body_report);
    (DocumentContent { title, body }, report)
}
