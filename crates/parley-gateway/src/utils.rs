//! Transport-independent mention and reference conventions.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static INITIAL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:<@([\w/-]+)>|@([\w/-]+))\s*").expect("valid regex"));

static BRACKET_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@([\w/-]+)>").expect("valid regex"));

static AT_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([\w/-]+)").expect("valid regex"));

static THREAD_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"thread:([A-Za-z0-9.\-]+)").expect("valid regex"));

/// Split a leading `@name` or `<@id>` mention off the text. Returns the
/// mention (if any) and the remaining body.
pub fn extract_initial_mention(text: &str) -> (Option<String>, String) {
    let Some(captures) = INITIAL_MENTION.captures(text) else {
        return (None, text.to_string());
    };
    let name = captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string());
    let rest = text[captures.get(0).expect("whole match").end()..].to_string();
    (name, rest)
}

/// Resolve every mention of either form through the caller-supplied
/// id-to-name function. Unknown ids come back as whatever the resolver
/// returns for them.
pub fn replace_all_mentions(text: &str, resolver: impl Fn(&str) -> String) -> String {
    let replaced = BRACKET_MENTION.replace_all(text, |caps: &Captures| resolver(&caps[1]));
    AT_MENTION
        .replace_all(&replaced, |caps: &Captures| resolver(&caps[1]))
        .into_owned()
}

/// Collect every `thread:<id>` reference, in order of appearance.
pub fn extract_thread_references(text: &str) -> Vec<String> {
    THREAD_REFERENCE
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Render a response with its handoffs as trailing `@agent: query` lines.
pub fn format_response(text: &str, handoffs: &HashMap<String, String>) -> String {
    if handoffs.is_empty() {
        return text.to_string();
    }
    let mut entries: Vec<_> = handoffs.iter().collect();
    entries.sort();
    let mut out = format!("{text}\n\nHandoffs:");
    for (agent, query) in entries {
        out.push_str(&format!("\n@{agent}: {query}"));
    }
    out
}
