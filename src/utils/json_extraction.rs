//! Extraction of structured payloads from LLM responses.
//!
//! Agent responses arrive as free text that may wrap the interesting payload
//! in markdown fences or surround it with prose. These helpers pull out the
//! first JSON object (for the injector's artifact) or the first unified diff
//! (for the solver's patch) without assuming a well-behaved model.
//!
//! Extraction strategies for JSON, tried in order:
//! 1. A ```json fenced block
//! 2. Any generic fenced block whose body starts with `{`
//! 3. Brace matching from the first `{` in the content

use regex::Regex;
use std::sync::OnceLock;

/// Extract the first JSON object from mixed LLM output.
///
/// Returns the raw JSON string; the caller decides what schema it must obey.
pub fn extract_json_object(content: &str) -> Option<String> {
    if let Some(block) = extract_fenced_block(content, Some("json")) {
        if block.trim_start().starts_with('{') {
            return Some(block);
        }
    }
    if let Some(block) = extract_fenced_block(content, None) {
        if block.trim_start().starts_with('{') {
            return Some(block);
        }
    }
    let start = content.find('{')?;
    let candidate = &content[start..];
    let end = find_matching_brace(candidate)?;
    Some(candidate[..=end].to_string())
}

/// Extract a unified diff from mixed LLM output.
///
/// Prefers a ```diff fenced block; otherwise scans for the first `--- `
/// header and takes everything from there that still looks like diff lines.
pub fn extract_unified_diff(content: &str) -> Option<String> {
    if let Some(block) = extract_fenced_block(content, Some("diff")) {
        if block.contains("--- ") {
            return Some(block);
        }
    }
    if let Some(block) = extract_fenced_block(content, Some("patch")) {
        if block.contains("--- ") {
            return Some(block);
        }
    }
    if let Some(block) = extract_fenced_block(content, None) {
        if block.contains("--- ") && block.contains("+++ ") {
            return Some(block);
        }
    }

    let start = content.find("--- ")?;
    let tail = &content[start..];
    let mut lines = Vec::new();
    for line in tail.lines() {
        if line.starts_with("--- ")
            || line.starts_with("+++ ")
            || line.starts_with("@@")
            || line.starts_with('+')
            || line.starts_with('-')
            || line.starts_with(' ')
            || line.starts_with('\\')
            || line.is_empty()
        {
            lines.push(line);
        } else {
            break;
        }
    }
    // Trim trailing prose-adjacent blank lines.
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    if lines.len() < 3 {
        return None;
    }
    let mut diff = lines.join("\n");
    diff.push('\n');
    Some(diff)
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```([a-zA-Z]*)\n(.*?)```").expect("valid regex"))
}

/// Body of the first fenced block, optionally requiring a language tag.
fn extract_fenced_block(content: &str, language: Option<&str>) -> Option<String> {
    for caps in fence_re().captures_iter(content) {
        let tag = caps.get(1).map_or("", |m| m.as_str());
        match language {
            Some(want) if !tag.eq_ignore_ascii_case(want) => continue,
            _ => return Some(caps[2].to_string()),
        }
    }
    None
}

/// Index of the brace matching the leading `{`, respecting strings/escapes.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
