//! Shared utilities.

pub mod json_extraction;

/// Last `max` bytes of a string, trimmed to a char boundary. Used to bound
/// captured command output in reports and attempt records.
pub(crate) fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let start = s.len() - max;
    let start = (start..=s.len())
        .find(|i| s.is_char_boundary(*i))
        .unwrap_or(s.len());
    s[start..].to_string()
}
