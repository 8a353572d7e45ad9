//! Structural handling of unified diffs.
//!
//! The validator never executes a diff to learn what it touches: scope
//! checking (step 4) works purely off the parsed file list and hunk ranges.
//! Applying and reverting single-file patches is also done here so the
//! scripted sandbox and the mutation engine can round-trip content without a
//! container.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::DiffError;

/// One line inside a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Removed(String),
    Added(String),
}

/// Line span covered by a hunk, as declared in its `@@` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkRange {
    /// 1-based first line in the old file.
    pub old_start: usize,
    pub old_lines: usize,
    /// 1-based first line in the new file.
    pub new_start: usize,
    pub new_lines: usize,
}

/// A single hunk: its declared range plus body lines.
#[derive(Debug, Clone)]
pub struct Hunk {
    pub range: HunkRange,
    pub lines: Vec<DiffLine>,
}

/// All hunks of a diff that touch one file.
#[derive(Debug, Clone)]
pub struct FilePatch {
    pub path: String,
    pub hunks: Vec<Hunk>,
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:---|\+\+\+) (?:[ab]/)?(\S+)").expect("valid regex"))
}

fn hunk_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid regex")
    })
}

/// The de-duplicated list of files a unified diff touches.
///
/// `/dev/null` headers (file creation/deletion) are skipped.
pub fn touched_files(diff: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in diff.lines() {
        if let Some(caps) = header_re().captures(line) {
            let path = caps[1].to_string();
            if path != "/dev/null" && !files.contains(&path) {
                files.push(path);
            }
        }
    }
    files
}

/// Parse a unified diff into per-file patches.
pub fn parse(diff: &str) -> Result<Vec<FilePatch>, DiffError> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut current: Option<FilePatch> = None;

    for (idx, line) in diff.lines().enumerate() {
        if line.starts_with("diff ") || line.starts_with("index ") || line.starts_with("--- ") {
            continue;
        }
        if line.starts_with("+++ ") {
            if let Some(p) = current.take() {
                patches.push(p);
            }
            let path = header_re()
                .captures(line)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            current = Some(FilePatch {
                path,
                hunks: Vec::new(),
            });
            continue;
        }
        if line.starts_with("@@") {
            let caps = hunk_re()
                .captures(line)
                .ok_or_else(|| DiffError::MalformedHunk {
                    line: idx + 1,
                    text: line.to_string(),
                })?;
            let range = HunkRange {
                old_start: caps[1].parse().unwrap_or(0),
                old_lines: caps.get(2).map_or(1, |m| m.as_str().parse().unwrap_or(1)),
                new_start: caps[3].parse().unwrap_or(0),
                new_lines: caps.get(4).map_or(1, |m| m.as_str().parse().unwrap_or(1)),
            };
            if let Some(ref mut patch) = current {
                patch.hunks.push(Hunk {
                    range,
                    lines: Vec::new(),
                });
            }
            continue;
        }
        if let Some(ref mut patch) = current {
            if let Some(hunk) = patch.hunks.last_mut() {
                let diff_line = match line.as_bytes().first() {
                    Some(b' ') => DiffLine::Context(line[1..].to_string()),
                    Some(b'-') => DiffLine::Removed(line[1..].to_string()),
                    Some(b'+') => DiffLine::Added(line[1..].to_string()),
                    // A fully empty body line is a blank context line whose
                    // leading space was trimmed in transit.
                    None => DiffLine::Context(String::new()),
                    // "\ No newline at end of file" and stray noise.
                    _ => continue,
                };
                hunk.lines.push(diff_line);
            }
        }
    }
    if let Some(p) = current.take() {
        patches.push(p);
    }
    if patches.is_empty() {
        return Err(DiffError::Empty);
    }
    Ok(patches)
}

impl FilePatch {
    /// Apply this patch to file content, returning the new content.
    pub fn apply(&self, content: &str) -> Result<String, DiffError> {
        self.transform(content, false)
    }

    /// Revert this patch from already-patched content.
    ///
    /// `patch.apply(x)` followed by `patch.revert(..)` reproduces `x`
    /// byte-for-byte for any content the patch applies to cleanly.
    pub fn revert(&self, content: &str) -> Result<String, DiffError> {
        self.transform(content, true)
    }

    fn transform(&self, content: &str, reverse: bool) -> Result<String, DiffError> {
        let had_trailing_newline = content.ends_with('\n') || content.is_empty();
        let old: Vec<&str> = content.lines().collect();
        let mut out: Vec<String> = Vec::with_capacity(old.len());
        // 0-based cursor into `old`.
        let mut cursor = 0usize;

        for hunk in &self.hunks {
            let start = if reverse {
                hunk.range.new_start
            } else {
                hunk.range.old_start
            };
            let start = start.saturating_sub(1);
            if start < cursor {
                return Err(DiffError::MalformedHunk {
                    line: start + 1,
                    text: "hunks overlap or out of order".to_string(),
                });
            }
            while cursor < start && cursor < old.len() {
                out.push(old[cursor].to_string());
                cursor += 1;
            }

            for dl in &hunk.lines {
                let (expect_old, emit) = match (dl, reverse) {
                    (DiffLine::Context(s), _) => (Some(s), Some(s)),
                    (DiffLine::Removed(s), false) | (DiffLine::Added(s), true) => (Some(s), None),
                    (DiffLine::Added(s), false) | (DiffLine::Removed(s), true) => (None, Some(s)),
                };
                if let Some(expected) = expect_old {
                    let found = old.get(cursor).copied().unwrap_or("<eof>");
                    if found != expected {
                        return Err(DiffError::ApplyConflict {
                            line: cursor + 1,
                            expected: expected.clone(),
                            found: found.to_string(),
                        });
                    }
                    cursor += 1;
                }
                if let Some(line) = emit {
                    out.push(line.clone());
                }
            }
        }
        while cursor < old.len() {
            out.push(old[cursor].to_string());
            cursor += 1;
        }

        let mut result = out.join("\n");
        if had_trailing_newline && !result.is_empty() {
            result.push('\n');
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
--- a/src/calc.py
+++ b/src/calc.py
@@ -1,4 +1,4 @@
 def add(a, b):
-    return a + b
+    return a - b

 def mul(a, b):
";

    const CONTENT: &str = "def add(a, b):\n    return a + b\n\ndef mul(a, b):\n    return a * b\n";

    #[test]
    fn touched_files_deduplicates_and_skips_dev_null() {
        let diff = "--- a/x.py\n+++ b/x.py\n--- /dev/null\n+++ b/new.py\n";
        assert_eq!(touched_files(diff), vec!["x.py", "new.py"]);
    }

    #[test]
    fn parse_extracts_hunk_ranges() {
        let patches = parse(SAMPLE).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path, "src/calc.py");
        let range = patches[0].hunks[0].range;
        assert_eq!(range.old_start, 1);
        assert_eq!(range.old_lines, 4);
    }

    #[test]
    fn blank_context_lines_are_kept() {
        // The blank line between add and mul carries no leading space in
        // SAMPLE; it must still count against the declared old-line span.
        let patch = &parse(SAMPLE).unwrap()[0];
        let lines = &patch.hunks[0].lines;
        assert_eq!(lines.len(), 5);
        assert!(lines.contains(&DiffLine::Context(String::new())));
    }

    #[test]
    fn apply_then_revert_round_trips() {
        let patch = &parse(SAMPLE).unwrap()[0];
        let buggy = patch.apply(CONTENT).unwrap();
        assert!(buggy.contains("return a - b"));
        assert!(!buggy.contains("return a + b"));
        let restored = patch.revert(&buggy).unwrap();
        assert_eq!(restored, CONTENT);
    }

    #[test]
    fn apply_conflict_is_reported() {
        let patch = &parse(SAMPLE).unwrap()[0];
        let err = patch.apply("def add(a, b):\n    return a * b\n").unwrap_err();
        match err {
            DiffError::ApplyConflict { expected, .. } => {
                assert_eq!(expected, "    return a + b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_diff_rejected() {
        assert!(matches!(parse("not a diff\n"), Err(DiffError::Empty)));
    }

    #[test]
    fn multi_file_diff_parses_both() {
        let diff = "\
--- a/a.py
+++ b/a.py
@@ -1,1 +1,1 @@
-x = 1
+x = 2
--- a/b.py
+++ b/b.py
@@ -1,1 +1,1 @@
-y = 1
+y = 2
";
        let patches = parse(diff).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].path, "b.py");
    }
}
