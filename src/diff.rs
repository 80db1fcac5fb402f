//! Single-file unified diff parsing and application.
//!
//! Application is all-or-nothing: every hunk is applied in memory first and the
//! file is written once, atomically, only if all of them matched.
//!
//! The parser is deliberately forgiving about what agents actually send:
//! hunk header counts are treated as hints, the old start line is only a
//! starting point for an outward search, and a line with an unknown prefix ends
//! the current hunk instead of failing the whole diff.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{DiffError, FileError, ToolError};
use crate::workspace::{Workspace, WorkspacePath};

#[derive(Debug, Clone, PartialEq, Eq)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Context,
    Remove,
    Add,
}

#[derive(Debug, Clone)]
pub struct Hunk {
    pub header: String,
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    lines: Vec<HunkLine>,
    old_missing_newline: bool,
    new_missing_newline: bool,
}

impl Hunk {
    /// The lines this hunk expects to find in the current file.
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn creates_file(&self) -> bool {
        self.old_path.as_deref() == Some("/dev/null")
    }

    pub fn deletes_file(&self) -> bool {
        self.new_path.as_deref() == Some("/dev/null")
    }
}

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex is valid")
    })
}

struct HunkBuilder {
    hunk: Hunk,
    old_seen: usize,
    new_seen: usize,
    /// Bare empty lines are held back: they are empty context lines unless
    /// they turn out to be trailing blank lines after the hunk.
    pending_blank: usize,
    last: Option<LineKind>,
}

impl HunkBuilder {
    fn start(header: &str) -> Result<Self, DiffError> {
        let caps = hunk_header_re()
            .captures(header)
            .ok_or_else(|| DiffError::BadHeader(header.to_string()))?;
        let num = |i: usize, default: usize| -> Result<usize, DiffError> {
            match caps.get(i) {
                Some(m) => m
                    .as_str()
                    .parse()
                    .map_err(|_| DiffError::BadHeader(header.to_string())),
                None => Ok(default),
            }
        };

        Ok(Self {
            hunk: Hunk {
                header: header.trim_end().to_string(),
                old_start: num(1, 0)?,
                old_count: num(2, 1)?,
                new_start: num(3, 0)?,
                new_count: num(4, 1)?,
                lines: Vec::new(),
                old_missing_newline: false,
                new_missing_newline: false,
            },
            old_seen: 0,
            new_seen: 0,
            pending_blank: 0,
            last: None,
        })
    }

    fn is_complete(&self) -> bool {
        self.old_seen + self.pending_blank >= self.hunk.old_count
            && self.new_seen + self.pending_blank >= self.hunk.new_count
    }

    fn flush_blank(&mut self, n: usize) {
        for _ in 0..n {
            self.hunk.lines.push(HunkLine::Context(String::new()));
            self.old_seen += 1;
            self.new_seen += 1;
            self.last = Some(LineKind::Context);
        }
        self.pending_blank -= n;
    }

    /// Returns false when `raw` is not a hunk body line.
    fn push(&mut self, raw: &str) -> bool {
        let Some(first) = raw.chars().next() else {
            self.pending_blank += 1;
            return true;
        };
        let body = &raw[first.len_utf8()..];
        match first {
            ' ' | '-' | '+' => {
                self.flush_blank(self.pending_blank);
                let (line, kind) = match first {
                    ' ' => (HunkLine::Context(body.to_string()), LineKind::Context),
                    '-' => (HunkLine::Remove(body.to_string()), LineKind::Remove),
                    _ => (HunkLine::Add(body.to_string()), LineKind::Add),
                };
                if kind != LineKind::Add {
                    self.old_seen += 1;
                }
                if kind != LineKind::Remove {
                    self.new_seen += 1;
                }
                self.hunk.lines.push(line);
                self.last = Some(kind);
                true
            }
            '\\' => {
                self.mark_no_newline();
                true
            }
            _ => false,
        }
    }

    fn mark_no_newline(&mut self) {
        match self.last {
            Some(LineKind::Remove) => self.hunk.old_missing_newline = true,
            Some(LineKind::Add) => self.hunk.new_missing_newline = true,
            Some(LineKind::Context) => {
                self.hunk.old_missing_newline = true;
                self.hunk.new_missing_newline = true;
            }
            None => {}
        }
    }

    fn finish(mut self) -> Hunk {
        // Blank lines the header counts still ask for are real context.
        let old_deficit = self.hunk.old_count.saturating_sub(self.old_seen);
        let new_deficit = self.hunk.new_count.saturating_sub(self.new_seen);
        let wanted = old_deficit.min(new_deficit).min(self.pending_blank);
        self.flush_blank(wanted);
        self.hunk
    }
}

fn header_path(rest: &str) -> String {
    // "a/src/x.py\t2024-01-01 ..." -> "src/x.py"
    let p = rest.split('\t').next().unwrap_or(rest).trim();
    if p == "/dev/null" {
        return p.to_string();
    }
    p.strip_prefix("a/")
        .or_else(|| p.strip_prefix("b/"))
        .unwrap_or(p)
        .to_string()
}

pub fn parse_unified_diff(diff: &str) -> Result<FilePatch, DiffError> {
    let mut patch = FilePatch::default();
    let mut current: Option<HunkBuilder> = None;

    for raw in diff.lines() {
        let is_header = raw.starts_with("@@");

        if let Some(b) = current.as_mut() {
            // Counts are hints both ways: body lines past them still belong to
            // the hunk, unless the hunk is full and the line opens a new file.
            let file_header = raw.starts_with("--- ") || raw.starts_with("+++ ");
            if !is_header && !(file_header && b.is_complete()) && b.push(raw) {
                continue;
            }
            if let Some(done) = current.take() {
                patch.hunks.push(done.finish());
            }
        }

        if is_header {
            current = Some(HunkBuilder::start(raw)?);
        } else if let Some(rest) = raw.strip_prefix("--- ") {
            if !patch.hunks.is_empty() {
                return Err(DiffError::MultipleFiles);
            }
            patch.old_path = Some(header_path(rest));
        } else if let Some(rest) = raw.strip_prefix("+++ ") {
            patch.new_path = Some(header_path(rest));
        }
        // `diff --git`, `index`, mode lines and stray text between hunks are skipped.
    }

    if let Some(done) = current.take() {
        patch.hunks.push(done.finish());
    }
    if patch.hunks.is_empty() {
        return Err(DiffError::NoHunks);
    }
    Ok(patch)
}

fn dominant_eol(text: &str) -> &'static str {
    let lf = text.matches('\n').count();
    let crlf = text.matches("\r\n").count();
    if crlf > 0 && crlf * 2 >= lf {
        "\r\n"
    } else {
        "\n"
    }
}

fn block_matches(lines: &[&str], block: &[&str], at: usize, loose: bool) -> bool {
    lines[at..at + block.len()]
        .iter()
        .zip(block)
        .all(|(have, want)| {
            if loose {
                have.trim_end() == want.trim_end()
            } else {
                have == want
            }
        })
}

/// Find `block` in `lines[floor..]`, starting at `hint` and moving outward.
/// Exact matches anywhere win over whitespace-insensitive ones.
fn locate(lines: &[&str], block: &[&str], hint: usize, floor: usize) -> Option<usize> {
    if block.is_empty() {
        return Some(hint.clamp(floor, lines.len()));
    }
    if floor + block.len() > lines.len() {
        return None;
    }

    let last_start = lines.len() - block.len();
    let hint = hint.clamp(floor, last_start);
    let max_distance = (hint - floor).max(last_start - hint);

    for loose in [false, true] {
        for delta in 0..=max_distance {
            if hint + delta <= last_start && block_matches(lines, block, hint + delta, loose) {
                return Some(hint + delta);
            }
            if delta > 0 && hint >= floor + delta && block_matches(lines, block, hint - delta, loose) {
                return Some(hint - delta);
            }
        }
    }
    None
}

/// One line of the original file with its own terminator (`""`, `"\n"` or `"\r\n"`).
#[derive(Clone, Copy)]
struct Line<'a> {
    text: &'a str,
    eol: &'a str,
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    text.split_inclusive('\n')
        .map(|piece| {
            let body = match piece.strip_suffix('\n') {
                Some(b) => b.strip_suffix('\r').unwrap_or(b),
                None => piece,
            };
            Line {
                text: body,
                eol: &piece[body.len()..],
            }
        })
        .collect()
}

/// Apply every hunk of `patch` to `original`, or fail without partial output.
///
/// Untouched and context lines keep their own terminators; added lines use the
/// file's dominant one.
pub fn apply_patch(original: &str, patch: &FilePatch) -> Result<String, DiffError> {
    let eol = dominant_eol(original);
    let source = split_lines(original);
    let lines: Vec<&str> = source.iter().map(|l| l.text).collect();
    let mut trailing_newline = original.is_empty() || original.ends_with('\n');

    let mut out: Vec<Line<'_>> = Vec::with_capacity(source.len());
    let mut cursor = 0usize;

    for (idx, hunk) in patch.hunks.iter().enumerate() {
        let old_block = hunk.old_lines();
        // "-0,0" / "-N,0" hunks insert *after* line N.
        let hint = if old_block.is_empty() {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };

        let pos = locate(&lines, &old_block, hint, cursor).ok_or_else(|| DiffError::HunkMismatch {
            index: idx + 1,
            header: hunk.header.clone(),
            hint: hunk.old_start,
        })?;

        out.extend_from_slice(&source[cursor..pos]);
        let mut k = pos;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(_) => {
                    // Keep the file's bytes, which may differ in trailing whitespace.
                    out.push(source[k]);
                    k += 1;
                }
                HunkLine::Remove(_) => k += 1,
                HunkLine::Add(text) => out.push(Line {
                    text: text.as_str(),
                    eol: "",
                }),
            }
        }
        cursor = k;

        if cursor == source.len() {
            if hunk.new_missing_newline {
                trailing_newline = false;
            } else if hunk.old_missing_newline {
                trailing_newline = true;
            }
        }
    }
    out.extend_from_slice(&source[cursor..]);

    let last = out.len().saturating_sub(1);
    let mut text = String::with_capacity(original.len() + 64);
    for (i, line) in out.iter().enumerate() {
        text.push_str(line.text);
        if i == last && !trailing_newline {
            continue;
        }
        text.push_str(if line.eol.is_empty() { eol } else { line.eol });
    }
    Ok(text)
}

/// Outcome of a successful [`apply_diff`].
#[derive(Debug, Clone)]
pub struct AppliedDiff {
    pub path: WorkspacePath,
    pub hunks_applied: usize,
    /// File bytes before the write; `None` when the diff created the file.
    pub pre_image: Option<Vec<u8>>,
    pub removed: bool,
}

/// Apply a single-file unified diff to `path` inside the workspace.
///
/// Never creates a checkpoint; that is the caller's decision.
pub fn apply_diff(ws: &Workspace, path: &str, diff: &str) -> Result<AppliedDiff, ToolError> {
    let target = ws.resolve(path)?;
    let patch = parse_unified_diff(diff)?;

    if let Some(named) = patch.new_path.as_deref().filter(|p| *p != "/dev/null") {
        if named != target.rel {
            tracing::debug!(param = %target.rel, header = %named, "diff header names a different file; using the path parameter");
        }
    }

    let pre_image = ws.read_bytes(&target)?;
    let updated = {
        let original = match &pre_image {
            Some(_) if patch.creates_file() => return Err(DiffError::TargetExists(target.rel.clone()).into()),
            Some(bytes) => std::str::from_utf8(bytes).map_err(|_| FileError::NotText(target.rel.clone()))?,
            None if patch.creates_file() => "",
            None => return Err(FileError::NotFound(target.rel.clone()).into()),
        };
        apply_patch(original, &patch)?
    };

    let removed = patch.deletes_file() && updated.is_empty();
    if removed {
        ws.remove_file(&target)?;
    } else {
        ws.write_atomic(&target, updated.as_bytes())?;
    }

    tracing::info!(path = %target.rel, hunks = patch.hunks.len(), removed, "diff applied");
    Ok(AppliedDiff {
        path: target,
        hunks_applied: patch.hunks.len(),
        pre_image,
        removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::TokioRunner;
    use tempfile::TempDir;

    const MAIN_PY: &str = "\ndef add(a: int, b: int) -> int:\n    \"\"\"Add two numbers.\"\"\"\n    return a + b\n\ndef multiply(a: int, b: int) -> int:\n    \"\"\"Multiply two numbers.\"\"\"\n    return a * b\n";

    fn apply_str(original: &str, diff: &str) -> Result<String, DiffError> {
        apply_patch(original, &parse_unified_diff(diff)?)
    }

    #[test]
    fn context_is_found_away_from_the_header_hint() {
        // Header says line 1, but the file starts with a blank line.
        let diff = "--- a/main.py\n+++ b/main.py\n@@ -1,5 +1,5 @@\n def add(a: int, b: int) -> int:\n     \"\"\"Add two numbers.\"\"\"\n-    return a + b\n+    return a + b  # simple addition\n";
        let out = apply_str(MAIN_PY, diff).unwrap();
        assert!(out.contains("    return a + b  # simple addition\n"));
        assert!(out.contains("return a * b\n"));
        assert!(out.starts_with('\n'));
    }

    #[test]
    fn removal_with_overstated_counts() {
        let diff = "--- a/main.py\n+++ b/main.py\n@@ -1,5 +1,4 @@\n-def add(a: int, b: int) -> int:\n-    \"\"\"Add two numbers.\"\"\"\n-    return a + b\n+\n";
        let out = apply_str(MAIN_PY, diff).unwrap();
        assert!(!out.contains("def add"));
        assert!(out.contains("def multiply"));
    }

    #[test]
    fn trailing_garbage_ends_the_hunk() {
        let diff = "--- a/main.py\n+++ b/main.py\n@@ -5,3 +5,4 @@\n def multiply(a: int, b: int) -> int:\n     \"\"\"Multiply two numbers.\"\"\"\n     return a * b\n+\n# End of file\n";
        let out = apply_str(MAIN_PY, diff).unwrap();
        assert!(out.ends_with("    return a * b\n\n"));
        assert!(!out.contains("End of file"));
    }

    #[test]
    fn mismatch_names_the_hunk() {
        let diff = "@@ -1,2 +1,2 @@\n a\n-b\n+c\n@@ -10,1 +10,1 @@\n-nope\n+yes\n";
        let err = apply_str("a\nb\nx\n", diff).unwrap_err();
        match err {
            DiffError::HunkMismatch { index, header, hint } => {
                assert_eq!(index, 2);
                assert_eq!(header, "@@ -10,1 +10,1 @@");
                assert_eq!(hint, 10);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn hunks_apply_in_order_and_never_overlap() {
        let original = "x\ny\nx\ny\n";
        let diff = "@@ -1,2 +1,2 @@\n x\n-y\n+one\n@@ -1,2 +1,2 @@\n x\n-y\n+two\n";
        // The second hunk's hint points at line 1, but it must land after the first.
        assert_eq!(apply_str(original, diff).unwrap(), "x\none\nx\ntwo\n");
    }

    #[test]
    fn no_newline_markers_are_honored() {
        let diff = "@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n";
        assert_eq!(apply_str("a", diff).unwrap(), "b\n");

        let diff = "@@ -1 +1 @@\n-a\n+b\n\\ No newline at end of file\n";
        assert_eq!(apply_str("a\n", diff).unwrap(), "b");
    }

    #[test]
    fn crlf_files_keep_crlf() {
        let diff = "@@ -1,2 +1,2 @@\n one\n-two\n+2\n";
        assert_eq!(apply_str("one\r\ntwo\r\n", diff).unwrap(), "one\r\n2\r\n");
    }

    #[test]
    fn mixed_line_endings_outside_hunks_are_untouched() {
        let diff = "@@ -3 +3 @@\n-c\n+C\n";
        assert_eq!(apply_str("a\r\nb\nc\n", diff).unwrap(), "a\r\nb\nC\n");

        // Context keeps its own terminator, additions take the dominant one.
        let diff = "@@ -1,2 +1,3 @@\n one\n+mid\n two\n";
        assert_eq!(apply_str("one\r\ntwo\nthree\r\n", diff).unwrap(), "one\r\nmid\r\ntwo\nthree\r\n");
    }

    #[test]
    fn body_lines_past_the_header_counts_are_kept() {
        assert_eq!(apply_str("a\n", "@@ -1 +1 @@\n-a\n+b\n+c\n").unwrap(), "b\nc\n");

        // Understated old count: the extra removal still has to match.
        let diff = "@@ -1 +1 @@\n-a\n-b\n+x\n";
        assert_eq!(apply_str("a\nb\nc\n", diff).unwrap(), "x\nc\n");
        let err = apply_str("a\nq\nc\n", diff).unwrap_err();
        assert!(matches!(err, DiffError::HunkMismatch { index: 1, .. }));
    }

    #[test]
    fn whitespace_only_drift_still_applies() {
        let diff = "@@ -1,2 +1,2 @@\n keep\n-old\n+new\n";
        assert_eq!(apply_str("keep   \nold\n", diff).unwrap(), "keep   \nnew\n");
    }

    #[test]
    fn malformed_inputs() {
        assert_eq!(parse_unified_diff("just text\n").unwrap_err(), DiffError::NoHunks);
        assert!(matches!(parse_unified_diff("@@ nonsense @@\n+x\n"), Err(DiffError::BadHeader(_))));
        let two_files = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n--- a/y\n+++ b/y\n@@ -1 +1 @@\n-c\n+d\n";
        assert_eq!(parse_unified_diff(two_files).unwrap_err(), DiffError::MultipleFiles);
    }

    #[test]
    fn apply_diff_writes_or_leaves_untouched() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("main.py"), MAIN_PY).unwrap();
        let ws = Workspace::open(tmp.path(), Box::new(TokioRunner::new().unwrap())).unwrap();

        let bad = "@@ -1,1 +1,1 @@\n-not in the file\n+x\n";
        let err = apply_diff(&ws, "main.py", bad).unwrap_err();
        assert!(matches!(err, ToolError::Diff(DiffError::HunkMismatch { .. })));
        assert_eq!(std::fs::read_to_string(tmp.path().join("main.py")).unwrap(), MAIN_PY);

        let good = "@@ -8,1 +8,1 @@\n-    return a * b\n+    return b * a\n";
        let applied = apply_diff(&ws, "main.py", good).unwrap();
        assert_eq!(applied.hunks_applied, 1);
        assert_eq!(applied.pre_image.as_deref(), Some(MAIN_PY.as_bytes()));
        assert!(std::fs::read_to_string(tmp.path().join("main.py")).unwrap().contains("return b * a"));

        let err = apply_diff(&ws, "missing.py", good).unwrap_err();
        assert!(matches!(err, ToolError::File(FileError::NotFound(_))));
        let err = apply_diff(&ws, "../escape.py", good).unwrap_err();
        assert!(matches!(err, ToolError::File(FileError::OutsideRoot(_))));
    }

    #[test]
    fn dev_null_diffs_create_and_delete() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::open(tmp.path(), Box::new(TokioRunner::new().unwrap())).unwrap();

        let create = "--- /dev/null\n+++ b/pkg/new.py\n@@ -0,0 +1,2 @@\n+x = 1\n+y = 2\n";
        let applied = apply_diff(&ws, "pkg/new.py", create).unwrap();
        assert!(applied.pre_image.is_none());
        assert_eq!(std::fs::read_to_string(tmp.path().join("pkg/new.py")).unwrap(), "x = 1\ny = 2\n");

        let again = "--- /dev/null\n+++ b/pkg/new.py\n@@ -0,0 +1 @@\n+new = 1\n";
        let err = apply_diff(&ws, "pkg/new.py", again).unwrap_err();
        assert!(matches!(err, ToolError::Diff(DiffError::TargetExists(_))));
        assert_eq!(std::fs::read_to_string(tmp.path().join("pkg/new.py")).unwrap(), "x = 1\ny = 2\n");

        let delete = "--- a/pkg/new.py\n+++ /dev/null\n@@ -1,2 +0,0 @@\n-x = 1\n-y = 2\n";
        let applied = apply_diff(&ws, "pkg/new.py", delete).unwrap();
        assert!(applied.removed);
        assert!(!tmp.path().join("pkg/new.py").exists());
    }
}
