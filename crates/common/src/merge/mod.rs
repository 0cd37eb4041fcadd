// Three-way line merge with conflict markers.
//
// Alignment is positional: line i of base, local, and remote are compared with
// each other, with missing lines treated as empty. Insertions and deletions
// therefore shift everything after them and may surface as conflicts. Callers
// rely on where conflict blocks land, so the alignment must stay positional.

pub mod markers;
pub mod stats;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use markers::{extract_conflicts, has_conflict_markers, resolve_conflicts, BlockChoice, ExtractedConflict};
pub use stats::{get_merge_stats, MergeStats};

pub const LOCAL_MARKER: &str = "<<<<<<< LOCAL";
pub const SEPARATOR: &str = "=======";
pub const REMOTE_MARKER: &str = ">>>>>>> REMOTE";

/// Inputs beyond this many lines are treated as a whole-file conflict.
pub const MAX_MERGE_LINES: usize = 200_000;

/// One conflict block in merged output.
///
/// Line numbers are 1-based positions in the merged content: `start_line` is
/// the `<<<<<<<` marker and `end_line` the `>>>>>>>` marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSpan {
    pub start_line: usize,
    pub end_line: usize,
    pub local: String,
    pub remote: String,
    pub base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    pub content: String,
    pub conflicts: Vec<ConflictSpan>,
}

impl MergeResult {
    fn clean(content: &str) -> Self {
        Self { success: true, content: content.to_string(), conflicts: Vec::new() }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("content looks binary (contains NUL)")]
    Binary,

    #[error("content has {0} lines, above the merge limit of {MAX_MERGE_LINES}")]
    TooLarge(usize),
}

/// Merge `local` and `remote` against their common ancestor `base`.
///
/// Never fails: inputs the line merge can't handle degrade to a single
/// conflict block holding both whole files.
pub fn merge(base: &str, local: &str, remote: &str) -> MergeResult {
    match try_merge(base, local, remote) {
        Ok(result) => result,
        Err(_) => whole_file_conflict(base, local, remote),
    }
}

/// Line merge that reports why an input was refused instead of degrading.
pub fn try_merge(base: &str, local: &str, remote: &str) -> Result<MergeResult, MergeError> {
    if local == remote {
        return Ok(MergeResult::clean(local));
    }
    if local == base {
        return Ok(MergeResult::clean(remote));
    }
    if remote == base {
        return Ok(MergeResult::clean(local));
    }

    let base_lines = split_lines(base)?;
    let local_lines = split_lines(local)?;
    let remote_lines = split_lines(remote)?;

    let len = base_lines.len().max(local_lines.len()).max(remote_lines.len());
    let mut out: Vec<&str> = Vec::with_capacity(len);
    let mut conflicts = Vec::new();

    for i in 0..len {
        let b = line_at(&base_lines, i);
        let l = line_at(&local_lines, i);
        let r = line_at(&remote_lines, i);

        if l == r || r == b {
            out.push(l);
        } else if l == b {
            out.push(r);
        } else {
            let start_line = out.len() + 1;
            out.extend([LOCAL_MARKER, l, SEPARATOR, r, REMOTE_MARKER]);
            conflicts.push(ConflictSpan {
                start_line,
                end_line: out.len(),
                local: l.to_string(),
                remote: r.to_string(),
                base: b.to_string(),
            });
        }
    }

    Ok(MergeResult { success: conflicts.is_empty(), content: out.join("\n"), conflicts })
}

/// A single conflict block wrapping both complete files.
pub fn whole_file_conflict(base: &str, local: &str, remote: &str) -> MergeResult {
    let content = [LOCAL_MARKER, local, SEPARATOR, remote, REMOTE_MARKER].join("\n");
    let end_line = content.split('\n').count();
    MergeResult {
        success: false,
        content,
        conflicts: vec![ConflictSpan {
            start_line: 1,
            end_line,
            local: local.to_string(),
            remote: remote.to_string(),
            base: base.to_string(),
        }],
    }
}

fn split_lines(content: &str) -> Result<Vec<&str>, MergeError> {
    if content.contains('\0') {
        return Err(MergeError::Binary);
    }
    let lines: Vec<&str> = content.split('\n').collect();
    if lines.len() > MAX_MERGE_LINES {
        return Err(MergeError::TooLarge(lines.len()));
    }
    Ok(lines)
}

fn line_at<'a>(lines: &[&'a str], index: usize) -> &'a str {
    lines.get(index).copied().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_only_change_is_taken() {
        let result = merge("a\nb\nc", "a\nX\nc", "a\nb\nc");
        assert!(result.success);
        assert_eq!(result.content, "a\nX\nc");
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn remote_only_change_is_taken() {
        let result = merge("a\nb\nc", "a\nb\nc", "a\nb\nZ");
        assert!(result.success);
        assert_eq!(result.content, "a\nb\nZ");
    }

    #[test]
    fn convergent_edit_is_clean() {
        let result = merge("a\nb", "a\nQ", "a\nQ");
        assert!(result.success);
        assert_eq!(result.content, "a\nQ");
    }

    #[test]
    fn disjoint_line_edits_combine() {
        let result = merge("a\nb\nc\nd", "A\nb\nc\nd", "a\nb\nc\nD");
        assert!(result.success);
        assert_eq!(result.content, "A\nb\nc\nD");
    }

    #[test]
    fn same_line_edit_produces_conflict_block_at_line_two() {
        let result = merge("a\nb\nc", "a\nX\nc", "a\nY\nc");
        assert!(!result.success);
        assert_eq!(result.content, "a\n<<<<<<< LOCAL\nX\n=======\nY\n>>>>>>> REMOTE\nc");
        assert_eq!(
            result.conflicts,
            vec![ConflictSpan {
                start_line: 2,
                end_line: 6,
                local: "X".into(),
                remote: "Y".into(),
                base: "b".into(),
            }]
        );
    }

    #[test]
    fn later_spans_account_for_earlier_marker_lines() {
        let result = merge("1\n2\n3", "L\n2\nL", "R\n2\nR");
        assert_eq!(result.conflicts.len(), 2);
        assert_eq!(result.conflicts[0].start_line, 1);
        assert_eq!(result.conflicts[0].end_line, 5);
        assert_eq!(result.conflicts[1].start_line, 7);
        assert_eq!(result.conflicts[1].end_line, 11);
    }

    #[test]
    fn insertion_shifts_alignment_into_conflicts() {
        // Inserting a line on one side misaligns every following position.
        let result = merge("a\nb", "new\na\nb", "a\nB");
        assert!(!result.success);
        assert_eq!(result.conflicts[0].local, "a");
        assert_eq!(result.conflicts[0].remote, "B");
        assert!(result.content.ends_with("\nb"));
    }

    #[test]
    fn shorter_sides_read_as_empty_lines() {
        // position 0: local kept base, remote changed -> remote wins
        // position 1: base and remote empty, local added -> local wins
        let result = merge("a", "a\nlocal-tail", "b");
        assert!(result.success);
        assert_eq!(result.content, "b\nlocal-tail");
    }

    #[test]
    fn binary_input_degrades_to_whole_file_conflict() {
        let result = merge("base", "lo\0cal", "remote");
        assert!(!result.success);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].local, "lo\0cal");
        assert_eq!(result.conflicts[0].remote, "remote");
        assert!(result.content.contains("lo\0cal"));
        assert!(result.content.contains("remote"));
    }

    #[test]
    fn try_merge_reports_binary() {
        assert_eq!(try_merge("a", "b\0", "c"), Err(MergeError::Binary));
    }

    #[test]
    fn whole_file_conflict_spans_every_line() {
        let result = whole_file_conflict("", "x\ny", "z");
        assert_eq!(result.content, "<<<<<<< LOCAL\nx\ny\n=======\nz\n>>>>>>> REMOTE");
        assert_eq!(result.conflicts[0].start_line, 1);
        assert_eq!(result.conflicts[0].end_line, 6);
    }

    #[test]
    fn trailing_newline_difference_is_a_line_change() {
        let result = merge("a", "a\n", "a");
        assert!(result.success);
        assert_eq!(result.content, "a\n");
    }
}
