// Reading and resolving conflict markers in merged content.

use serde::{Deserialize, Serialize};

use super::SEPARATOR;

const LOCAL_PREFIX: &str = "<<<<<<<";
const REMOTE_PREFIX: &str = ">>>>>>>";

/// Which side of every conflict block to keep.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BlockChoice {
    Local,
    Remote,
    /// Leave markers in place for hand-editing.
    Manual,
}

/// A conflict block found in content, with 1-based marker line numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedConflict {
    pub start_line: usize,
    pub end_line: usize,
    pub local: String,
    pub remote: String,
}

/// True if any line opens or closes a conflict block.
pub fn has_conflict_markers(content: &str) -> bool {
    content
        .split('\n')
        .any(|line| line.starts_with(LOCAL_PREFIX) || line.starts_with(REMOTE_PREFIX))
}

/// Replace every complete conflict block with one of its sides.
///
/// Blocks missing their separator or closing marker are left exactly as they
/// were, so malformed input never loses text.
pub fn resolve_conflicts(content: &str, choice: BlockChoice) -> String {
    if choice == BlockChoice::Manual {
        return content.to_string();
    }

    let mut out: Vec<&str> = Vec::new();
    let mut block = Block::default();

    for line in content.split('\n') {
        match block.state {
            State::Outside => {
                if line.starts_with(LOCAL_PREFIX) {
                    block.open(line);
                } else {
                    out.push(line);
                }
            }
            State::Local => {
                block.raw.push(line);
                if line == SEPARATOR {
                    block.state = State::Remote;
                } else {
                    block.local.push(line);
                }
            }
            State::Remote => {
                block.raw.push(line);
                if line.starts_with(REMOTE_PREFIX) {
                    let kept = match choice {
                        BlockChoice::Local => &block.local,
                        _ => &block.remote,
                    };
                    out.extend(kept.iter().copied());
                    block = Block::default();
                } else {
                    block.remote.push(line);
                }
            }
        }
    }

    // unterminated block: keep verbatim
    out.extend(block.raw);
    out.join("\n")
}

/// Find every complete conflict block, in order.
///
/// Markers are recognized by line content alone. If either side contains a
/// line that is exactly `=======`, or one starting with `<<<<<<<` or
/// `>>>>>>>`, the block boundaries shift and the extracted sides no longer
/// match the merged inputs.
pub fn extract_conflicts(content: &str) -> Vec<ExtractedConflict> {
    let mut found = Vec::new();
    let mut block = Block::default();
    let mut start_line = 0;

    for (index, line) in content.split('\n').enumerate() {
        let line_no = index + 1;
        match block.state {
            State::Outside => {
                if line.starts_with(LOCAL_PREFIX) {
                    block.open(line);
                    start_line = line_no;
                }
            }
            State::Local => {
                if line == SEPARATOR {
                    block.state = State::Remote;
                } else {
                    block.local.push(line);
                }
            }
            State::Remote => {
                if line.starts_with(REMOTE_PREFIX) {
                    found.push(ExtractedConflict {
                        start_line,
                        end_line: line_no,
                        local: block.local.join("\n"),
                        remote: block.remote.join("\n"),
                    });
                    block = Block::default();
                } else {
                    block.remote.push(line);
                }
            }
        }
    }

    found
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    Outside,
    Local,
    Remote,
}

#[derive(Default)]
struct Block<'a> {
    state: State,
    raw: Vec<&'a str>,
    local: Vec<&'a str>,
    remote: Vec<&'a str>,
}

impl<'a> Block<'a> {
    fn open(&mut self, marker: &'a str) {
        self.state = State::Local;
        self.raw.push(marker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge;

    const MARKED: &str = "a\n<<<<<<< LOCAL\nX\n=======\nY\n>>>>>>> REMOTE\nc";

    #[test]
    fn resolve_remote_keeps_remote_block() {
        assert_eq!(resolve_conflicts(MARKED, BlockChoice::Remote), "a\nY\nc");
    }

    #[test]
    fn resolve_local_keeps_local_block() {
        assert_eq!(resolve_conflicts(MARKED, BlockChoice::Local), "a\nX\nc");
    }

    #[test]
    fn manual_leaves_markers() {
        assert_eq!(resolve_conflicts(MARKED, BlockChoice::Manual), MARKED);
    }

    #[test]
    fn resolves_multi_line_blocks() {
        let resolved = resolve_conflicts(
            "<<<<<<< LOCAL\nl1\nl2\n=======\nr1\n>>>>>>> REMOTE",
            BlockChoice::Local,
        );
        assert_eq!(resolved, "l1\nl2");
    }

    #[test]
    fn unterminated_block_is_kept_verbatim() {
        let broken = "a\n<<<<<<< LOCAL\nX\n=======\nY";
        assert_eq!(resolve_conflicts(broken, BlockChoice::Remote), broken);
        assert!(extract_conflicts(broken).is_empty());
    }

    #[test]
    fn extract_reports_sides_and_line_numbers() {
        let found = extract_conflicts(MARKED);
        assert_eq!(
            found,
            vec![ExtractedConflict {
                start_line: 2,
                end_line: 6,
                local: "X".into(),
                remote: "Y".into(),
            }]
        );
    }

    #[test]
    fn marker_detection_ignores_lone_separator() {
        assert!(has_conflict_markers(MARKED));
        assert!(!has_conflict_markers("title\n=======\nbody"));
        assert!(has_conflict_markers(">>>>>>> REMOTE"));
    }

    #[test]
    fn extracted_spans_match_merge_spans() {
        let result = merge("1\n2\n3", "L\n2\nL", "R\n2\nR");
        let found = extract_conflicts(&result.content);
        assert_eq!(found.len(), result.conflicts.len());
        for (extracted, span) in found.iter().zip(&result.conflicts) {
            assert_eq!(extracted.start_line, span.start_line);
            assert_eq!(extracted.end_line, span.end_line);
            assert_eq!(extracted.local, span.local);
            assert_eq!(extracted.remote, span.remote);
        }
    }

    #[test]
    fn separator_line_inside_a_side_shifts_the_split() {
        let content = "<<<<<<< LOCAL\nx\n=======\nheading\n=======\ny\n>>>>>>> REMOTE";
        let found = extract_conflicts(content);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].local, "x");
        assert_eq!(found[0].remote, "heading\n=======\ny");
    }
}
