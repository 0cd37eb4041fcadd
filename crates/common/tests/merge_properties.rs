use proptest::prelude::*;
use trisync_common::merge::{
    extract_conflicts, has_conflict_markers, merge, resolve_conflicts, BlockChoice,
};

fn doc() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-d]{0,2}", 0..8).prop_map(|lines| lines.join("\n"))
}

/// Three versions sharing a line count, so edits stay position-aligned.
fn aligned_versions() -> impl Strategy<Value = (String, String, String)> {
    (1usize..8).prop_flat_map(|n| {
        let side = || prop::collection::vec("[a-c]", n).prop_map(|lines| lines.join("\n"));
        (side(), side(), side())
    })
}

proptest! {
    #[test]
    fn same_edit_on_both_sides_always_wins(base in ".*", local in ".*") {
        let result = merge(&base, &local, &local);
        prop_assert!(result.success);
        prop_assert_eq!(result.content, local);
    }

    #[test]
    fn untouched_file_merges_to_itself(base in ".*") {
        let result = merge(&base, &base, &base);
        prop_assert!(result.success);
        prop_assert!(result.conflicts.is_empty());
        prop_assert_eq!(result.content, base);
    }

    #[test]
    fn one_sided_change_is_taken_verbatim(base in doc(), changed in doc()) {
        prop_assert_eq!(merge(&base, &changed, &base).content, changed.clone());
        prop_assert_eq!(merge(&base, &base, &changed).content, changed);
    }

    #[test]
    fn extract_recovers_every_conflict_pair((base, local, remote) in aligned_versions()) {
        let result = merge(&base, &local, &remote);
        let extracted = extract_conflicts(&result.content);

        prop_assert_eq!(extracted.len(), result.conflicts.len());
        prop_assert_eq!(result.success, result.conflicts.is_empty());
        for (found, span) in extracted.iter().zip(&result.conflicts) {
            prop_assert_eq!(&found.local, &span.local);
            prop_assert_eq!(&found.remote, &span.remote);
        }
    }

    #[test]
    fn resolving_to_one_side_removes_all_markers((base, local, remote) in aligned_versions()) {
        let marked = merge(&base, &local, &remote).content;

        let ours = resolve_conflicts(&marked, BlockChoice::Local);
        let theirs = resolve_conflicts(&marked, BlockChoice::Remote);
        prop_assert!(!has_conflict_markers(&ours));
        prop_assert!(!has_conflict_markers(&theirs));
    }

    #[test]
    fn resolving_keeps_only_the_chosen_blocks((base, local, remote) in aligned_versions()) {
        let result = merge(&base, &local, &remote);
        let b: Vec<&str> = base.split('\n').collect();
        let l: Vec<&str> = local.split('\n').collect();
        let r: Vec<&str> = remote.split('\n').collect();

        // Equal line counts: position i either merged cleanly or became a block.
        let expect = |prefer_local: bool| -> String {
            (0..b.len())
                .map(|i| {
                    if l[i] == r[i] || r[i] == b[i] {
                        l[i]
                    } else if l[i] == b[i] {
                        r[i]
                    } else if prefer_local {
                        l[i]
                    } else {
                        r[i]
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        if !result.success {
            prop_assert_eq!(resolve_conflicts(&result.content, BlockChoice::Local), expect(true));
            prop_assert_eq!(resolve_conflicts(&result.content, BlockChoice::Remote), expect(false));
        }
    }

    #[test]
    fn manual_resolution_is_identity(content in ".*") {
        prop_assert_eq!(resolve_conflicts(&content, BlockChoice::Manual), content);
    }
}
