use serde::{Deserialize, Serialize};

/// Merges that change more than this share of positions are flagged for review.
pub const DIVERGENCE_THRESHOLD: f64 = 0.5;

/// Positional change counts between base and each side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    pub local_changes: usize,
    pub remote_changes: usize,
    pub conflicts: usize,
    /// Share of positions changed on at least one side, in `[0, 1]`.
    pub change_ratio: f64,
}

impl MergeStats {
    pub fn is_diverged(&self) -> bool {
        self.change_ratio > DIVERGENCE_THRESHOLD
    }
}

/// Compare the three versions line by line using the same alignment as the merge.
pub fn get_merge_stats(base: &str, local: &str, remote: &str) -> MergeStats {
    let base_lines: Vec<&str> = base.split('\n').collect();
    let local_lines: Vec<&str> = local.split('\n').collect();
    let remote_lines: Vec<&str> = remote.split('\n').collect();
    let len = base_lines.len().max(local_lines.len()).max(remote_lines.len());

    let mut stats =
        MergeStats { local_changes: 0, remote_changes: 0, conflicts: 0, change_ratio: 0.0 };
    let mut changed = 0usize;

    for i in 0..len {
        let b = base_lines.get(i).copied().unwrap_or("");
        let l = local_lines.get(i).copied().unwrap_or("");
        let r = remote_lines.get(i).copied().unwrap_or("");

        let local_changed = l != b;
        let remote_changed = r != b;
        if local_changed {
            stats.local_changes += 1;
        }
        if remote_changed {
            stats.remote_changes += 1;
        }
        if local_changed && remote_changed && l != r {
            stats.conflicts += 1;
        }
        if local_changed || remote_changed {
            changed += 1;
        }
    }

    if len > 0 {
        stats.change_ratio = changed as f64 / len as f64;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_versions_have_no_changes() {
        let stats = get_merge_stats("a\nb", "a\nb", "a\nb");
        assert_eq!(stats.local_changes, 0);
        assert_eq!(stats.remote_changes, 0);
        assert_eq!(stats.conflicts, 0);
        assert_eq!(stats.change_ratio, 0.0);
        assert!(!stats.is_diverged());
    }

    #[test]
    fn counts_each_side_and_conflicting_positions() {
        let stats = get_merge_stats("a\nb\nc\nd", "A\nX\nc\nd", "a\nY\nc\nD");
        assert_eq!(stats.local_changes, 2);
        assert_eq!(stats.remote_changes, 2);
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.change_ratio, 0.75);
        assert!(stats.is_diverged());
    }

    #[test]
    fn convergent_position_is_not_a_conflict() {
        let stats = get_merge_stats("a\nb", "a\nQ", "a\nQ");
        assert_eq!(stats.conflicts, 0);
        assert_eq!(stats.change_ratio, 0.5);
        assert!(!stats.is_diverged());
    }
}
