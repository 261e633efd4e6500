//! Utility functions and helpers

/// Line-level diff operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    /// Line is unchanged
    Keep,
    /// Line removed from the old text
    Delete,
    /// Line added in the new text
    Insert,
}

/// Compute a minimal line-level diff between two slices of lines.
///
/// Uses a longest-common-subsequence table; deletions are emitted before
/// insertions at each divergence point so the output is deterministic.
pub fn diff_lines(old: &[String], new: &[String]) -> Vec<(DiffOp, String)> {
    let n = old.len();
    let m = new.len();
    // lcs[i][j] = length of the LCS of old[i..] and new[j..]
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut out = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            out.push((DiffOp::Keep, old[i].clone()));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push((DiffOp::Delete, old[i].clone()));
            i += 1;
        } else {
            out.push((DiffOp::Insert, new[j].clone()));
            j += 1;
        }
    }
    while i < n {
        out.push((DiffOp::Delete, old[i].clone()));
        i += 1;
    }
    while j < m {
        out.push((DiffOp::Insert, new[j].clone()));
        j += 1;
    }
    out
}

/// Check whether a diff contains no insertions or deletions
pub fn diff_is_noop(diff: &[(DiffOp, String)]) -> bool {
    diff.iter().all(|(op, _)| *op == DiffOp::Keep)
}

/// Normalize a description string into lowercase words.
///
/// Words are split on whitespace and stripped of leading/trailing `-` and
/// `.` characters; empty words are dropped.
pub fn normalize_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c| c == '-' || c == '.').to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// All contiguous word spans of a normalized word sequence, joined by spaces.
///
/// `["a", "b"]` yields `"a"`, `"a b"`, `"b"`. Used as bag-of-token features
/// for account classification.
pub fn word_spans(words: &[String]) -> Vec<String> {
    let mut spans = Vec::new();
    for start in 0..words.len() {
        for end in start + 1..=words.len() {
            spans.push(words[start..end].join(" "));
        }
    }
    spans
}
