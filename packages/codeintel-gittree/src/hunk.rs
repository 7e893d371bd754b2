//! Unified-diff hunk model and parser
//!
//! Parsing turns opaque `git diff` output for a single file into an ordered,
//! immutable list of [`Hunk`]s. Translation (see [`crate::translate`]) only
//! ever reads that list.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DiffError, Result};

static HUNK_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header pattern")
});

/// Classification of a single hunk body line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HunkLine {
    /// Present on both sides
    Context,
    /// Present only on the new side
    Added,
    /// Present only on the original side
    Removed,
}

impl HunkLine {
    /// The same line seen from the other side of the diff
    pub fn inverted(self) -> Self {
        match self {
            HunkLine::Context => HunkLine::Context,
            HunkLine::Added => HunkLine::Removed,
            HunkLine::Removed => HunkLine::Added,
        }
    }
}

/// A contiguous region mapping an original line span to a new line span.
///
/// Line numbers are 1-indexed as in the `@@ -a,b +c,d @@` header. A side
/// with zero length is stored with its start moved to the first line after
/// the gap, so `start..start + len` is always the half-open span the hunk
/// covers on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub orig_start: u32,
    pub orig_len: u32,
    pub new_start: u32,
    pub new_len: u32,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    pub fn new(orig_start: u32, orig_len: u32, new_start: u32, new_len: u32) -> Self {
        Self {
            orig_start: normalize_start(orig_start, orig_len),
            orig_len,
            new_start: normalize_start(new_start, new_len),
            new_len,
            lines: Vec::new(),
        }
    }

    /// First original line after this hunk
    pub fn orig_end(&self) -> u32 {
        self.orig_start.saturating_add(self.orig_len)
    }

    /// First new line after this hunk
    pub fn new_end(&self) -> u32 {
        self.new_start.saturating_add(self.new_len)
    }

    /// Line-count change applied to everything after this hunk
    pub fn delta(&self) -> i64 {
        i64::from(self.new_end()) - i64::from(self.orig_end())
    }

    /// The hunk as it would appear in a diff taken in the opposite direction
    pub fn inverted(&self) -> Hunk {
        Hunk {
            orig_start: self.new_start,
            orig_len: self.new_len,
            new_start: self.orig_start,
            new_len: self.orig_len,
            lines: self.lines.iter().map(|l| l.inverted()).collect(),
        }
    }
}

fn normalize_start(start: u32, len: u32) -> u32 {
    if len == 0 {
        start.saturating_add(1)
    } else {
        start
    }
}

/// Parse the hunks of a single-file unified diff.
///
/// File headers (`diff --git`, `index`, `---`, `+++`) before the first hunk
/// are skipped. Hunk bodies are consumed by the line counts declared in their
/// headers, so a removed line whose text starts with `--` is never mistaken
/// for a header. An empty body line is read as context.
///
/// An empty input yields no hunks.
pub fn parse_hunks(diff: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut lines = diff.lines().enumerate().peekable();

    while let Some((idx, line)) = lines.next() {
        if !line.starts_with("@@") {
            if !hunks.is_empty() && line.starts_with("diff --git") {
                return Err(DiffError::malformed(idx + 1, "diff spans more than one file"));
            }
            continue;
        }

        let caps = HUNK_HEADER
            .captures(line)
            .ok_or_else(|| DiffError::malformed(idx + 1, format!("bad hunk header {:?}", line)))?;
        let field = |i: usize, default: u32| -> Result<u32> {
            match caps.get(i) {
                Some(m) => m.as_str().parse::<u32>().map_err(|e| {
                    DiffError::malformed(idx + 1, format!("bad hunk header number: {}", e))
                }),
                None => Ok(default),
            }
        };
        let (orig_start, orig_len) = (field(1, 0)?, field(2, 1)?);
        let (new_start, new_len) = (field(3, 0)?, field(4, 1)?);
        for (start, len) in [(orig_start, orig_len), (new_start, new_len)] {
            if len > 0 && start == 0 {
                return Err(DiffError::malformed(idx + 1, "non-empty hunk side starts at line 0"));
            }
            // The span end, and the start of an empty side, must fit in a line number
            if start.checked_add(len).and_then(|end| end.checked_add(1)).is_none() {
                return Err(DiffError::malformed(idx + 1, "hunk header line numbers overflow"));
            }
        }
        let mut hunk = Hunk::new(orig_start, orig_len, new_start, new_len);

        if let Some(prev) = hunks.last() {
            if hunk.orig_start < prev.orig_end() {
                return Err(DiffError::malformed(idx + 1, "hunks overlap or are out of order"));
            }
        }

        let mut orig_left = hunk.orig_len;
        let mut new_left = hunk.new_len;
        while orig_left > 0 || new_left > 0 {
            let Some((body_idx, body)) = lines.next() else {
                return Err(DiffError::malformed(idx + 1, "hunk body is truncated"));
            };
            let kind = match body.as_bytes().first() {
                None | Some(b' ') => HunkLine::Context,
                Some(b'-') => HunkLine::Removed,
                Some(b'+') => HunkLine::Added,
                Some(b'\\') => continue,
                Some(_) => {
                    return Err(DiffError::malformed(
                        body_idx + 1,
                        format!("unexpected hunk body line {:?}", body),
                    ))
                }
            };
            match kind {
                HunkLine::Context if orig_left > 0 && new_left > 0 => {
                    orig_left -= 1;
                    new_left -= 1;
                }
                HunkLine::Removed if orig_left > 0 => orig_left -= 1,
                HunkLine::Added if new_left > 0 => new_left -= 1,
                _ => {
                    return Err(DiffError::malformed(
                        body_idx + 1,
                        "hunk body exceeds the line counts in its header",
                    ))
                }
            }
            hunk.lines.push(kind);
        }

        // "\ No newline at end of file" may trail the final body line
        while let Some((_, next)) = lines.peek() {
            if next.starts_with('\\') {
                lines.next();
            } else {
                break;
            }
        }

        hunks.push(hunk);
    }

    Ok(hunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_diff_has_no_hunks() {
        assert!(parse_hunks("").unwrap().is_empty());
        assert!(parse_hunks("\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_single_hunk() {
        let diff = "\
--- a/f.go
+++ b/f.go
@@ -3,4 +3,3 @@ func main() {
 a
-b
 c
 d
";
        let hunks = parse_hunks(diff).unwrap();
        assert_eq!(
            hunks,
            vec![Hunk {
                orig_start: 3,
                orig_len: 4,
                new_start: 3,
                new_len: 3,
                lines: vec![
                    HunkLine::Context,
                    HunkLine::Removed,
                    HunkLine::Context,
                    HunkLine::Context,
                ],
            }]
        );
        assert_eq!(hunks[0].delta(), -1);
    }

    #[test]
    fn test_omitted_lengths_default_to_one() {
        let hunks = parse_hunks("@@ -7 +7 @@\n-x\n+y\n").unwrap();
        assert_eq!(hunks[0].orig_len, 1);
        assert_eq!(hunks[0].new_len, 1);
        assert_eq!(hunks[0].lines, vec![HunkLine::Removed, HunkLine::Added]);
    }

    #[test]
    fn test_zero_length_side_is_normalized() {
        let hunks = parse_hunks("@@ -10,0 +11,2 @@\n+x\n+y\n").unwrap();
        assert_eq!(hunks[0].orig_start, 11);
        assert_eq!(hunks[0].orig_end(), 11);
        assert_eq!(hunks[0].new_start, 11);
        assert_eq!(hunks[0].delta(), 2);

        let hunks = parse_hunks("@@ -5,2 +4,0 @@\n-x\n-y\n").unwrap();
        assert_eq!(hunks[0].new_start, 5);
        assert_eq!(hunks[0].delta(), -2);
    }

    #[test]
    fn test_removed_line_starting_with_dashes() {
        let diff = "@@ -1,2 +1,1 @@\n---- not a header\n keep\n";
        let hunks = parse_hunks(diff).unwrap();
        assert_eq!(hunks[0].lines, vec![HunkLine::Removed, HunkLine::Context]);
    }

    #[test]
    fn test_no_newline_marker_is_skipped() {
        let diff = "@@ -1 +1 @@\n-old\n\\ No newline at end of file\n+new\n\\ No newline at end of file\n";
        let hunks = parse_hunks(diff).unwrap();
        assert_eq!(hunks[0].lines, vec![HunkLine::Removed, HunkLine::Added]);
    }

    #[test]
    fn test_bad_header_is_rejected() {
        let err = parse_hunks("@@ -x,1 +1 @@\n").unwrap_err();
        assert!(matches!(err, DiffError::MalformedDiffInput { line: 1, .. }));
    }

    #[test]
    fn test_header_overflow_is_rejected() {
        let err = parse_hunks("@@ -4294967295,0 +1,1 @@\n+x\n").unwrap_err();
        assert!(matches!(err, DiffError::MalformedDiffInput { line: 1, .. }));

        let err = parse_hunks("@@ -1,1 +4294967290,9 @@\n-x\n").unwrap_err();
        assert!(matches!(err, DiffError::MalformedDiffInput { line: 1, .. }));

        // The largest representable span still parses
        let hunks = parse_hunks("@@ -4294967293,1 +1,1 @@\n-x\n+y\n").unwrap();
        assert_eq!(hunks[0].orig_end(), 4294967294);
    }

    #[test]
    fn test_non_empty_side_at_line_zero_is_rejected() {
        assert!(parse_hunks("@@ -1,1 +0,1 @@\n a\n").is_err());
        // An empty side may start at 0, as in a newly created file
        let hunks = parse_hunks("@@ -0,0 +1,2 @@\n+a\n+b\n").unwrap();
        assert_eq!(hunks[0].orig_start, 1);
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let err = parse_hunks("@@ -1,3 +1,3 @@\n a\n b\n").unwrap_err();
        assert!(matches!(err, DiffError::MalformedDiffInput { .. }));
    }

    #[test]
    fn test_overlapping_hunks_are_rejected() {
        let diff = "@@ -10,2 +10,2 @@\n a\n b\n@@ -11,1 +11,1 @@\n c\n";
        assert!(parse_hunks(diff).is_err());
    }

    #[test]
    fn test_multi_file_diff_is_rejected() {
        let diff = "diff --git a/x b/x\n@@ -1 +1 @@\n-a\n+b\ndiff --git a/y b/y\n@@ -1 +1 @@\n-a\n+b\n";
        assert!(parse_hunks(diff).is_err());
    }

    #[test]
    fn test_inverted_swaps_sides() {
        let hunk = parse_hunks("@@ -4,2 +4,3 @@\n a\n-b\n+c\n+d\n").unwrap().remove(0);
        let inv = hunk.inverted();
        assert_eq!(inv.orig_len, 3);
        assert_eq!(inv.new_len, 2);
        assert_eq!(
            inv.lines,
            vec![HunkLine::Context, HunkLine::Added, HunkLine::Removed, HunkLine::Removed]
        );
        assert_eq!(inv.inverted(), hunk);
    }
}
