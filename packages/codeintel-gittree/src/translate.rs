//! Pure coordinate translation over a parsed hunk list
//!
//! Positions are 0-indexed (editor/LSP convention) while hunks keep the
//! 1-indexed numbering of the diff header. Only the line of a position is
//! ever rewritten; the character offset passes through untouched.

use serde::{Deserialize, Serialize};

use crate::hunk::{Hunk, HunkLine};

/// A 0-indexed line/character coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// Which side of each hunk is read as the original.
///
/// `Reverse` maps a coordinate on the new side of the diff back onto the
/// original side, which is equivalent to translating forward over the diff
/// taken in the opposite direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn from_reverse(reverse: bool) -> Self {
        if reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    fn orig_start(self, hunk: &Hunk) -> u32 {
        match self {
            Direction::Forward => hunk.orig_start,
            Direction::Reverse => hunk.new_start,
        }
    }

    fn new_start(self, hunk: &Hunk) -> u32 {
        match self {
            Direction::Forward => hunk.new_start,
            Direction::Reverse => hunk.orig_start,
        }
    }

    fn orig_end(self, hunk: &Hunk) -> u32 {
        match self {
            Direction::Forward => hunk.orig_end(),
            Direction::Reverse => hunk.new_end(),
        }
    }

    fn delta(self, hunk: &Hunk) -> i64 {
        match self {
            Direction::Forward => hunk.delta(),
            Direction::Reverse => -hunk.delta(),
        }
    }

    fn classify(self, line: HunkLine) -> HunkLine {
        match self {
            Direction::Forward => line,
            Direction::Reverse => line.inverted(),
        }
    }
}

/// Translate a 0-indexed line. `None` means the line was removed or
/// rewritten and has no counterpart on the other side.
///
/// The hunk governing a line is the last one starting at or before it. A
/// line at or past that hunk's original end takes the hunk's cumulative
/// delta, so the first line after a hunk already maps through the post-hunk
/// offset. Lines inside the hunk are resolved by walking its body.
pub fn translate_line(hunks: &[Hunk], line: u32, direction: Direction) -> Option<u32> {
    let target = line.checked_add(1)?;

    let idx = hunks.partition_point(|h| direction.orig_start(h) <= target);
    if idx == 0 {
        return Some(line);
    }
    let hunk = &hunks[idx - 1];

    if target >= direction.orig_end(hunk) {
        let shifted = i64::from(target) + direction.delta(hunk);
        return u32::try_from(shifted - 1).ok();
    }

    let mut orig = direction.orig_start(hunk);
    let mut new = direction.new_start(hunk);
    for kind in hunk.lines.iter().map(|l| direction.classify(*l)) {
        match kind {
            HunkLine::Removed => {
                if orig == target {
                    return None;
                }
                orig += 1;
            }
            HunkLine::Added => new += 1,
            HunkLine::Context => {
                if orig == target {
                    return new.checked_sub(1);
                }
                orig += 1;
                new += 1;
            }
        }
    }

    None
}

pub fn translate_position(hunks: &[Hunk], pos: Position, direction: Direction) -> Option<Position> {
    let line = translate_line(hunks, pos.line, direction)?;
    Some(Position::new(line, pos.character))
}

/// Both endpoints must translate; a partially mapped range is never returned.
pub fn translate_range(hunks: &[Hunk], range: Range, direction: Direction) -> Option<Range> {
    let start = translate_position(hunks, range.start, direction)?;
    let end = translate_position(hunks, range.end, direction)?;
    Some(Range::new(start, end))
}
