//! codeintel-gittree - map source positions across commits
//!
//! A stored code-intelligence artifact is computed against one commit, but
//! requests arrive for whatever commit the user is looking at. This crate
//! bridges the two using the textual diff between the commits.
//!
//! ## Layers
//!
//! - [`hunk`]: unified-diff hunk parser (`@@ -a,b +c,d @@`)
//! - [`translate`]: pure line translation over a parsed hunk list
//! - [`translator`]: `GitTreeTranslator`, a request-scoped service that fetches
//!   diffs through a [`DiffSource`] and caches the parsed hunks
//!
//! ## Usage
//!
//! ```rust
//! use codeintel_gittree::{parse_hunks, translate_position, Direction, Position};
//!
//! let hunks = parse_hunks("@@ -3,4 +3,3 @@\n a\n-b\n c\n d\n").unwrap();
//!
//! // 0-indexed line 3 was deleted
//! assert_eq!(translate_position(&hunks, Position::new(3, 0), Direction::Forward), None);
//! // everything below it moves up by one
//! assert_eq!(
//!     translate_position(&hunks, Position::new(10, 4), Direction::Forward),
//!     Some(Position::new(9, 4))
//! );
//! ```

pub mod error;
pub mod hunk;
pub mod translate;
pub mod translator;

pub use error::{DiffError, Result};
pub use hunk::{parse_hunks, Hunk, HunkLine};
pub use translate::{
    translate_line, translate_position, translate_range, Direction, Position, Range,
};
pub use translator::{DiffSource, GitTreeTranslator, TranslationRequest};
