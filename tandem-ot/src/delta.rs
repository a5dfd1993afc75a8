//! Delta primitives for line/column addressed text edits.
//!
//! A delta replaces the half-open region `[start, end)` with new text:
//! ```text
//!        start (1,7)        end (1,12)
//!          │                  │
//! line 1:  h e l l o ␣ w o r l d
//!                    └───┬────┘
//!              replaced by delta.text
//! ```
//! Positions are 1-indexed; columns count Unicode scalar values within a
//! line. Wire encoding uses the flat camelCase field names
//! (`startLine`, `startCol`, ...).
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems (1989)

use serde::{Deserialize, Serialize};

/// 1-indexed line/column location.
///
/// Ordering is lexicographic (line major, column minor), which is exactly
/// document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub col: u32,
}

impl Position {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }

    /// Where the end of `text` lands when `text` is inserted at `self`.
    ///
    /// Single-line text extends the column; multi-line text moves to a new
    /// line where the trailing fragment restarts the column count at 1.
    pub fn advanced_by(self, text: &str) -> Position {
        let span = TextSpan::of(text);
        if span.lines == 0 {
            Position::new(self.line, self.col + span.cols)
        } else {
            Position::new(self.line + span.lines, span.cols + 1)
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Geometric extent of a text fragment.
///
/// `lines` counts line breaks; `cols` counts the characters after the last
/// break (the whole fragment when there is none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSpan {
    pub lines: u32,
    pub cols: u32,
}

impl TextSpan {
    /// Measure a fragment.
    pub fn of(text: &str) -> Self {
        match text.rsplit_once('\n') {
            Some((head, tail)) => Self {
                lines: head.matches('\n').count() as u32 + 1,
                cols: tail.chars().count() as u32,
            },
            None => Self {
                lines: 0,
                cols: text.chars().count() as u32,
            },
        }
    }
}

/// Replace the region `[start, end)` of a document with `text`.
///
/// `start == end` is a pure insert; empty `text` is a pure delete. Fields
/// stay flat so the serde derive matches the wire shape directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub text: String,
}

impl Delta {
    pub fn new(start: Position, end: Position, text: impl Into<String>) -> Self {
        Self {
            start_line: start.line,
            start_col: start.col,
            end_line: end.line,
            end_col: end.col,
            text: text.into(),
        }
    }

    /// Pure insert at `at`.
    pub fn insert(at: Position, text: impl Into<String>) -> Self {
        Self::new(at, at, text)
    }

    /// Pure delete of `[start, end)`.
    pub fn delete(start: Position, end: Position) -> Self {
        Self::new(start, end, "")
    }

    pub fn start(&self) -> Position {
        Position::new(self.start_line, self.start_col)
    }

    pub fn end(&self) -> Position {
        Position::new(self.end_line, self.end_col)
    }

    pub fn set_start(&mut self, p: Position) {
        self.start_line = p.line;
        self.start_col = p.col;
    }

    pub fn set_end(&mut self, p: Position) {
        self.end_line = p.line;
        self.end_col = p.col;
    }

    /// True when the replaced region is empty.
    pub fn is_insert(&self) -> bool {
        self.start() == self.end()
    }

    /// True when no text is inserted.
    pub fn is_delete(&self) -> bool {
        self.text.is_empty()
    }
}

/// A delta that remembers what it replaced.
///
/// `source_text` is the text that occupied `[start, end)` before the delta
/// ran, which makes the operation invertible. `offset` is the absolute
/// character offset of `start` when the edit was captured; it is only
/// meaningful for adjacency checks at coalescing time and is carried through
/// transforms unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversibleDelta {
    pub delta: Delta,
    pub source_text: String,
    pub offset: usize,
}

impl ReversibleDelta {
    pub fn new(delta: Delta, source_text: impl Into<String>, offset: usize) -> Self {
        Self {
            delta,
            source_text: source_text.into(),
            offset,
        }
    }

    /// The inverse operation: removes what this delta inserted and restores
    /// what it replaced.
    ///
    /// Pure coordinate arithmetic; the document is never consulted. The end
    /// of the inverse is where this delta's text ends once applied, so
    /// `reversed().reversed()` is the identity.
    pub fn reversed(&self) -> ReversibleDelta {
        let start = self.delta.start();
        let end = start.advanced_by(&self.delta.text);
        ReversibleDelta {
            delta: Delta::new(start, end, self.source_text.clone()),
            source_text: self.delta.text.clone(),
            offset: self.offset,
        }
    }

    /// Characters this delta inserts.
    pub fn inserted_chars(&self) -> usize {
        self.delta.text.chars().count()
    }

    /// Characters this delta removes.
    pub fn removed_chars(&self) -> usize {
        self.source_text.chars().count()
    }

    /// Insert that replaces nothing.
    pub fn is_pure_insert(&self) -> bool {
        self.delta.is_insert() && self.source_text.is_empty()
    }

    /// Delete that inserts nothing.
    pub fn is_pure_delete(&self) -> bool {
        self.delta.is_delete() && !self.source_text.is_empty()
    }
}
