//! Line-buffer document model.
//!
//! The document is a plain `Vec<String>` of lines without terminators;
//! splitting on `'\n'` preserves trailing empty segments, so N newlines
//! produce N+1 lines. Applying a delta is a three-part splice:
//!
//! ```text
//! before:  [ .. | prefix ░░░░░░░ ]      start line
//!          [ ░░░░░░░░░░░░░░░░░░ ]      lines in between (dropped)
//!          [ ░░░░░░░ suffix | .. ]      end line
//! after:   [ .. | prefix + text + suffix | .. ]   (re-split on '\n')
//! ```
//!
//! All mutation goes through [`Document::apply`]; callers that need
//! invertibility capture [`Document::text_in_range`] first.

use crate::delta::{Delta, Position, ReversibleDelta};

/// Document mutation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Lines are 1-indexed; 0 means the coordinates were never valid.
    InvalidLine(u32),
    /// The delta's end precedes its start.
    InvertedRange,
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLine(line) => write!(f, "Invalid line index {line}, lines start at 1"),
            Self::InvertedRange => write!(f, "Delta end precedes its start"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// Plain-text document stored as lines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Document {
    lines: Vec<String>,
}

impl Document {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.split('\n').map(str::to_string).collect(),
        }
    }

    pub fn to_text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, line: u32) -> Option<&str> {
        self.lines.get(line as usize - 1).map(String::as_str)
    }

    /// Replace `[start, end)` with the delta's text.
    ///
    /// Lines beyond the current end of the document are materialized as
    /// empty lines first; columns past the end of a line clamp to the line
    /// end.
    pub fn apply(&mut self, delta: &Delta) -> Result<(), DocumentError> {
        let (start, end) = (delta.start(), delta.end());
        if start.line == 0 || end.line == 0 {
            return Err(DocumentError::InvalidLine(start.line.min(end.line)));
        }
        if end < start {
            return Err(DocumentError::InvertedRange);
        }
        while self.lines.len() < end.line as usize {
            self.lines.push(String::new());
        }

        let start_idx = start.line as usize - 1;
        let end_idx = end.line as usize - 1;
        let prefix = char_prefix(&self.lines[start_idx], start.col as usize - 1);
        let suffix = char_suffix(&self.lines[end_idx], end.col as usize - 1);

        let merged = format!("{prefix}{}{suffix}", delta.text);
        let replacement = merged.split('\n').map(str::to_string);
        self.lines.splice(start_idx..=end_idx, replacement);
        Ok(())
    }

    /// Apply and capture the replaced text, producing the invertible form.
    pub fn apply_reversible(
        &mut self,
        delta: &Delta,
        offset: usize,
    ) -> Result<ReversibleDelta, DocumentError> {
        let source_text = self.text_in_range(delta.start(), delta.end());
        self.apply(delta)?;
        Ok(ReversibleDelta::new(delta.clone(), source_text, offset))
    }

    /// The exact text a delta over `[start, end)` would replace.
    ///
    /// Out-of-range coordinates clamp the way [`Document::apply`] does, so
    /// the captured text always inverts the corresponding splice.
    pub fn text_in_range(&self, start: Position, end: Position) -> String {
        if start.line == 0 || end.line == 0 || end <= start {
            return String::new();
        }
        let line_at = |line: u32| -> &str {
            self.lines
                .get(line as usize - 1)
                .map(String::as_str)
                .unwrap_or("")
        };
        if start.line == end.line {
            return char_slice(line_at(start.line), start.col as usize - 1, end.col as usize - 1)
                .to_string();
        }
        let mut out = String::new();
        out.push_str(char_suffix(line_at(start.line), start.col as usize - 1));
        for line in start.line + 1..end.line {
            out.push('\n');
            out.push_str(line_at(line));
        }
        out.push('\n');
        out.push_str(char_prefix(line_at(end.line), end.col as usize - 1));
        out
    }

    /// Absolute character offset of a position (line breaks count 1).
    ///
    /// Positions past the end of the document clamp to its end.
    pub fn offset_at(&self, pos: Position) -> usize {
        if pos.line == 0 {
            return 0;
        }
        let mut offset = 0usize;
        for (idx, line) in self.lines.iter().enumerate() {
            if idx + 1 == pos.line as usize {
                let len = line.chars().count();
                return offset + (pos.col as usize).saturating_sub(1).min(len);
            }
            offset += line.chars().count() + 1;
        }
        // Past the last line: the document end, minus the trailing phantom
        // newline the loop added.
        offset.saturating_sub(1)
    }

    /// Total characters, counting one per line break.
    pub fn char_count(&self) -> usize {
        let newlines = self.lines.len().saturating_sub(1);
        self.lines.iter().map(|l| l.chars().count()).sum::<usize>() + newlines
    }
}

/// First `n` characters of `s` (whole string when shorter).
fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((byte, _)) => &s[..byte],
        None => s,
    }
}

/// Everything from character `n` on (empty when shorter).
fn char_suffix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((byte, _)) => &s[byte..],
        None => "",
    }
}

/// Characters `[from, to)` of `s`, clamped.
fn char_slice(s: &str, from: usize, to: usize) -> &str {
    if to <= from {
        return "";
    }
    char_prefix(char_suffix(s, from), to - from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::from_text("hello world\nsecond line\nthird line")
    }

    #[test]
    fn test_single_line_replace() {
        let mut d = doc();
        d.apply(&Delta::new(
            Position::new(1, 7),
            Position::new(1, 12),
            "there",
        ))
        .unwrap();
        assert_eq!(d.to_text(), "hello there\nsecond line\nthird line");
    }

    #[test]
    fn test_insert_multiline_text() {
        let mut d = Document::from_text("hello world");
        d.apply(&Delta::insert(Position::new(1, 6), "X\nY")).unwrap();
        assert_eq!(d.to_text(), "helloX\nY world");
        assert_eq!(d.line_count(), 2);
    }

    #[test]
    fn test_delete_across_lines() {
        let mut d = doc();
        d.apply(&Delta::delete(Position::new(1, 7), Position::new(3, 6)))
            .unwrap();
        assert_eq!(d.to_text(), "hello  line");
    }

    #[test]
    fn test_extends_document_with_empty_lines() {
        let mut d = doc();
        d.apply(&Delta::insert(Position::new(5, 1), "new line"))
            .unwrap();
        assert_eq!(
            d.to_text(),
            "hello world\nsecond line\nthird line\n\nnew line"
        );
    }

    #[test]
    fn test_insert_into_empty_document() {
        let mut d = Document::new();
        d.apply(&Delta::insert(Position::new(1, 1), "first line"))
            .unwrap();
        assert_eq!(d.to_text(), "first line");
    }

    #[test]
    fn test_line_zero_rejected() {
        let mut d = doc();
        let err = d
            .apply(&Delta::insert(Position::new(0, 1), "x"))
            .unwrap_err();
        assert_eq!(err, DocumentError::InvalidLine(0));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut d = doc();
        let err = d
            .apply(&Delta::delete(Position::new(2, 4), Position::new(1, 1)))
            .unwrap_err();
        assert_eq!(err, DocumentError::InvertedRange);
    }

    #[test]
    fn test_column_clamps_to_line_end() {
        let mut d = Document::from_text("abc");
        d.apply(&Delta::insert(Position::new(1, 100), "!")).unwrap();
        assert_eq!(d.to_text(), "abc!");
    }

    #[test]
    fn test_unicode_columns() {
        let mut d = Document::from_text("héllo wörld");
        d.apply(&Delta::new(
            Position::new(1, 7),
            Position::new(1, 12),
            "wörld!",
        ))
        .unwrap();
        assert_eq!(d.to_text(), "héllo wörld!");
    }

    #[test]
    fn test_text_in_range_single_line() {
        let d = doc();
        assert_eq!(
            d.text_in_range(Position::new(1, 7), Position::new(1, 12)),
            "world"
        );
        assert_eq!(
            d.text_in_range(Position::new(2, 1), Position::new(2, 1)),
            ""
        );
    }

    #[test]
    fn test_text_in_range_multi_line() {
        let d = doc();
        assert_eq!(
            d.text_in_range(Position::new(1, 7), Position::new(3, 6)),
            "world\nsecond line\nthird"
        );
    }

    #[test]
    fn test_offset_at() {
        let d = doc();
        assert_eq!(d.offset_at(Position::new(1, 1)), 0);
        assert_eq!(d.offset_at(Position::new(1, 12)), 11);
        // Line break counts one character.
        assert_eq!(d.offset_at(Position::new(2, 1)), 12);
        assert_eq!(d.offset_at(Position::new(3, 6)), 29);
    }

    #[test]
    fn test_apply_reversible_roundtrip() {
        let mut d = doc();
        let before = d.to_text();
        let rd = d
            .apply_reversible(
                &Delta::new(Position::new(1, 7), Position::new(2, 7), "X\nY\nZ"),
                6,
            )
            .unwrap();
        assert_eq!(rd.source_text, "world\nsecond");
        assert_ne!(d.to_text(), before);

        d.apply(&rd.reversed().delta).unwrap();
        assert_eq!(d.to_text(), before);
    }

    #[test]
    fn test_char_count() {
        assert_eq!(Document::from_text("ab\nc").char_count(), 4);
        assert_eq!(Document::from_text("").char_count(), 0);
        assert_eq!(Document::new().char_count(), 0);
    }
}
