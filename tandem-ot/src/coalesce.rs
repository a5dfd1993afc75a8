//! Edit coalescing between the editor widget and the send queue.
//!
//! Editor widgets report every keystroke as its own change event. Shipping
//! those one by one is wasteful, so the coalescer buffers them and merges
//! runs of adjacent edits into single reversible deltas:
//!
//! ```text
//! widget events:   [H] [e] [l] [l] [o]     (5 events, adjacent offsets)
//! buffered:        [ insert "Hello" ]      (1 delta)
//! ```
//!
//! The coalescer also owns the local [`Document`] mirror. Programmatic
//! applications (committed remote edits, reconciliation splices) go through
//! [`EditCoalescer::apply_programmatic`], which raises an ignore counter so
//! the widget's echo notifications are dropped instead of being captured as
//! new local edits.

use log::debug;

use crate::delta::{Delta, Position, ReversibleDelta};
use crate::document::{Document, DocumentError};

/// One change event entry as reported by the editor widget.
///
/// Coordinates address the document as it was before the edit ran; `offset`
/// is the absolute character offset of `start` at that same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEdit {
    pub start: Position,
    pub end: Position,
    pub text: String,
    pub offset: usize,
}

impl RawEdit {
    pub fn new(start: Position, end: Position, text: impl Into<String>, offset: usize) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            offset,
        }
    }
}

/// Buffers widget edits into merged reversible deltas.
#[derive(Debug, Default)]
pub struct EditCoalescer {
    doc: Document,
    buffer: Vec<ReversibleDelta>,
    ignore: usize,
}

impl EditCoalescer {
    pub fn new(doc: Document) -> Self {
        Self {
            doc,
            buffer: Vec::new(),
            ignore: 0,
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Buffered deltas, oldest first.
    pub fn pending(&self) -> &[ReversibleDelta] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Echo notifications still expected from programmatic edits.
    pub fn ignored_remaining(&self) -> usize {
        self.ignore
    }

    /// Capture one widget change event (a batch of edit entries).
    ///
    /// Entries covered by the ignore counter are dropped; the counter spans
    /// event boundaries, so a programmatic batch echoed across several
    /// events is still swallowed entry by entry.
    pub fn record(&mut self, edits: &[RawEdit]) -> Result<(), DocumentError> {
        let skip = self.ignore.min(edits.len());
        if skip > 0 {
            self.ignore -= skip;
            debug!(
                "Ignoring {} echoed edit(s), {} more expected",
                skip, self.ignore
            );
        }
        for edit in &edits[skip..] {
            let delta = Delta::new(edit.start, edit.end, edit.text.clone());
            let captured = self.doc.apply_reversible(&delta, edit.offset)?;
            self.push_merged(captured);
        }
        Ok(())
    }

    /// Apply deltas that did not come from the user: committed remote
    /// batches and reconciliation splices.
    ///
    /// The mirror is updated here; the ignore counter grows by one per delta
    /// so the widget's echoes of the same edits are not re-captured. Callers
    /// must hand the widget exactly this batch.
    pub fn apply_programmatic(&mut self, deltas: &[Delta]) -> Result<(), DocumentError> {
        for delta in deltas {
            self.doc.apply(delta)?;
        }
        self.ignore += deltas.len();
        Ok(())
    }

    /// Replace the mirror wholesale (initial dump, resync). Buffered edits
    /// and the ignore counter are void afterwards.
    pub fn replace_document(&mut self, text: &str) {
        self.doc = Document::from_text(text);
        self.buffer.clear();
        self.ignore = 0;
    }

    /// Drain the buffer, oldest first.
    pub fn take(&mut self) -> Vec<ReversibleDelta> {
        std::mem::take(&mut self.buffer)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn push_merged(&mut self, edit: ReversibleDelta) {
        if let Some(last) = self.buffer.last_mut() {
            // Forward typing: the new insert begins exactly where the
            // previous delta's inserted text ends.
            if edit.is_pure_insert() && last.offset + last.inserted_chars() == edit.offset {
                last.delta.text.push_str(&edit.delta.text);
                debug!("Merged forward edit, buffer holds {}", self.buffer.len());
                return;
            }
            // Backspace run: the new delete ends exactly where the previous
            // delete began.
            if edit.is_pure_delete()
                && last.is_pure_delete()
                && edit.offset + edit.removed_chars() == last.offset
            {
                let merged_source = format!("{}{}", edit.source_text, last.source_text);
                last.delta.set_start(edit.delta.start());
                last.source_text = merged_source;
                last.offset = edit.offset;
                debug!("Merged backward edit, buffer holds {}", self.buffer.len());
                return;
            }
        }
        self.buffer.push(edit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_at(col: u32, text: &str, offset: usize) -> RawEdit {
        RawEdit::new(
            Position::new(1, col),
            Position::new(1, col),
            text,
            offset,
        )
    }

    fn delete_at(start_col: u32, end_col: u32, offset: usize) -> RawEdit {
        RawEdit::new(
            Position::new(1, start_col),
            Position::new(1, end_col),
            "",
            offset,
        )
    }

    #[test]
    fn test_typing_run_coalesces_to_one_delta() {
        let mut c = EditCoalescer::new(Document::from_text(""));
        for (i, ch) in ["H", "e", "l", "l", "o"].iter().enumerate() {
            c.record(&[insert_at(i as u32 + 1, ch, i)]).unwrap();
        }
        assert_eq!(c.len(), 1);
        let pending = c.pending();
        assert_eq!(pending[0].delta.text, "Hello");
        assert_eq!(pending[0].delta.start(), Position::new(1, 1));
        assert_eq!(pending[0].offset, 0);
        assert_eq!(c.document().to_text(), "Hello");
    }

    #[test]
    fn test_non_adjacent_insert_starts_new_delta() {
        let mut c = EditCoalescer::new(Document::from_text(""));
        c.record(&[insert_at(1, "abc", 0)]).unwrap();
        // Cursor moved back: offset 1 is not adjacent to 0 + 3.
        c.record(&[insert_at(2, "Z", 1)]).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.document().to_text(), "aZbc");
    }

    #[test]
    fn test_newline_keeps_the_run_going() {
        let mut c = EditCoalescer::new(Document::from_text(""));
        c.record(&[insert_at(1, "ab", 0)]).unwrap();
        c.record(&[RawEdit::new(
            Position::new(1, 3),
            Position::new(1, 3),
            "\n",
            2,
        )])
        .unwrap();
        c.record(&[RawEdit::new(
            Position::new(2, 1),
            Position::new(2, 1),
            "cd",
            3,
        )])
        .unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.pending()[0].delta.text, "ab\ncd");
        assert_eq!(c.document().to_text(), "ab\ncd");
    }

    #[test]
    fn test_backspace_run_coalesces() {
        let mut c = EditCoalescer::new(Document::from_text("abcd"));
        c.record(&[delete_at(4, 5, 3)]).unwrap();
        c.record(&[delete_at(3, 4, 2)]).unwrap();
        c.record(&[delete_at(2, 3, 1)]).unwrap();
        assert_eq!(c.len(), 1);
        let d = &c.pending()[0];
        assert_eq!(d.delta.start(), Position::new(1, 2));
        assert_eq!(d.delta.end(), Position::new(1, 5));
        assert_eq!(d.delta.text, "");
        assert_eq!(d.source_text, "bcd");
        assert_eq!(d.offset, 1);
        assert_eq!(c.document().to_text(), "a");
    }

    #[test]
    fn test_delete_then_type_becomes_replacement() {
        let mut c = EditCoalescer::new(Document::from_text("abcd"));
        c.record(&[RawEdit::new(
            Position::new(1, 2),
            Position::new(1, 4),
            "",
            1,
        )])
        .unwrap();
        c.record(&[insert_at(2, "X", 1)]).unwrap();
        assert_eq!(c.len(), 1);
        let d = &c.pending()[0];
        assert_eq!(d.delta.text, "X");
        assert_eq!(d.source_text, "bc");
        assert_eq!(c.document().to_text(), "aXd");
    }

    #[test]
    fn test_forward_and_backward_runs_do_not_mix() {
        let mut c = EditCoalescer::new(Document::from_text("ab"));
        c.record(&[insert_at(3, "c", 2)]).unwrap();
        // Deleting the 'a' is neither forward-adjacent nor a delete pair
        // with the pending insert.
        c.record(&[delete_at(1, 2, 0)]).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.document().to_text(), "bc");
    }

    #[test]
    fn test_programmatic_edits_are_not_captured() {
        let mut c = EditCoalescer::new(Document::from_text("hello"));
        let remote = vec![
            Delta::insert(Position::new(1, 1), ">"),
            Delta::insert(Position::new(1, 7), "!"),
        ];
        c.apply_programmatic(&remote).unwrap();
        assert_eq!(c.document().to_text(), ">hello!");
        assert_eq!(c.ignored_remaining(), 2);

        // The widget echoes both edits plus one real keystroke.
        c.record(&[
            RawEdit::new(Position::new(1, 1), Position::new(1, 1), ">", 0),
            RawEdit::new(Position::new(1, 7), Position::new(1, 7), "!", 6),
            RawEdit::new(Position::new(1, 8), Position::new(1, 8), "?", 7),
        ])
        .unwrap();
        assert_eq!(c.ignored_remaining(), 0);
        assert_eq!(c.len(), 1);
        assert_eq!(c.pending()[0].delta.text, "?");
        assert_eq!(c.document().to_text(), ">hello!?");
    }

    #[test]
    fn test_ignore_counter_spans_event_batches() {
        let mut c = EditCoalescer::new(Document::from_text("xy"));
        c.apply_programmatic(&[
            Delta::insert(Position::new(1, 1), "a"),
            Delta::insert(Position::new(1, 4), "b"),
        ])
        .unwrap();
        c.record(&[RawEdit::new(
            Position::new(1, 1),
            Position::new(1, 1),
            "a",
            0,
        )])
        .unwrap();
        assert_eq!(c.ignored_remaining(), 1);
        c.record(&[RawEdit::new(
            Position::new(1, 4),
            Position::new(1, 4),
            "b",
            3,
        )])
        .unwrap();
        assert_eq!(c.ignored_remaining(), 0);
        assert!(c.is_empty());
        assert_eq!(c.document().to_text(), "axyb");
    }

    #[test]
    fn test_take_drains_and_preserves_order() {
        let mut c = EditCoalescer::new(Document::from_text(""));
        c.record(&[insert_at(1, "a", 0)]).unwrap();
        c.record(&[insert_at(4, "b", 3)]).unwrap();
        let drained = c.take();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].delta.text, "a");
        assert_eq!(drained[1].delta.text, "b");
        assert!(c.is_empty());
    }

    #[test]
    fn test_replace_document_voids_state() {
        let mut c = EditCoalescer::new(Document::from_text("old"));
        c.record(&[insert_at(1, "z", 0)]).unwrap();
        c.apply_programmatic(&[Delta::insert(Position::new(1, 1), "q")])
            .unwrap();
        c.replace_document("fresh text");
        assert!(c.is_empty());
        assert_eq!(c.ignored_remaining(), 0);
        assert_eq!(c.document().to_text(), "fresh text");
    }
}
