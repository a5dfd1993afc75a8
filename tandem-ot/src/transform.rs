//! Position transformation between concurrent deltas.
//!
//! `transform(source, base)` restates a local, unacknowledged delta so that
//! it applies cleanly to a document that has already incorporated a
//! committed remote delta. The case analysis is over the relative layout of
//! the two replaced ranges:
//!
//! ```text
//!   source  ├──────┤                        (1) before base: unchanged
//!   base              ├────┤
//!
//!   source            ├────────┤            (2) after base: shifted
//!   base    ├──────┤
//!
//!   source  ├────────────────┤              (3) base contained: end shifts,
//!   base          ├────┤                        source_text spliced
//!
//!   source  ├──────────┤                    (4) tail overlap: truncate at
//!   base           ├────────┤                   base.start, re-run
//!
//!   source          ├──────────┤            (5) head overlap: truncate at
//!   base    ├────────────┤                      base.end, re-run
//! ```
//!
//! The truncation cases loop instead of recursing; by construction they
//! settle in one extra pass, and the pass cap turns any violation of that
//! into an error instead of an infinite loop.
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems (1989)
//! Reference: Nichols et al. — the Jupiter collaboration system (UIST '95)

use crate::delta::{Delta, Position, ReversibleDelta};

/// Truncation settles in one extra pass; anything longer is a bug.
const MAX_PASSES: usize = 4;

/// Transformation faults.
///
/// Both variants mean the operands disagree with each other or with
/// themselves; the caller must treat the local replica as desynchronized
/// rather than guess at coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// `source_text` does not contain the line breaks or columns its
    /// coordinates imply.
    SourceDesync(String),
    /// The operand pair escaped the case analysis.
    CasePartition(String),
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceDesync(detail) => write!(f, "Replaced-text desync: {detail}"),
            Self::CasePartition(detail) => write!(f, "Transform case analysis failed: {detail}"),
        }
    }
}

impl std::error::Error for TransformError {}

/// Restate `source` in the coordinate space that results from applying
/// `base`.
///
/// `source.delta.text` and `source.offset` are never modified; coordinates
/// and `source_text` are. `base` is the committed side and wins overlaps:
/// the parts of `source`'s range that `base` already rewrote are either
/// absorbed into `source_text` (case 3) or cut away (cases 4 and 5).
pub fn transform(
    source: &ReversibleDelta,
    base: &Delta,
) -> Result<ReversibleDelta, TransformError> {
    let mut current = source.clone();
    let b1 = base.start();
    let b2 = base.end();

    for _ in 0..MAX_PASSES {
        let s1 = current.delta.start();
        let s2 = current.delta.end();

        // (1) Source entirely at or before base. A zero-width insert exactly
        // at base.start also lands here and keeps its position; it must not
        // fall into the containment case below.
        if s2 <= b1 {
            return Ok(current);
        }

        // (2) Base entirely before source: shift past base's size change.
        if b2 <= s1 {
            let new_base_end = b1.advanced_by(&base.text);
            current.delta.set_start(shift_past(s1, b2, new_base_end));
            current.delta.set_end(shift_past(s2, b2, new_base_end));
            return Ok(current);
        }

        // (3) Base contained in a non-empty source range: the region source
        // is about to replace now holds base's text, so splice it into
        // source_text and shift the end.
        if s1 <= b1 && b2 <= s2 && s1 != s2 {
            let from = source_text_index(&current, b1)?;
            let to = source_text_index(&current, b2)?;
            current.source_text.replace_range(from..to, &base.text);
            let new_base_end = b1.advanced_by(&base.text);
            current.delta.set_end(shift_past(s2, b2, new_base_end));
            return Ok(current);
        }

        // (4) Source starts first and ends inside base's removed range: the
        // overlapped tail is already gone, cut the delta back to base.start.
        if s1 < b1 {
            let cut = source_text_index(&current, b1)?;
            current.source_text.truncate(cut);
            current.delta.set_end(b1);
            continue;
        }

        // (5) Source starts inside base's removed range: drop the consumed
        // head. A fully consumed range degenerates to an insert at base.end.
        if s1 < b2 {
            if s2 <= b2 {
                current.source_text.clear();
                current.delta.set_start(b2);
                current.delta.set_end(b2);
            } else {
                let cut = source_text_index(&current, b2)?;
                current.source_text.drain(..cut);
                current.delta.set_start(b2);
            }
            continue;
        }

        return Err(TransformError::CasePartition(format!(
            "no case applies to source {}..{} vs base {}..{}",
            s1, s2, b1, b2
        )));
    }

    Err(TransformError::CasePartition(format!(
        "no convergence after {} passes for source {}..{} vs base {}..{}",
        MAX_PASSES,
        source.delta.start(),
        source.delta.end(),
        b1,
        b2
    )))
}

/// Transform every source delta through every base delta, in order.
///
/// This is the reconciliation fold: each pending local delta is restated
/// against the full committed batch before it is re-applied or re-sent.
pub fn transform_all(
    sources: &[ReversibleDelta],
    bases: &[Delta],
) -> Result<Vec<ReversibleDelta>, TransformError> {
    sources
        .iter()
        .map(|source| {
            let mut current = source.clone();
            for base in bases {
                current = transform(&current, base)?;
            }
            Ok(current)
        })
        .collect()
}

/// Move a position that sits at or after `old_end` so that it keeps its
/// distance from the end of the replaced region, which moved to `new_end`.
///
/// Only a position on `old_end`'s own line re-bases its column; positions on
/// later lines keep their column and shift lines only.
fn shift_past(p: Position, old_end: Position, new_end: Position) -> Position {
    let line = (p.line as i64 + new_end.line as i64 - old_end.line as i64) as u32;
    if p.line == old_end.line {
        let col = (new_end.col as i64 + p.col as i64 - old_end.col as i64) as u32;
        Position::new(line, col)
    } else {
        Position::new(line, p.col)
    }
}

/// Byte index inside `source_text` of the document position `pos`, which
/// must lie within the delta's replaced range.
///
/// Walks one line break per line between the range start and `pos`, then
/// advances the residual columns. Running out of line breaks or characters
/// means the recorded text no longer matches the coordinates.
fn source_text_index(rd: &ReversibleDelta, pos: Position) -> Result<usize, TransformError> {
    let start = rd.delta.start();
    let text = rd.source_text.as_str();

    let breaks = pos.line.checked_sub(start.line).ok_or_else(|| {
        TransformError::SourceDesync(format!("position {pos} precedes range start {start}"))
    })?;
    let mut idx = 0usize;
    for crossed in 0..breaks {
        match text[idx..].find('\n') {
            Some(rel) => idx += rel + 1,
            None => {
                return Err(TransformError::SourceDesync(format!(
                    "needed {breaks} line break(s), found {crossed}"
                )))
            }
        }
    }

    let cols = if breaks == 0 { start.col } else { 1 };
    let cols = pos.col.checked_sub(cols).ok_or_else(|| {
        TransformError::SourceDesync(format!("position {pos} precedes range start {start}"))
    })? as usize;

    let line_end = text[idx..].find('\n').map_or(text.len(), |rel| idx + rel);
    let segment = &text[idx..line_end];
    match segment.char_indices().nth(cols) {
        Some((byte, _)) => Ok(idx + byte),
        None if segment.chars().count() == cols => Ok(line_end),
        None => Err(TransformError::SourceDesync(format!(
            "column {} past end of recorded line ({} chars)",
            pos.col,
            segment.chars().count()
        ))),
    }
}
