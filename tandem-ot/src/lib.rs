//! # tandem-ot — Operational transformation engine for Tandem
//!
//! Pure text-transformation core: no I/O, no async, no network types.
//! Everything works on 1-indexed line/column coordinates over a line-buffer
//! document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  raw edits   ┌───────────────┐   merged deltas
//! │ editor widget│ ───────────► │ EditCoalescer │ ───────────────► queue
//! │ (embedder)   │ ◄─────────── │  + Document   │
//! └──────────────┘  programmatic└───────┬───────┘
//!                   re-application      │
//!                                       ▼
//!                              ┌────────────────┐
//!                              │   transform    │  restates pending edits
//!                              │ (5-case shift) │  against committed ones
//!                              └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`delta`] — positions, spans, reversible deltas
//! - [`document`] — line-buffer document with delta splicing
//! - [`transform`] — concurrent-edit position transformation
//! - [`coalesce`] — widget-event buffering and merging
//!
//! ## Invariants
//!
//! - Reversal is pure coordinate arithmetic; `reversed().reversed()` is the
//!   identity.
//! - `transform` never silently invents coordinates; operand disagreement
//!   surfaces as [`transform::TransformError`].

pub mod coalesce;
pub mod delta;
pub mod document;
pub mod transform;

// Re-exports for convenience
pub use coalesce::{EditCoalescer, RawEdit};
pub use delta::{Delta, Position, ReversibleDelta, TextSpan};
pub use document::{Document, DocumentError};
pub use transform::{transform, transform_all, TransformError};
