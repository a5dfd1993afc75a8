//! Outbound queue management.
//!
//! The queue manager tracks three things per connection:
//!
//! ```text
//!  pending:   [ d1 | d2 | d3 ]      local deltas not yet acknowledged
//!  believed:  highest server msg id incorporated locally
//!  sent:      value of `believed` at the last text flush
//! ```
//!
//! A text flush sends the ENTIRE pending list tagged with `believed`;
//! nothing is removed until the server acknowledges a prefix. Resending the
//! whole queue is therefore idempotent and doubles as the retransmission
//! path: the `sent >= believed` guard keeps the client quiet until either
//! new remote traffic moved `believed`, or the heartbeat forces a resend.
//!
//! Presence (cursor, typing) is last-value-wins and flushed on its own
//! adaptive cadence, computed by [`FlushScheduler`] from the text-flush rate
//! so the combined output stays inside one message budget.

use std::time::Duration;

use log::{debug, info, warn};
use tandem_ot::ReversibleDelta;
use uuid::Uuid;

use crate::protocol::ClientMessage;

/// `sent` watermark before any flush; far below any real message id so the
/// first flush always fires.
const UNSENT_WATERMARK: i64 = -1_000_000;

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Pending length at which a drain triggers an immediate flush.
    pub flush_threshold: usize,
    /// Combined outbound budget, messages per minute.
    pub total_message_freq: u32,
    /// Presence send rate clamp, messages per minute.
    pub presence_min_freq: u32,
    pub presence_max_freq: u32,
    /// Force-flush (retransmission) period.
    pub heartbeat: Duration,
    /// Coalescer drain period.
    pub coalesce_interval: Duration,
    /// Window over which the text flush rate is measured.
    pub rate_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 1,
            total_message_freq: 160,
            presence_min_freq: 10,
            presence_max_freq: 140,
            heartbeat: Duration::from_millis(5000),
            coalesce_interval: Duration::from_millis(4000),
            rate_window: Duration::from_secs(10),
        }
    }
}

/// The server acknowledged more deltas than the client has pending.
///
/// After this the queue contents cannot be trusted; the session clears the
/// queue and resyncs from a fresh dump.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Server accepted {count} deltas but only {pending} are pending")]
pub struct SequencingFault {
    pub count: usize,
    pub pending: usize,
}

/// Pending-delta queue with message-id watermarks and presence state.
#[derive(Debug)]
pub struct QueueManager {
    config: QueueConfig,
    pending: Vec<ReversibleDelta>,
    believed_msg_id: i64,
    sent_msg_id: i64,
    client_id: Option<Uuid>,
    room_id: Option<String>,
    force_flush: bool,
    typing: bool,
    flushed_typing: bool,
    cursor: (u32, u32),
    flushed_cursor: (u32, u32),
}

impl QueueManager {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            believed_msg_id: -1,
            sent_msg_id: UNSENT_WATERMARK,
            client_id: None,
            room_id: None,
            force_flush: false,
            typing: false,
            flushed_typing: false,
            cursor: (0, 0),
            flushed_cursor: (0, 0),
        }
    }

    // ── identity ────────────────────────────────────────────────────────

    pub fn set_identity(&mut self, client_id: Option<Uuid>, room_id: Option<String>) {
        debug!("Queue identity now {client_id:?} in {room_id:?}");
        self.client_id = client_id;
        self.room_id = room_id;
    }

    pub fn client_id(&self) -> Option<Uuid> {
        self.client_id
    }

    // ── pending deltas ──────────────────────────────────────────────────

    /// Append drained coalescer deltas; true when the queue is at or past
    /// the flush threshold.
    pub fn enqueue(&mut self, deltas: Vec<ReversibleDelta>) -> bool {
        self.pending.extend(deltas);
        self.pending.len() >= self.config.flush_threshold
    }

    pub fn pending(&self) -> &[ReversibleDelta] {
        &self.pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Remove and return everything pending (reconciliation source set).
    pub fn take_pending(&mut self) -> Vec<ReversibleDelta> {
        std::mem::take(&mut self.pending)
    }

    /// Install the transformed queue after reconciliation.
    pub fn replace_pending(&mut self, deltas: Vec<ReversibleDelta>) {
        self.pending = deltas;
    }

    /// Drop the acknowledged prefix and advance `believed`.
    pub fn accept(&mut self, count: usize) -> Result<(), SequencingFault> {
        if count > self.pending.len() {
            return Err(SequencingFault {
                count,
                pending: self.pending.len(),
            });
        }
        self.pending.drain(..count);
        self.believed_msg_id += count as i64;
        debug!(
            "Accepted {count} deltas, believed id {} with {} still pending",
            self.believed_msg_id,
            self.pending.len()
        );
        Ok(())
    }

    // ── message-id watermarks ───────────────────────────────────────────

    pub fn believed_msg_id(&self) -> i64 {
        self.believed_msg_id
    }

    /// Incorporated a committed remote batch of `n` deltas.
    pub fn advance_believed(&mut self, n: usize) {
        self.believed_msg_id += n as i64;
    }

    /// Stream position from an initial dump.
    pub fn set_believed(&mut self, msg_id: i64) {
        if msg_id < self.believed_msg_id {
            warn!(
                "Dump rewinds believed id {} -> {msg_id}",
                self.believed_msg_id
            );
        }
        self.believed_msg_id = msg_id;
    }

    /// Request a resend regardless of watermarks. The flag survives until a
    /// flush actually produces a message.
    pub fn set_force_flush(&mut self) {
        self.force_flush = true;
    }

    // ── flushing ────────────────────────────────────────────────────────

    /// Build the outbound `update`, or `None` when there is nothing the
    /// server does not already know about.
    ///
    /// The pending list is NOT consumed; only [`QueueManager::accept`]
    /// removes entries.
    pub fn flush_text(&mut self) -> Option<ClientMessage> {
        let (client_id, room_id) = match (self.client_id, &self.room_id) {
            (Some(c), Some(r)) => (c, r.clone()),
            _ => {
                debug!("Text flush skipped, not identified yet");
                return None;
            }
        };
        if self.sent_msg_id >= self.believed_msg_id && !self.force_flush {
            return None;
        }
        self.sent_msg_id = self.believed_msg_id;
        if self.pending.is_empty() {
            return None;
        }
        self.force_flush = false;
        info!(
            "Flushing {} pending deltas at believed id {}",
            self.pending.len(),
            self.believed_msg_id
        );
        Some(ClientMessage::Update {
            room_id,
            client_id,
            deltas: self.pending.iter().map(|rd| rd.delta.clone()).collect(),
            last_msg_id: self.believed_msg_id,
        })
    }

    // ── presence ────────────────────────────────────────────────────────

    pub fn enqueue_cursor(&mut self, ln: u32, pos: u32) {
        self.cursor = (ln, pos);
    }

    pub fn enqueue_typing(&mut self, typing: bool) {
        self.typing = typing;
    }

    /// Presence messages for every value that changed since the last flush.
    pub fn flush_presence(&mut self) -> Vec<ClientMessage> {
        let client_id = match self.client_id {
            Some(c) => c,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        if self.typing != self.flushed_typing {
            out.push(ClientMessage::Typing {
                client_id,
                is_typing: self.typing,
            });
            self.flushed_typing = self.typing;
        }
        if self.cursor != self.flushed_cursor {
            out.push(ClientMessage::Cursor {
                client_id,
                ln: self.cursor.0,
                pos: self.cursor.1,
            });
            self.flushed_cursor = self.cursor;
        }
        out
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Back to the initial state (room change). Reconnects to the SAME room
    /// must not call this; the pending queue survives a reconnect.
    pub fn reset(&mut self) {
        info!(
            "Queue reset, dropping {} pending deltas",
            self.pending.len()
        );
        self.pending.clear();
        self.believed_msg_id = -1;
        self.sent_msg_id = UNSENT_WATERMARK;
        self.client_id = None;
        self.room_id = None;
        self.force_flush = false;
        self.typing = false;
        self.flushed_typing = false;
        self.cursor = (0, 0);
        self.flushed_cursor = (0, 0);
    }
}

/// Derives the presence cadence from the text-flush rate.
///
/// Each closed measurement window extrapolates the observed text flushes to
/// a per-minute rate, subtracts it from the total budget, and clamps the
/// remainder into the configured presence band.
#[derive(Debug)]
pub struct FlushScheduler {
    total_message_freq: u32,
    presence_min_freq: u32,
    presence_max_freq: u32,
    window: Duration,
    text_flushes: u32,
}

impl FlushScheduler {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            total_message_freq: config.total_message_freq,
            presence_min_freq: config.presence_min_freq,
            presence_max_freq: config.presence_max_freq,
            window: config.rate_window,
            text_flushes: 0,
        }
    }

    /// Count one outbound text flush in the current window.
    pub fn record_text_flush(&mut self) {
        self.text_flushes += 1;
    }

    /// Close the window: compute the presence interval and reset the count.
    pub fn next_presence_interval(&mut self) -> Duration {
        let per_minute = self.text_flushes as u64 * 60 / self.window.as_secs().max(1);
        self.text_flushes = 0;
        let budget = self.total_message_freq.saturating_sub(per_minute as u32);
        let rate = budget
            .clamp(self.presence_min_freq, self.presence_max_freq)
            .max(1);
        let interval = Duration::from_millis(60_000 / rate as u64);
        debug!("Presence interval now {interval:?} ({rate}/min)");
        interval
    }
}
