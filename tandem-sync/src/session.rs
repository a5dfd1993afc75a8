//! Reconciliation between the local editor and the committed delta stream.
//!
//! A session sits between one text widget and the server:
//!
//! ```text
//!             user edits                    committed batches
//!                 │                                │
//!                 ▼                                ▼
//!   widget ── EditCoalescer ── QueueManager ── Session::apply_remote_update
//!                 ▲                                │
//!                 └── programmatic rebase ─────────┘
//! ```
//!
//! When a committed batch arrives it was produced against a document that
//! does not contain our unacknowledged local edits. The session unwinds
//! those edits, applies the batch, then re-applies the locals transformed
//! past the batch. The widget only ever sees deltas, never a full-text
//! diff, so cursors and scroll positions survive.
//!
//! Any loss of stream continuity (id gap, over-acknowledgement, a delta
//! the mirror rejects) abandons the local queue and refetches the document.

use log::{debug, error, info, warn};
use tandem_ot::{transform_all, Delta, Document, EditCoalescer, RawEdit, ReversibleDelta};
use uuid::Uuid;

use crate::protocol::ClientMessage;
use crate::queue::{QueueConfig, QueueManager};

/// Editor-side surface the session drives.
///
/// Implementations must report programmatic [`apply_delta`] calls back
/// through [`Session::record_local_edits`] exactly like user edits; the
/// session counts and skips those echoes. [`replace_content`] must NOT be
/// reported back.
///
/// [`apply_delta`]: WidgetHandle::apply_delta
/// [`replace_content`]: WidgetHandle::replace_content
pub trait WidgetHandle {
    fn apply_delta(&mut self, delta: &Delta);
    fn replace_content(&mut self, text: &str);
    fn set_read_only(&mut self, read_only: bool);
    fn save_viewport(&mut self);
    fn restore_viewport(&mut self);
}

/// What the caller must do after handing the session a message.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    /// Incorporated; nothing to send.
    Proceed,
    /// Stream continuity lost. Send the request and wait for a fresh dump.
    Resync(ClientMessage),
}

/// One widget's view of one room.
pub struct Session<W> {
    widget: W,
    coalescer: EditCoalescer,
    queue: QueueManager,
    room_id: String,
    client_id: Option<Uuid>,
}

impl<W: WidgetHandle> Session<W> {
    pub fn new(widget: W, room_id: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            widget,
            coalescer: EditCoalescer::new(Document::new()),
            queue: QueueManager::new(config),
            room_id: room_id.into(),
            client_id: None,
        }
    }

    pub fn widget(&self) -> &W {
        &self.widget
    }

    pub fn widget_mut(&mut self) -> &mut W {
        &mut self.widget
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Server assigned us an id; request the document.
    pub fn identify(&mut self, client_id: Uuid) -> ClientMessage {
        info!("Identified as {client_id} in room {}", self.room_id);
        self.client_id = Some(client_id);
        self.queue
            .set_identity(Some(client_id), Some(self.room_id.clone()));
        ClientMessage::InitialDumpRequest {
            room_id: self.room_id.clone(),
            client_id,
        }
    }

    /// Abandon the current room and start a fresh stream in another.
    ///
    /// The server assigns a new client id per connection, so identity is
    /// dropped along with the queue and the mirror.
    pub fn change_room(&mut self, room_id: impl Into<String>) {
        let room_id = room_id.into();
        info!("Leaving room {} for {room_id}", self.room_id);
        self.room_id = room_id;
        self.client_id = None;
        self.queue.reset();
        self.coalescer.replace_document("");
    }

    // ── local edits ─────────────────────────────────────────────────────

    /// Feed widget change notifications into the coalescer.
    pub fn record_local_edits(&mut self, edits: &[RawEdit]) -> SyncAction {
        // Echoes of programmatic applies do not count as typing.
        if edits.len() > self.coalescer.ignored_remaining() {
            self.queue.enqueue_typing(true);
        }
        match self.coalescer.record(edits) {
            Ok(()) => SyncAction::Proceed,
            Err(err) => self.resync(&format!("Mirror rejected a local edit: {err}")),
        }
    }

    /// Move coalesced edits into the send queue; true when the queue is
    /// due for a flush.
    pub fn drain_pending_edits(&mut self) -> bool {
        let drained = self.coalescer.take();
        if drained.is_empty() {
            return false;
        }
        debug!("Draining {} coalesced deltas into the queue", drained.len());
        self.queue.enqueue(drained)
    }

    pub fn flush_text(&mut self) -> Option<ClientMessage> {
        self.queue.flush_text()
    }

    /// Request a resend of the pending queue on the next flush.
    pub fn set_force_flush(&mut self) {
        self.queue.set_force_flush();
    }

    // ── presence ────────────────────────────────────────────────────────

    pub fn update_cursor(&mut self, ln: u32, pos: u32) {
        self.queue.enqueue_cursor(ln, pos);
    }

    pub fn update_typing(&mut self, typing: bool) {
        self.queue.enqueue_typing(typing);
    }

    pub fn flush_presence(&mut self) -> Vec<ClientMessage> {
        self.queue.flush_presence()
    }

    // ── remote stream ───────────────────────────────────────────────────

    /// Install a full document snapshot.
    ///
    /// Deltas queued before the snapshot survive: they are re-applied on
    /// top of it so the typist keeps seeing their own unacknowledged
    /// keystrokes, and they stay pending for resend; the server
    /// deduplicates resends it has already committed.
    pub fn apply_initial_dump(&mut self, content: &str, last_msg_id: i64) {
        info!(
            "Document snapshot: {} lines at msg id {last_msg_id}",
            content.split('\n').count()
        );
        // Edits still coalescing join the queue; the snapshot replaces
        // the mirror they were buffered against.
        self.drain_pending_edits();
        let pending = self.queue.take_pending();

        self.widget.set_read_only(true);
        self.widget.save_viewport();
        self.widget.replace_content(content);
        self.coalescer.replace_document(content);
        if !pending.is_empty() {
            debug!(
                "Re-applying {} surviving deltas on top of the snapshot",
                pending.len()
            );
            let deltas: Vec<Delta> = pending.iter().map(|rd| rd.delta.clone()).collect();
            match self.coalescer.apply_programmatic(&deltas) {
                Ok(()) => {
                    for delta in &deltas {
                        self.widget.apply_delta(delta);
                    }
                    self.queue.replace_pending(pending);
                }
                Err(err) => {
                    // Unapplyable backlog: keep the snapshot, drop the queue.
                    warn!("Dropping {} surviving deltas: {err}", deltas.len());
                    self.coalescer.replace_document(content);
                    self.widget.replace_content(content);
                }
            }
        }
        self.widget.restore_viewport();
        self.widget.set_read_only(false);

        self.queue.set_believed(last_msg_id);
        if self.queue.pending_len() > 0 {
            self.queue.set_force_flush();
        }
    }

    /// The server committed a prefix of our queue.
    pub fn handle_text_accepted(&mut self, count: usize) -> SyncAction {
        match self.queue.accept(count) {
            Ok(()) => SyncAction::Proceed,
            Err(fault) => self.resync(&fault.to_string()),
        }
    }

    /// Incorporate a committed batch from another client.
    ///
    /// The batch claims ids `start_msg_id + 1 ..= start_msg_id + n`. The
    /// prefix we have already incorporated is skipped; a batch starting
    /// beyond our believed id means we missed traffic and must resync.
    pub fn apply_remote_update(&mut self, deltas: &[Delta], start_msg_id: i64) -> SyncAction {
        let believed = self.queue.believed_msg_id();
        if start_msg_id > believed {
            return self.resync(&format!(
                "Gap in delta stream: batch starts after id {start_msg_id}, believed {believed}"
            ));
        }
        let effective = skip_already_incorporated(deltas, start_msg_id, believed);
        if effective.is_empty() {
            debug!("Batch at id {start_msg_id} already incorporated");
            return SyncAction::Proceed;
        }

        // Everything the server has not committed yet, oldest first.
        let mut local = self.queue.take_pending();
        local.extend(self.coalescer.take());

        let transformed = match transform_all(&local, effective) {
            Ok(t) => t,
            Err(err) => return self.resync(&format!("Transform failed: {err}")),
        };
        if let Err(err) = self.rebase_widget(&local, effective, &transformed) {
            return self.resync(&format!("Rebase failed: {err}"));
        }
        self.queue.replace_pending(transformed);
        self.queue.advance_believed(effective.len());
        SyncAction::Proceed
    }

    /// Unwind local edits, apply the committed batch, re-apply the locals
    /// transformed. Runs with the widget frozen so nothing interleaves.
    fn rebase_widget(
        &mut self,
        local: &[ReversibleDelta],
        remote: &[Delta],
        transformed: &[ReversibleDelta],
    ) -> Result<(), tandem_ot::DocumentError> {
        self.widget.set_read_only(true);
        self.widget.save_viewport();

        let mut program: Vec<Delta> =
            Vec::with_capacity(local.len() + remote.len() + transformed.len());
        program.extend(local.iter().rev().map(|rd| rd.reversed().delta));
        program.extend(remote.iter().cloned());
        program.extend(transformed.iter().map(|rd| rd.delta.clone()));

        let result = self.coalescer.apply_programmatic(&program);
        if result.is_ok() {
            for delta in &program {
                self.widget.apply_delta(delta);
            }
        }

        self.widget.restore_viewport();
        self.widget.set_read_only(false);
        result
    }

    fn resync(&mut self, reason: &str) -> SyncAction {
        error!("Resync: {reason}");
        self.coalescer.clear();
        self.queue.take_pending();
        match self.client_id {
            Some(client_id) => SyncAction::Resync(ClientMessage::InitialDumpRequest {
                room_id: self.room_id.clone(),
                client_id,
            }),
            None => {
                // Remote handling is gated on identification in the driver.
                warn!("Resync wanted before identification, nothing to request");
                SyncAction::Proceed
            }
        }
    }

    // ── introspection ───────────────────────────────────────────────────

    pub fn document_text(&self) -> String {
        self.coalescer.document().to_text()
    }

    /// Deltas not yet acknowledged, queued or still coalescing.
    pub fn pending_total(&self) -> usize {
        self.queue.pending_len() + self.coalescer.len()
    }

    pub fn believed_msg_id(&self) -> i64 {
        self.queue.believed_msg_id()
    }

    /// Programmatic edits whose widget echoes have not arrived yet.
    pub fn ignored_echoes(&self) -> usize {
        self.coalescer.ignored_remaining()
    }
}

/// Drop the prefix of `deltas` covered by ids at or below `believed`.
fn skip_already_incorporated(deltas: &[Delta], start_msg_id: i64, believed: i64) -> &[Delta] {
    let overlap = (believed - start_msg_id).clamp(0, deltas.len() as i64) as usize;
    if overlap > 0 {
        debug!("Skipping {overlap} already-incorporated deltas");
    }
    &deltas[overlap..]
}
