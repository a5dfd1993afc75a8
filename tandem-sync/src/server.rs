//! WebSocket sync server with room-based delta sequencing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (room_id) ── Document + last_msg_id
//! Client B ──┘         │
//!                      │  commit: claim == last_msg_id
//!                      ▼
//!              per-client outboxes ── flusher task ── JSON array frames
//! ```
//!
//! The server is the single sequencer for each room. An `update` whose
//! claimed id matches the room head is committed: its deltas get the next
//! ids, the sender is acknowledged, everyone else receives the batch.
//! Anything else is either a recognizable resend (acknowledged again, or
//! suffix-committed when the queue grew while the ack was in flight) or
//! stale and dropped; dropped senders converge via their own
//! retransmission and transform path.
//!
//! Replies are not written inline. They are queued per client and a
//! background flusher drains every outbox into one JSON array frame, so
//! bursts of cursor and delta traffic coalesce on the wire.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 9

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_ot::{Delta, Document, DocumentError};

use crate::protocol::{ClientInfo, ClientMessage, ProtocolError, ServerMessage};

/// Seeded into a room the first time someone requests a dump of an empty
/// document.
pub const DEFAULT_DOCUMENT: &str =
    "def main():\n    print('Hello, world!')\nif __name__ == '__main__':\n    main()";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Shared connect secret; `None` accepts everyone.
    pub token: Option<String>,
    /// Content handed to the first client of a fresh room.
    pub default_document: String,
    /// Pending outbox messages at which the flusher drains immediately.
    pub outbox_flush_threshold: usize,
    /// Flusher sleep when below the threshold.
    pub outbox_idle_wait: Duration,
    /// Flusher sleep after an error.
    pub outbox_error_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            token: None,
            default_document: DEFAULT_DOCUMENT.to_string(),
            outbox_flush_threshold: 1,
            outbox_idle_wait: Duration::from_millis(200),
            outbox_error_wait: Duration::from_secs(1),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub committed_deltas: u64,
    pub active_rooms: usize,
}

/// What a room did with an incoming `update`.
#[derive(Debug, Clone, PartialEq)]
enum CommitOutcome {
    /// Deltas got ids; ack the sender, fan the batch out.
    Committed {
        accepted: usize,
        broadcast: Vec<Delta>,
        start_msg_id: i64,
    },
    /// Recognized resend of an already-committed batch; ack again only.
    Reacknowledged { accepted: usize },
    /// Stale claim; the sender converges through its own transform path.
    Ignored,
    /// A delta did not fit the document; nothing was applied.
    Rejected(DocumentError),
}

struct RoomClient {
    client_id: Uuid,
    name: String,
    /// Claim and length of this client's last committed batch, for
    /// recognizing retransmissions.
    last_update: Option<(i64, usize)>,
}

/// One document and its participants.
#[derive(Default)]
struct Room {
    document: Document,
    last_msg_id: i64,
    clients: Vec<RoomClient>,
}

impl Room {
    fn join(&mut self, client_id: Uuid, name: &str) {
        self.clients.push(RoomClient {
            client_id,
            name: name.to_owned(),
            last_update: None,
        });
    }

    /// Drop a participant; true when the room is now empty.
    fn leave(&mut self, client_id: Uuid) -> bool {
        self.clients.retain(|c| c.client_id != client_id);
        self.clients.is_empty()
    }

    fn client_name(&self, client_id: Uuid) -> Option<String> {
        self.clients
            .iter()
            .find(|c| c.client_id == client_id)
            .map(|c| c.name.clone())
    }

    fn roster(&self) -> Vec<ClientInfo> {
        self.clients
            .iter()
            .map(|c| ClientInfo {
                client_id: c.client_id,
                name: c.name.clone(),
            })
            .collect()
    }

    /// Sequence an update batch.
    ///
    /// A batch claiming the current head commits as ids
    /// `head + 1 ..= head + n`. A batch repeating this client's previous
    /// claim is a retransmission: acknowledged again verbatim, or, when it
    /// grew at the tail and nothing else committed in between, committed
    /// for the new suffix only.
    fn commit_update(&mut self, client_id: Uuid, deltas: &[Delta], claim: i64) -> CommitOutcome {
        let n = deltas.len();
        let Some(idx) = self
            .clients
            .iter()
            .position(|c| c.client_id == client_id)
        else {
            return CommitOutcome::Ignored;
        };
        if n == 0 {
            return CommitOutcome::Ignored;
        }

        if claim == self.last_msg_id {
            return match self.apply_batch(deltas) {
                Ok(()) => {
                    self.last_msg_id += n as i64;
                    self.clients[idx].last_update = Some((claim, n));
                    CommitOutcome::Committed {
                        accepted: n,
                        broadcast: deltas.to_vec(),
                        start_msg_id: claim,
                    }
                }
                Err(err) => CommitOutcome::Rejected(err),
            };
        }

        let Some((last_claim, last_count)) = self.clients[idx].last_update else {
            return CommitOutcome::Ignored;
        };
        if claim != last_claim {
            return CommitOutcome::Ignored;
        }
        if n == last_count {
            return CommitOutcome::Reacknowledged { accepted: n };
        }
        // The queue grew while the ack was in flight. The suffix is only
        // sequential if nothing else has committed since.
        if n > last_count && self.last_msg_id == claim + last_count as i64 {
            let suffix = &deltas[last_count..];
            return match self.apply_batch(suffix) {
                Ok(()) => {
                    let start_msg_id = self.last_msg_id;
                    self.last_msg_id += suffix.len() as i64;
                    self.clients[idx].last_update = Some((claim, n));
                    CommitOutcome::Committed {
                        accepted: n,
                        broadcast: suffix.to_vec(),
                        start_msg_id,
                    }
                }
                Err(err) => CommitOutcome::Rejected(err),
            };
        }
        CommitOutcome::Ignored
    }

    /// All-or-nothing application of a batch.
    fn apply_batch(&mut self, deltas: &[Delta]) -> Result<(), DocumentError> {
        let mut scratch = self.document.clone();
        for delta in deltas {
            scratch.apply(delta)?;
        }
        self.document = scratch;
        Ok(())
    }
}

struct ClientHandle {
    outbox: Vec<ServerMessage>,
    tx: mpsc::UnboundedSender<String>,
}

/// Everything behind the server's single lock, mirroring the room map and
/// outbox table one sequencer needs.
#[derive(Default)]
struct ServerState {
    rooms: HashMap<String, Room>,
    connections: HashMap<Uuid, ClientHandle>,
    pending_total: usize,
    stats: ServerStats,
}

impl ServerState {
    fn register(
        &mut self,
        client_id: Uuid,
        room_id: &str,
        name: &str,
        tx: mpsc::UnboundedSender<String>,
    ) {
        self.connections.insert(
            client_id,
            ClientHandle {
                outbox: Vec::new(),
                tx,
            },
        );
        self.rooms
            .entry(room_id.to_owned())
            .or_default()
            .join(client_id, name);
        self.stats.active_rooms = self.rooms.len();
    }

    /// Remove a client; returns its name and whether the room emptied.
    fn unregister(&mut self, client_id: Uuid, room_id: &str) -> (String, bool) {
        self.connections.remove(&client_id);
        let mut name = String::new();
        let mut emptied = false;
        if let Some(room) = self.rooms.get_mut(room_id) {
            name = room.client_name(client_id).unwrap_or_default();
            emptied = room.leave(client_id);
            if emptied {
                self.rooms.remove(room_id);
            }
        }
        self.stats.active_rooms = self.rooms.len();
        (name, emptied)
    }

    fn queue_message(&mut self, client_id: Uuid, message: ServerMessage) {
        if let Some(handle) = self.connections.get_mut(&client_id) {
            handle.outbox.push(message);
            self.pending_total += 1;
        }
    }

    fn queue_to_room_except(&mut self, room_id: &str, except: Uuid, message: ServerMessage) {
        let recipients: Vec<Uuid> = match self.rooms.get(room_id) {
            Some(room) => room
                .clients
                .iter()
                .map(|c| c.client_id)
                .filter(|id| *id != except)
                .collect(),
            None => return,
        };
        for client_id in recipients {
            self.queue_message(client_id, message.clone());
        }
    }

    fn room_mut(&mut self, room_id: &str) -> &mut Room {
        self.rooms.entry(room_id.to_owned()).or_default()
    }
}

type SharedState = Arc<Mutex<ServerState>>;

/// A decoded frame the connection cannot continue past.
struct ConnectionFault {
    code: CloseCode,
    reason: &'static str,
}

impl ConnectionFault {
    fn invalid_format() -> Self {
        Self {
            code: CloseCode::Unsupported,
            reason: "Invalid message format",
        }
    }

    fn handshake_expected() -> Self {
        Self {
            code: CloseCode::Unsupported,
            reason: "Expected connect message",
        }
    }

    fn bad_token() -> Self {
        Self {
            code: CloseCode::Policy,
            reason: "Invalid token",
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    state: SharedState,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.lock().await.stats.clone()
    }

    /// Bind, start the outbox flusher, and accept connections forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Sync server listening on {}", self.config.bind_addr);

        tokio::spawn(Self::run_outbox_flusher(
            self.state.clone(),
            self.config.clone(),
        ));

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, state, config).await {
                    error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection<S>(
        stream: S,
        addr: SocketAddr,
        state: SharedState,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        info!("WebSocket connection established from {addr}");
        {
            let mut s = state.lock().await;
            s.stats.total_connections += 1;
            s.stats.active_connections += 1;
        }

        // Filled by the connect handshake.
        let mut identity: Option<(Uuid, String)> = None;
        // Frames queued for this client arrive here from the flusher.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let reason = loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match Self::handle_frame(
                                text.as_str(),
                                &mut identity,
                                &out_tx,
                                &state,
                                &config,
                            )
                            .await
                            {
                                Ok(()) => {}
                                Err(fault) => {
                                    let _ = ws_sender
                                        .send(Message::Close(Some(CloseFrame {
                                            code: fault.code,
                                            reason: fault.reason.into(),
                                        })))
                                        .await;
                                    break fault.reason;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break "peer closed",
                        Some(Ok(Message::Ping(data))) => {
                            // A registered client must still exit through
                            // the cleanup below when the write side dies.
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                error!("WebSocket write to {addr} failed: {e}");
                                break "write failed";
                            }
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error from {addr}: {e}");
                            break "transport error";
                        }
                        _ => {}
                    }
                }

                frame = out_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                                error!("WebSocket write to {addr} failed: {e}");
                                break "write failed";
                            }
                        }
                        None => break "outbox dropped",
                    }
                }
            }
        };

        // Cleanup: leave the room and tell the others.
        {
            let mut s = state.lock().await;
            s.stats.active_connections -= 1;
            if let Some((client_id, room_id)) = identity {
                let (name, emptied) = s.unregister(client_id, &room_id);
                if emptied {
                    info!("Room {room_id} removed (empty)");
                } else {
                    s.queue_to_room_except(
                        &room_id,
                        client_id,
                        ServerMessage::RemoveClient {
                            clients: vec![ClientInfo { client_id, name }],
                        },
                    );
                }
            }
        }
        info!("Connection from {addr} closed ({reason})");

        Ok(())
    }

    /// Decode one text frame and dispatch every message in it.
    async fn handle_frame(
        text: &str,
        identity: &mut Option<(Uuid, String)>,
        out_tx: &mpsc::UnboundedSender<String>,
        state: &SharedState,
        config: &ServerConfig,
    ) -> Result<(), ConnectionFault> {
        for decoded in ClientMessage::decode_frame(text) {
            let message = match decoded {
                Ok(m) => m,
                Err(e) => {
                    warn!("Rejecting connection: {e}");
                    return Err(ConnectionFault::invalid_format());
                }
            };
            state.lock().await.stats.total_messages += 1;

            match message {
                ClientMessage::Connect {
                    room_id,
                    name,
                    token,
                } => {
                    if identity.is_some() {
                        warn!("Duplicate connect from {identity:?} ignored");
                        continue;
                    }
                    if config.token.is_some() && token != config.token {
                        warn!("Connect to {room_id} with a bad token");
                        return Err(ConnectionFault::bad_token());
                    }
                    let client_id = Self::admit(state, out_tx, &room_id, &name).await?;
                    *identity = Some((client_id, room_id));
                }
                other => {
                    let Some((client_id, room_id)) = identity.clone() else {
                        return Err(ConnectionFault::handshake_expected());
                    };
                    Self::dispatch(state, config, client_id, &room_id, other).await;
                }
            }
        }
        Ok(())
    }

    /// Register a newcomer: ack with their id, hand them the roster, tell
    /// the room.
    async fn admit(
        state: &SharedState,
        out_tx: &mpsc::UnboundedSender<String>,
        room_id: &str,
        name: &str,
    ) -> Result<Uuid, ConnectionFault> {
        let client_id = Uuid::new_v4();
        let mut s = state.lock().await;
        s.register(client_id, room_id, name, out_tx.clone());
        let roster = s.room_mut(room_id).roster();

        // The ack and the first roster go out immediately, ahead of any
        // queued traffic.
        for message in [
            ServerMessage::ConnectAck { client_id },
            ServerMessage::AddClient { clients: roster },
        ] {
            let frame = message.encode().map_err(|e| {
                error!("Failed to encode handshake reply: {e}");
                ConnectionFault::invalid_format()
            })?;
            let _ = out_tx.send(frame);
        }

        s.queue_to_room_except(
            room_id,
            client_id,
            ServerMessage::AddClient {
                clients: vec![ClientInfo {
                    client_id,
                    name: name.to_owned(),
                }],
            },
        );
        info!("Client {client_id} ({name}) joined room {room_id}");
        Ok(client_id)
    }

    /// Post-handshake message routing. Identity comes from the connection,
    /// never from message fields.
    async fn dispatch(
        state: &SharedState,
        config: &ServerConfig,
        client_id: Uuid,
        room_id: &str,
        message: ClientMessage,
    ) {
        let mut s = state.lock().await;
        match message {
            ClientMessage::InitialDumpRequest { .. } => {
                let room = s.room_mut(room_id);
                if room.last_msg_id == 0 && room.document.to_text().is_empty() {
                    room.document = Document::from_text(&config.default_document);
                }
                let dump = ServerMessage::InitialDump {
                    content: room.document.to_text(),
                    last_msg_id: room.last_msg_id,
                };
                debug!("Dump for {client_id} in {room_id} at id {}", room.last_msg_id);
                s.queue_message(client_id, dump);
            }

            ClientMessage::Update {
                deltas,
                last_msg_id,
                ..
            } => {
                let outcome = s
                    .room_mut(room_id)
                    .commit_update(client_id, &deltas, last_msg_id);
                match outcome {
                    CommitOutcome::Committed {
                        accepted,
                        broadcast,
                        start_msg_id,
                    } => {
                        debug!(
                            "Committed {} deltas from {client_id} in {room_id} starting after id {start_msg_id}",
                            broadcast.len()
                        );
                        s.stats.committed_deltas += broadcast.len() as u64;
                        s.queue_message(client_id, ServerMessage::TextAccepted { count: accepted });
                        s.queue_to_room_except(
                            room_id,
                            client_id,
                            ServerMessage::Update {
                                deltas: broadcast,
                                start_msg_id,
                            },
                        );
                    }
                    CommitOutcome::Reacknowledged { accepted } => {
                        debug!("Re-acknowledging {accepted} deltas for {client_id}");
                        s.queue_message(client_id, ServerMessage::TextAccepted { count: accepted });
                    }
                    CommitOutcome::Ignored => {
                        debug!(
                            "Stale update from {client_id} (claimed {last_msg_id}) ignored"
                        );
                    }
                    CommitOutcome::Rejected(err) => {
                        error!("Update from {client_id} rejected: {err}");
                    }
                }
            }

            ClientMessage::Cursor { ln, pos, .. } => {
                let name = s
                    .rooms
                    .get(room_id)
                    .and_then(|r| r.client_name(client_id))
                    .unwrap_or_default();
                s.queue_to_room_except(
                    room_id,
                    client_id,
                    ServerMessage::CursorUpdate {
                        client_id,
                        name,
                        ln,
                        pos,
                    },
                );
            }

            ClientMessage::Typing { is_typing, .. } => {
                s.queue_to_room_except(
                    room_id,
                    client_id,
                    ServerMessage::TypingIndicator {
                        client_id,
                        typing: is_typing,
                    },
                );
            }

            // Handled before dispatch.
            ClientMessage::Connect { .. } => {}
        }
    }

    /// Drain outboxes into one array frame per client whenever enough is
    /// pending.
    async fn run_outbox_flusher(state: SharedState, config: ServerConfig) {
        info!(
            "Outbox flusher started (threshold {})",
            config.outbox_flush_threshold
        );
        loop {
            match Self::flush_outboxes(&state, config.outbox_flush_threshold).await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(config.outbox_idle_wait).await,
                Err(e) => {
                    error!("Outbox flush failed: {e}");
                    tokio::time::sleep(config.outbox_error_wait).await;
                }
            }
        }
    }

    /// One flusher pass; true when any frame went out.
    async fn flush_outboxes(state: &SharedState, threshold: usize) -> Result<bool, ProtocolError> {
        let batches: Vec<(mpsc::UnboundedSender<String>, String)> = {
            let mut s = state.lock().await;
            if s.pending_total < threshold.max(1) {
                return Ok(false);
            }
            s.pending_total = 0;
            let mut out = Vec::new();
            for handle in s.connections.values_mut() {
                if handle.outbox.is_empty() {
                    continue;
                }
                let messages = std::mem::take(&mut handle.outbox);
                let frame = ServerMessage::encode_batch(&messages)?;
                out.push((handle.tx.clone(), frame));
            }
            out
        };
        let flushed = !batches.is_empty();
        for (tx, frame) in batches {
            // A closed channel means the connection is going away; its
            // cleanup handles the room side.
            let _ = tx.send(frame);
        }
        Ok(flushed)
    }
}
