//! WebSocket sync client: the driver task behind an editor widget.
//!
//! ```text
//! embedder ── SyncClient handle ── command channel ──┐
//!                                                     ▼
//!                                             Driver task (select!)
//!                                             ├─ Session (widget + queue)
//!                                             ├─ CursorRegistry
//!                                             ├─ coalesce / heartbeat timers
//!                                             └─ WebSocket to the server
//! ```
//!
//! The embedder reports raw widget edits and presence changes through the
//! handle; the driver owns the widget, the session state machine, and the
//! connection. Everything observable flows back as [`SyncEvent`]s.
//!
//! The driver reconnects with capped exponential backoff. Local edits made
//! while offline keep accumulating in the session and are re-offered after
//! the next snapshot, so a dropped link costs latency, not text.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, interval_at, sleep_until, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_ot::RawEdit;

use crate::presence::{CursorRegistry, RemoteCursor};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::queue::{FlushScheduler, QueueConfig};
use crate::session::{Session, SyncAction, WidgetHandle};

/// Presence send period used until the first rate window completes.
const INITIAL_PRESENCE_INTERVAL: Duration = Duration::from_millis(1000);

/// Typing presence clears this long after the last keystroke.
const TYPING_CLEAR_INTERVAL: Duration = Duration::from_secs(2);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the sync server.
    pub server_url: String,
    /// Room to join.
    pub room_id: String,
    /// Display name announced to other participants.
    pub name: String,
    /// Shared connect secret, when the server requires one.
    pub token: Option<String>,
    /// Queue and timer tuning.
    pub queue: QueueConfig,
    /// Reconnect behavior.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000/ws".to_string(),
            room_id: "default".to_string(),
            name: "anonymous".to_string(),
            token: None,
            queue: QueueConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Reconnect backoff policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket is up, waiting for the server to assign a client id.
    Unidentified,
    Identified,
}

/// Notifications emitted by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Identified(Uuid),
    /// A snapshot replaced the document.
    DocumentReplaced,
    /// A remote batch was transformed into the document.
    RemoteEdit,
    PresenceChanged,
    /// The session lost the stream and requested a fresh snapshot.
    Resyncing,
}

/// Commands the handle sends to the driver.
#[derive(Debug, Clone)]
enum ClientCommand {
    LocalEdits(Vec<RawEdit>),
    CursorMoved { ln: u32, pos: u32 },
    TypingChanged(bool),
    ChangeRoom(String),
    Shutdown,
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Sync client is no longer running")]
    ChannelClosed,
}

/// Handle to a running sync client.
pub struct SyncClient {
    command_tx: mpsc::UnboundedSender<ClientCommand>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    state: Arc<RwLock<ConnectionState>>,
    presence: Arc<RwLock<CursorRegistry>>,
}

impl SyncClient {
    /// Start the driver task around a widget.
    pub fn spawn<W>(config: ClientConfig, widget: W) -> Self
    where
        W: WidgetHandle + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let presence = Arc::new(RwLock::new(CursorRegistry::new()));

        let session = Session::new(widget, config.room_id.clone(), config.queue.clone());
        let scheduler = FlushScheduler::new(&config.queue);
        let driver = Driver {
            config,
            session,
            scheduler,
            command_rx,
            event_tx,
            state: state.clone(),
            presence: presence.clone(),
        };
        tokio::spawn(driver.run());

        Self {
            command_tx,
            event_rx: Some(event_rx),
            state,
            presence,
        }
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Remote cursors in join order.
    pub async fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.presence
            .read()
            .await
            .cursors()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Report raw edits the user made in the widget.
    pub fn submit_edits(&self, edits: Vec<RawEdit>) -> Result<(), ClientError> {
        self.send(ClientCommand::LocalEdits(edits))
    }

    /// Report the local caret position (zero-based, as the wire wants it).
    pub fn cursor_moved(&self, ln: u32, pos: u32) -> Result<(), ClientError> {
        self.send(ClientCommand::CursorMoved { ln, pos })
    }

    pub fn set_typing(&self, typing: bool) -> Result<(), ClientError> {
        self.send(ClientCommand::TypingChanged(typing))
    }

    /// Leave the current room and join another on a fresh connection.
    ///
    /// Unacknowledged edits in the old room are dropped; the new room's
    /// snapshot replaces the document.
    pub fn change_room(&self, room_id: impl Into<String>) -> Result<(), ClientError> {
        self.send(ClientCommand::ChangeRoom(room_id.into()))
    }

    /// Ask the driver to close the connection and exit.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.send(ClientCommand::Shutdown)
    }

    fn send(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.command_tx
            .send(command)
            .map_err(|_| ClientError::ChannelClosed)
    }
}

/// How one connection ended.
enum DriveOutcome {
    /// The embedder asked us to stop.
    Shutdown,
    /// The link dropped; `identified` says whether the handshake completed.
    Lost { identified: bool },
    /// The embedder switched rooms; redial without backoff.
    RoomChanged,
}

struct Driver<W: WidgetHandle> {
    config: ClientConfig,
    session: Session<W>,
    scheduler: FlushScheduler,
    command_rx: mpsc::UnboundedReceiver<ClientCommand>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    state: Arc<RwLock<ConnectionState>>,
    presence: Arc<RwLock<CursorRegistry>>,
}

impl<W: WidgetHandle> Driver<W> {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting).await;
            let outcome = self.connect_and_drive().await;
            self.set_state(ConnectionState::Disconnected).await;
            let _ = self.event_tx.send(SyncEvent::Disconnected);

            match outcome {
                Ok(DriveOutcome::Shutdown) => return,
                Ok(DriveOutcome::RoomChanged) => {
                    attempt = 0;
                    continue;
                }
                Ok(DriveOutcome::Lost { identified }) => {
                    // A connection that got as far as an id counts as a
                    // success; the failure streak restarts.
                    if identified {
                        attempt = 0;
                    }
                }
                Err(e) => warn!("Connection attempt failed: {e}"),
            }

            attempt += 1;
            if attempt > self.config.reconnect.max_attempts {
                error!(
                    "Giving up after {} reconnect attempts",
                    self.config.reconnect.max_attempts
                );
                return;
            }
            let delay = backoff_delay(attempt, self.config.reconnect.max_backoff);
            info!(
                "Reconnecting in {delay:?} (attempt {attempt}/{})",
                self.config.reconnect.max_attempts
            );
            if self.wait_for_retry(delay).await {
                return;
            }
        }
    }

    /// Sleep out the backoff while still accepting commands. Local edits
    /// keep accumulating for the next connection; true means shutdown.
    async fn wait_for_retry(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                command = self.command_rx.recv() => match command {
                    Some(ClientCommand::LocalEdits(edits)) => {
                        let _ = self.session.record_local_edits(&edits);
                    }
                    Some(ClientCommand::CursorMoved { ln, pos }) => {
                        self.session.update_cursor(ln, pos);
                    }
                    Some(ClientCommand::TypingChanged(typing)) => {
                        self.session.update_typing(typing);
                    }
                    Some(ClientCommand::ChangeRoom(room_id)) => {
                        // The new room cuts the backoff short.
                        self.switch_room(room_id).await;
                        return false;
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        info!("Shutdown during reconnect backoff");
                        return true;
                    }
                },
            }
        }
    }

    /// Point the driver at another room and forget the old one's state.
    async fn switch_room(&mut self, room_id: String) {
        self.config.room_id = room_id.clone();
        self.session.change_room(room_id);
        self.presence.write().await.clear();
    }

    /// Dial the server and run one connection to completion.
    async fn connect_and_drive(&mut self) -> Result<DriveOutcome, ClientError> {
        info!("Connecting to {}", self.config.server_url);
        let (ws_stream, _) = connect_async(self.config.server_url.as_str()).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        self.set_state(ConnectionState::Unidentified).await;
        let _ = self.event_tx.send(SyncEvent::Connected);

        let connect = ClientMessage::Connect {
            room_id: self.config.room_id.clone(),
            name: self.config.name.clone(),
            token: self.config.token.clone(),
        };
        ws_sender.send(Message::Text(connect.encode()?.into())).await?;

        let mut identified = false;
        let mut coalesce = interval(self.config.queue.coalesce_interval);
        let mut heartbeat = interval(self.config.queue.heartbeat);
        // The rate window must complete once before it recomputes anything.
        let mut rate_window = interval_at(
            Instant::now() + self.config.queue.rate_window,
            self.config.queue.rate_window,
        );
        let mut presence_interval = INITIAL_PRESENCE_INTERVAL;
        let mut presence_deadline = Instant::now() + presence_interval;
        // Typing presence follows keystrokes and clears itself; the arm
        // below only fires while a keystroke has it armed.
        let mut typing_armed = false;
        let mut typing_deadline = Instant::now() + TYPING_CLEAR_INTERVAL;

        loop {
            let mut outbound: Vec<ClientMessage> = Vec::new();

            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            for decoded in ServerMessage::decode_frame(text.as_str()) {
                                match decoded {
                                    Ok(message) => {
                                        self.handle_server_message(
                                            message,
                                            &mut outbound,
                                            &mut identified,
                                        )
                                        .await;
                                    }
                                    Err(e) => warn!("Discarding undecodable server message: {e}"),
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Server closed the connection");
                            return Ok(DriveOutcome::Lost { identified });
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error: {e}");
                            return Ok(DriveOutcome::Lost { identified });
                        }
                        _ => {}
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(ClientCommand::LocalEdits(edits)) => {
                            let action = self.session.record_local_edits(&edits);
                            self.apply_action(action, &mut outbound);
                            typing_armed = true;
                            typing_deadline = Instant::now() + TYPING_CLEAR_INTERVAL;
                        }
                        Some(ClientCommand::CursorMoved { ln, pos }) => {
                            self.session.update_cursor(ln, pos);
                        }
                        Some(ClientCommand::TypingChanged(typing)) => {
                            self.session.update_typing(typing);
                        }
                        Some(ClientCommand::ChangeRoom(room_id)) => {
                            self.switch_room(room_id).await;
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(DriveOutcome::RoomChanged);
                        }
                        Some(ClientCommand::Shutdown) | None => {
                            info!("Shutting down sync client");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(DriveOutcome::Shutdown);
                        }
                    }
                }

                _ = coalesce.tick() => {
                    if self.session.drain_pending_edits() {
                        if let Some(update) = self.session.flush_text() {
                            self.scheduler.record_text_flush();
                            outbound.push(update);
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    // Retransmission: anything unacknowledged goes out
                    // again; the server deduplicates.
                    self.session.set_force_flush();
                    if let Some(update) = self.session.flush_text() {
                        debug!("Heartbeat re-offering the pending queue");
                        self.scheduler.record_text_flush();
                        outbound.push(update);
                    }
                }

                _ = sleep_until(presence_deadline) => {
                    outbound.extend(self.session.flush_presence());
                    presence_deadline = Instant::now() + presence_interval;
                }

                _ = sleep_until(typing_deadline), if typing_armed => {
                    typing_armed = false;
                    self.session.update_typing(false);
                }

                _ = rate_window.tick() => {
                    presence_interval = self.scheduler.next_presence_interval();
                    debug!("Presence interval now {presence_interval:?}");
                }
            }

            for message in outbound {
                ws_sender.send(Message::Text(message.encode()?.into())).await?;
            }
        }
    }

    async fn handle_server_message(
        &mut self,
        message: ServerMessage,
        outbound: &mut Vec<ClientMessage>,
        identified: &mut bool,
    ) {
        match message {
            ServerMessage::ConnectAck { client_id } => {
                info!("Identified as {client_id}");
                *identified = true;
                self.presence.write().await.set_local_client(client_id);
                outbound.push(self.session.identify(client_id));
                self.set_state(ConnectionState::Identified).await;
                let _ = self.event_tx.send(SyncEvent::Identified(client_id));
            }

            ServerMessage::InitialDump {
                content,
                last_msg_id,
            } => {
                self.session.apply_initial_dump(&content, last_msg_id);
                // Edits queued before the snapshot are re-offered now.
                if let Some(update) = self.session.flush_text() {
                    self.scheduler.record_text_flush();
                    outbound.push(update);
                }
                let _ = self.event_tx.send(SyncEvent::DocumentReplaced);
            }

            ServerMessage::Update {
                deltas,
                start_msg_id,
            } => {
                let action = self.session.apply_remote_update(&deltas, start_msg_id);
                if action == SyncAction::Proceed {
                    let _ = self.event_tx.send(SyncEvent::RemoteEdit);
                }
                self.apply_action(action, outbound);
            }

            ServerMessage::TextAccepted { count } => {
                let action = self.session.handle_text_accepted(count);
                self.apply_action(action, outbound);
            }

            presence @ (ServerMessage::CursorUpdate { .. }
            | ServerMessage::TypingIndicator { .. }
            | ServerMessage::AddClient { .. }
            | ServerMessage::RemoveClient { .. }) => {
                if self.presence.write().await.handle_message(&presence) {
                    let _ = self.event_tx.send(SyncEvent::PresenceChanged);
                }
            }
        }
    }

    fn apply_action(&mut self, action: SyncAction, outbound: &mut Vec<ClientMessage>) {
        match action {
            SyncAction::Proceed => {}
            SyncAction::Resync(request) => {
                let _ = self.event_tx.send(SyncEvent::Resyncing);
                outbound.push(request);
            }
        }
    }

    // `&mut self`: holding `&Driver` across an await would demand
    // `W: Sync`, which spawn does not require.
    async fn set_state(&mut self, new: ConnectionState) {
        *self.state.write().await = new;
    }
}

/// Exponential backoff: 2, 4, 8, ... seconds, capped.
fn backoff_delay(attempt: u32, max_backoff: Duration) -> Duration {
    let secs = 2u64
        .saturating_pow(attempt)
        .min(max_backoff.as_secs().max(1));
    Duration::from_secs(secs)
}
