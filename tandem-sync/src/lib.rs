//! # tandem-sync — Real-time text synchronization for Tandem
//!
//! WebSocket client and server for multi-user editing on top of the
//! [`tandem_ot`] transformation engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │  SyncClient  │ ◄────────────────► │  SyncServer  │
//! │  (per user)  │    JSON frames     │  (sequencer) │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ Session      │                    │ Room         │
//! │ widget+queue │                    │ doc + msg ids│
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ per-client    │
//!                                    │ outboxes      │
//!                                    └───────────────┘
//! ```
//!
//! The server is the only party that assigns message ids; clients speak in
//! claims ("these deltas apply after id N") and reconcile rejections by
//! transforming their pending queue over whatever the server committed
//! first.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages (single or array frames)
//! - [`queue`] — outbound delta queue, watermarks, send-rate budgeting
//! - [`session`] — per-widget reconciliation state machine
//! - [`presence`] — remote cursor and typing bookkeeping
//! - [`client`] — WebSocket client driver with reconnect
//! - [`server`] — room-based WebSocket sequencer

pub mod client;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use client::{
    ClientConfig, ClientError, ConnectionState, ReconnectPolicy, SyncClient, SyncEvent,
};
pub use presence::{CursorRegistry, RemoteCursor, CURSOR_PALETTE};
pub use protocol::{ClientInfo, ClientMessage, ProtocolError, ServerMessage};
pub use queue::{FlushScheduler, QueueConfig, QueueManager, SequencingFault};
pub use server::{ServerConfig, ServerStats, SyncServer, DEFAULT_DOCUMENT};
pub use session::{Session, SyncAction, WidgetHandle};
