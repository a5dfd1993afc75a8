//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real server and connect real clients,
//! verifying the full edit, snapshot, and presence pipeline.

use std::sync::{Arc, Mutex};

use tandem_ot::{Delta, Document, Position, RawEdit};
use tandem_sync::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use tandem_sync::queue::QueueConfig;
use tandem_sync::server::{ServerConfig, SyncServer, DEFAULT_DOCUMENT};
use tandem_sync::session::WidgetHandle;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    start_test_server_with(ServerConfig::default()).await
}

async fn start_test_server_with(mut config: ServerConfig) -> u16 {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// Editor stand-in: a shared document buffer that echoes programmatic
/// applications back to the driver, the way a real widget reports its
/// change events.
struct TestWidget {
    doc: Arc<Mutex<Document>>,
    echo_tx: mpsc::UnboundedSender<Vec<RawEdit>>,
}

impl WidgetHandle for TestWidget {
    fn apply_delta(&mut self, delta: &Delta) {
        let mut doc = self.doc.lock().unwrap();
        doc.apply(delta).unwrap();
        let echo = RawEdit::new(delta.start(), delta.end(), delta.text.clone(), 0);
        let _ = self.echo_tx.send(vec![echo]);
    }

    fn replace_content(&mut self, content: &str) {
        *self.doc.lock().unwrap() = Document::from_text(content);
    }

    fn set_read_only(&mut self, _read_only: bool) {}
    fn save_viewport(&mut self) {}
    fn restore_viewport(&mut self) {}
}

struct TestClient {
    handle: Arc<SyncClient>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    doc: Arc<Mutex<Document>>,
}

impl TestClient {
    fn text(&self) -> String {
        self.doc.lock().unwrap().to_text()
    }

    /// Type into the local buffer and report the edit, like an embedder
    /// wiring a real editor would.
    fn type_text(&self, line: u32, col: u32, text: &str) {
        let position = Position::new(line, col);
        let offset = {
            let mut doc = self.doc.lock().unwrap();
            let offset = doc.offset_at(position);
            doc.apply(&Delta::insert(position, text)).unwrap();
            offset
        };
        self.handle
            .submit_edits(vec![RawEdit::new(position, position, text, offset)])
            .unwrap();
    }
}

async fn join_room(port: u16, room: &str, name: &str) -> TestClient {
    join_room_with(port, room, name, None).await
}

async fn join_room_with(port: u16, room: &str, name: &str, token: Option<String>) -> TestClient {
    let doc = Arc::new(Mutex::new(Document::new()));
    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel();
    let widget = TestWidget {
        doc: doc.clone(),
        echo_tx,
    };
    let config = ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}/ws"),
        room_id: room.to_string(),
        name: name.to_string(),
        token,
        queue: QueueConfig {
            coalesce_interval: Duration::from_millis(100),
            heartbeat: Duration::from_millis(1000),
            ..QueueConfig::default()
        },
        ..ClientConfig::default()
    };
    let mut client = SyncClient::spawn(config, widget);
    let events = client.take_event_rx().unwrap();
    let handle = Arc::new(client);

    // Forward widget echoes into the driver.
    let echo_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(edits) = echo_rx.recv().await {
            if echo_handle.submit_edits(edits).is_err() {
                break;
            }
        }
    });

    TestClient { handle, events, doc }
}

/// Drain events until one matches, within a 5 second budget.
async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<SyncEvent>,
    want: fn(&SyncEvent) -> bool,
) -> bool {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if want(&event) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/ws");

    // Connect raw WebSocket
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_identifies_and_receives_snapshot() {
    let port = start_test_server().await;
    let mut alice = join_room(port, "solo", "alice").await;

    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::Connected)).await);
    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::Identified(_))).await);
    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);

    assert_eq!(alice.handle.state().await, ConnectionState::Identified);
    // A fresh room hands out the starter document.
    assert_eq!(alice.text(), DEFAULT_DOCUMENT);
}

#[tokio::test]
async fn test_edit_propagates_between_clients() {
    let port = start_test_server().await;
    let mut alice = join_room(port, "shared", "alice").await;
    let mut bob = join_room(port, "shared", "bob").await;

    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);
    assert!(wait_for_event(&mut bob.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);

    alice.type_text(1, 1, "# ");

    assert!(wait_for_event(&mut bob.events, |e| matches!(e, SyncEvent::RemoteEdit)).await);
    assert_eq!(bob.text(), format!("# {DEFAULT_DOCUMENT}"));
}

#[tokio::test]
async fn test_edits_converge_both_ways() {
    let port = start_test_server().await;
    let mut alice = join_room(port, "duet", "alice").await;
    let mut bob = join_room(port, "duet", "bob").await;

    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);
    assert!(wait_for_event(&mut bob.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);

    alice.type_text(1, 1, "# ");
    assert!(wait_for_event(&mut bob.events, |e| matches!(e, SyncEvent::RemoteEdit)).await);

    // Let Bob's widget echo drain before he types himself.
    sleep(Duration::from_millis(300)).await;
    bob.type_text(1, 3, "reviewed ");
    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::RemoteEdit)).await);

    let expected = format!("# reviewed {DEFAULT_DOCUMENT}");
    assert_eq!(bob.text(), expected);
    assert_eq!(alice.text(), expected);
}

#[tokio::test]
async fn test_late_joiner_receives_committed_text() {
    let port = start_test_server().await;
    let mut alice = join_room(port, "annex", "alice").await;
    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);

    alice.type_text(1, 1, "# ");
    // Let the edit flush and commit before anyone else joins.
    sleep(Duration::from_millis(800)).await;

    let mut bob = join_room(port, "annex", "bob").await;
    assert!(wait_for_event(&mut bob.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);
    assert_eq!(bob.text(), format!("# {DEFAULT_DOCUMENT}"));
}

#[tokio::test]
async fn test_cursor_and_typing_presence_relayed() {
    let port = start_test_server().await;
    let mut alice = join_room(port, "huddle", "alice").await;
    let mut bob = join_room(port, "huddle", "bob").await;

    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);
    assert!(wait_for_event(&mut bob.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);

    // Wire coordinates are zero-based; (2, 4) lands on line 3, column 5.
    bob.handle.cursor_moved(2, 4).unwrap();
    let positioned = timeout(Duration::from_secs(5), async {
        loop {
            if alice.events.recv().await.is_none() {
                return false;
            }
            let cursors = alice.handle.remote_cursors().await;
            if cursors
                .iter()
                .any(|c| c.name == "bob" && c.position() == Position::new(3, 5))
            {
                return true;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(positioned, "Alice never saw Bob's cursor");

    bob.handle.set_typing(true).unwrap();
    let typing_seen = timeout(Duration::from_secs(5), async {
        loop {
            if alice.events.recv().await.is_none() {
                return false;
            }
            let cursors = alice.handle.remote_cursors().await;
            if cursors.iter().any(|c| c.name == "bob" && c.typing) {
                return true;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(typing_seen, "Alice never saw Bob typing");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let port = start_test_server().await;
    let mut alice = join_room(port, "alpha", "alice").await;
    let mut bob = join_room(port, "beta", "bob").await;

    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);
    assert!(wait_for_event(&mut bob.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);

    alice.type_text(1, 1, "# ");

    // Bob shares the server but not the room; nothing may reach him.
    let leaked = timeout(Duration::from_millis(1500), async {
        while let Some(event) = bob.events.recv().await {
            if event == SyncEvent::RemoteEdit {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(!leaked, "edit leaked across rooms");
    assert_eq!(bob.text(), DEFAULT_DOCUMENT);
}

#[tokio::test]
async fn test_change_room_joins_fresh_stream() {
    let port = start_test_server().await;
    let mut alice = join_room(port, "first", "alice").await;
    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);

    alice.type_text(1, 1, "# ");
    // Let the edit commit before leaving.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.text(), format!("# {DEFAULT_DOCUMENT}"));

    alice.handle.change_room("second").unwrap();
    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::Disconnected)).await);
    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);

    // The new room starts from its own seed, untouched by the old one.
    assert_eq!(alice.handle.state().await, ConnectionState::Identified);
    assert_eq!(alice.text(), DEFAULT_DOCUMENT);
}

#[tokio::test]
async fn test_connect_token_is_enforced() {
    let port = start_test_server_with(ServerConfig {
        token: Some("sesame".to_string()),
        ..ServerConfig::default()
    })
    .await;

    // Wrong token: the server closes the socket before assigning an id.
    let mut mallory = join_room_with(port, "vault", "mallory", Some("guess".to_string())).await;
    let identified = timeout(Duration::from_secs(2), async {
        while let Some(event) = mallory.events.recv().await {
            match event {
                SyncEvent::Identified(_) => return true,
                SyncEvent::Disconnected => return false,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(!identified, "client with a bad token must not identify");
    let _ = mallory.handle.shutdown();

    // The right token sails through.
    let mut alice = join_room_with(port, "vault", "alice", Some("sesame".to_string())).await;
    assert!(wait_for_event(&mut alice.events, |e| matches!(e, SyncEvent::DocumentReplaced)).await);
}
