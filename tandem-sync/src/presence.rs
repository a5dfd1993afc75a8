//! Remote cursor and typing awareness.
//!
//! Presence is last-value-wins state, fully separate from the document
//! delta stream:
//!
//! ```text
//! cursor_update / typing_indicator / addclient / removeclient
//!       │
//!       ▼
//! CursorRegistry::handle_message()
//!       │  (upsert keyed by client id, palette slot on first sight)
//!       ▼
//! CursorRegistry::cursors()  →  render layer
//! ```
//!
//! Wire coordinates are zero-based; [`RemoteCursor::position`] converts to
//! the one-based document coordinates everything else uses.
//!
//! Reference: Kleppmann, Chapter 5 — Replication (last-writer-wins)

use std::collections::HashMap;

use log::debug;
use uuid::Uuid;

use crate::protocol::{ClientInfo, ServerMessage};
use tandem_ot::Position;

/// Remote cursor colors, assigned round-robin by join order.
pub const CURSOR_PALETTE: [&str; 11] = [
    "#FF6B6B", // red
    "#4ECDC4", // teal
    "#45B7D1", // blue
    "#96CEB4", // green
    "#FFEAA7", // yellow
    "#DDA0DD", // plum
    "#98D8C8", // mint
    "#F7DC6F", // gold
    "#BB8FCE", // purple
    "#85C1E9", // light blue
    "#F8C471", // orange
];

/// One remote participant as the render layer sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCursor {
    pub client_id: Uuid,
    pub name: String,
    /// Wire coordinates, zero-based.
    pub ln: u32,
    pub pos: u32,
    pub typing: bool,
    /// Palette slot, stable for the lifetime of the participant.
    pub color_index: usize,
}

impl RemoteCursor {
    pub fn color(&self) -> &'static str {
        CURSOR_PALETTE[self.color_index % CURSOR_PALETTE.len()]
    }

    /// One-based document position, for labels and hit testing.
    pub fn position(&self) -> Position {
        Position::new(self.ln + 1, self.pos + 1)
    }
}

/// Everyone else's cursors in the room.
///
/// Fed from the server message stream; messages about the local client are
/// ignored so our own echo never shows up as a ghost cursor.
#[derive(Debug, Default)]
pub struct CursorRegistry {
    local_client_id: Option<Uuid>,
    cursors: HashMap<Uuid, RemoteCursor>,
    next_color: usize,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Our own id, known once the server acknowledges the connect.
    pub fn set_local_client(&mut self, client_id: Uuid) {
        self.local_client_id = Some(client_id);
        self.cursors.remove(&client_id);
    }

    /// Fold one server message into the registry; true when anything
    /// visible changed.
    pub fn handle_message(&mut self, msg: &ServerMessage) -> bool {
        match msg {
            ServerMessage::CursorUpdate {
                client_id,
                name,
                ln,
                pos,
            } => {
                if self.is_local(*client_id) {
                    return false;
                }
                let entry = self.entry(*client_id, name);
                entry.name = name.clone();
                entry.ln = *ln;
                entry.pos = *pos;
                true
            }
            ServerMessage::TypingIndicator { client_id, typing } => {
                if self.is_local(*client_id) {
                    return false;
                }
                match self.cursors.get_mut(client_id) {
                    Some(cursor) if cursor.typing != *typing => {
                        cursor.typing = *typing;
                        true
                    }
                    _ => false,
                }
            }
            ServerMessage::AddClient { clients } => self.merge_roster(clients),
            ServerMessage::RemoveClient { clients } => {
                let mut changed = false;
                for client in clients {
                    changed |= self.cursors.remove(&client.client_id).is_some();
                }
                changed
            }
            _ => false,
        }
    }

    /// Known participant or a fresh one on its next palette slot.
    fn entry(&mut self, client_id: Uuid, name: &str) -> &mut RemoteCursor {
        let next_color = &mut self.next_color;
        self.cursors.entry(client_id).or_insert_with(|| {
            let color_index = *next_color;
            *next_color += 1;
            debug!("New remote cursor {client_id} ({name}) on palette slot {color_index}");
            RemoteCursor {
                client_id,
                name: name.to_owned(),
                ln: 0,
                pos: 0,
                typing: false,
                color_index,
            }
        })
    }

    /// Roster announcement: add newcomers, refresh names, keep palette
    /// slots of everyone already known.
    fn merge_roster(&mut self, clients: &[ClientInfo]) -> bool {
        let mut changed = false;
        for client in clients {
            if self.is_local(client.client_id) {
                continue;
            }
            let known = self.cursors.contains_key(&client.client_id);
            let entry = self.entry(client.client_id, &client.name);
            if !known || entry.name != client.name {
                entry.name = client.name.clone();
                changed = true;
            }
        }
        changed
    }

    fn is_local(&self, client_id: Uuid) -> bool {
        self.local_client_id == Some(client_id)
    }

    pub fn cursor(&self, client_id: &Uuid) -> Option<&RemoteCursor> {
        self.cursors.get(client_id)
    }

    /// Participants in join order.
    pub fn cursors(&self) -> Vec<&RemoteCursor> {
        let mut all: Vec<&RemoteCursor> = self.cursors.values().collect();
        all.sort_by_key(|c| c.color_index);
        all
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Room switch: forget everyone and start the palette over.
    pub fn clear(&mut self) {
        self.cursors.clear();
        self.next_color = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_update(client_id: Uuid, name: &str, ln: u32, pos: u32) -> ServerMessage {
        ServerMessage::CursorUpdate {
            client_id,
            name: name.into(),
            ln,
            pos,
        }
    }

    fn roster(clients: &[(Uuid, &str)]) -> ServerMessage {
        ServerMessage::AddClient {
            clients: clients
                .iter()
                .map(|(client_id, name)| ClientInfo {
                    client_id: *client_id,
                    name: (*name).into(),
                })
                .collect(),
        }
    }

    // ── cursor updates ───────────────────────────────────────────────

    #[test]
    fn test_cursor_update_inserts_and_moves() {
        let mut reg = CursorRegistry::new();
        let id = Uuid::new_v4();

        assert!(reg.handle_message(&cursor_update(id, "Alice", 2, 5)));
        let cursor = reg.cursor(&id).unwrap();
        assert_eq!(cursor.name, "Alice");
        assert_eq!((cursor.ln, cursor.pos), (2, 5));

        assert!(reg.handle_message(&cursor_update(id, "Alice", 7, 0)));
        assert_eq!(reg.len(), 1);
        let cursor = reg.cursor(&id).unwrap();
        assert_eq!((cursor.ln, cursor.pos), (7, 0));
    }

    #[test]
    fn test_wire_coordinates_are_zero_based() {
        let mut reg = CursorRegistry::new();
        let id = Uuid::new_v4();
        reg.handle_message(&cursor_update(id, "Alice", 0, 0));
        assert_eq!(reg.cursor(&id).unwrap().position(), Position::new(1, 1));
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let mut reg = CursorRegistry::new();
        let me = Uuid::new_v4();
        reg.set_local_client(me);
        assert!(!reg.handle_message(&cursor_update(me, "Me", 1, 1)));
        assert!(reg.is_empty());
    }

    // ── typing indicator ─────────────────────────────────────────────

    #[test]
    fn test_typing_toggles_known_participants_only() {
        let mut reg = CursorRegistry::new();
        let id = Uuid::new_v4();

        // Nobody by that id yet.
        assert!(!reg.handle_message(&ServerMessage::TypingIndicator {
            client_id: id,
            typing: true,
        }));

        reg.handle_message(&cursor_update(id, "Alice", 0, 0));
        assert!(reg.handle_message(&ServerMessage::TypingIndicator {
            client_id: id,
            typing: true,
        }));
        assert!(reg.cursor(&id).unwrap().typing);

        // Repeats of the same state are not a visible change.
        assert!(!reg.handle_message(&ServerMessage::TypingIndicator {
            client_id: id,
            typing: true,
        }));
    }

    // ── roster ───────────────────────────────────────────────────────

    #[test]
    fn test_roster_assigns_palette_slots_in_order() {
        let mut reg = CursorRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(reg.handle_message(&roster(&[(a, "Alice"), (b, "Bob")])));

        assert_eq!(reg.cursor(&a).unwrap().color_index, 0);
        assert_eq!(reg.cursor(&b).unwrap().color_index, 1);
        assert_eq!(reg.cursor(&a).unwrap().color(), CURSOR_PALETTE[0]);

        let names: Vec<&str> = reg.cursors().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Alice", "Bob"]);
    }

    #[test]
    fn test_reannounced_roster_keeps_slots() {
        let mut reg = CursorRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.handle_message(&roster(&[(a, "Alice")]));
        reg.handle_message(&roster(&[(b, "Bob"), (a, "Alice")]));
        assert_eq!(reg.cursor(&a).unwrap().color_index, 0);
        assert_eq!(reg.cursor(&b).unwrap().color_index, 1);
    }

    #[test]
    fn test_roster_skips_local_client() {
        let mut reg = CursorRegistry::new();
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        reg.set_local_client(me);
        reg.handle_message(&roster(&[(me, "Me"), (other, "Other")]));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.cursor(&other).unwrap().color_index, 0);
    }

    #[test]
    fn test_palette_wraps_after_eleven() {
        let mut reg = CursorRegistry::new();
        for _ in 0..CURSOR_PALETTE.len() {
            reg.handle_message(&cursor_update(Uuid::new_v4(), "x", 0, 0));
        }
        let twelfth = Uuid::new_v4();
        reg.handle_message(&cursor_update(twelfth, "x", 0, 0));
        assert_eq!(reg.cursor(&twelfth).unwrap().color_index, 11);
        assert_eq!(reg.cursor(&twelfth).unwrap().color(), CURSOR_PALETTE[0]);
    }

    #[test]
    fn test_remove_drops_participants() {
        let mut reg = CursorRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.handle_message(&roster(&[(a, "Alice"), (b, "Bob")]));
        assert!(reg.handle_message(&ServerMessage::RemoveClient {
            clients: vec![ClientInfo {
                client_id: a,
                name: "Alice".into(),
            }],
        }));
        assert_eq!(reg.len(), 1);
        assert!(reg.cursor(&a).is_none());

        // Removing someone unknown is not a change.
        assert!(!reg.handle_message(&ServerMessage::RemoveClient {
            clients: vec![ClientInfo {
                client_id: a,
                name: "Alice".into(),
            }],
        }));
    }

    #[test]
    fn test_text_messages_do_not_touch_presence() {
        let mut reg = CursorRegistry::new();
        assert!(!reg.handle_message(&ServerMessage::TextAccepted { count: 3 }));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_clear_restarts_the_palette() {
        let mut reg = CursorRegistry::new();
        reg.handle_message(&cursor_update(Uuid::new_v4(), "Alice", 0, 0));
        reg.clear();
        assert!(reg.is_empty());
        let fresh = Uuid::new_v4();
        reg.handle_message(&cursor_update(fresh, "Bob", 0, 0));
        assert_eq!(reg.cursor(&fresh).unwrap().color_index, 0);
    }
}
