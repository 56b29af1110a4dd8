//! Board events and the JSON envelopes exchanged with the relay.

use kurbo::Point;
use serde::{Deserialize, Serialize};

use crate::operation::{AuthorId, Operation, PageId, StrokeStyle, Tool};
use crate::overlay::OverlayElement;
use crate::snapshot::SessionSnapshot;

/// A replicated board event.
///
/// Durable events change a session and are sequenced by the relay. Previews
/// and cursor positions are ephemeral: they are relayed as-is and never touch
/// a page log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum BoardEvent {
    #[serde(rename = "op.append")]
    OpAppend { page_id: PageId, op: Operation },
    #[serde(rename = "op.undo")]
    OpUndo { page_id: PageId },
    #[serde(rename = "op.redo")]
    OpRedo { page_id: PageId },
    /// Clears a page. Carries the marker operation when the publisher clears
    /// with markers, so every replica appends the same operation.
    #[serde(rename = "page.clear")]
    PageClear {
        page_id: PageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        marker: Option<Operation>,
    },
    #[serde(rename = "page.add")]
    PageAdd { page_id: PageId },
    #[serde(rename = "page.switch")]
    PageSwitch { page_index: usize },
    #[serde(rename = "page.delete")]
    PageDelete { page_index: usize },
    #[serde(rename = "overlay.add")]
    OverlayAdd { page_id: PageId, element: OverlayElement },
    #[serde(rename = "overlay.move")]
    OverlayMove { page_id: PageId, element: OverlayElement },
    #[serde(rename = "overlay.update")]
    OverlayUpdate { page_id: PageId, element: OverlayElement },
    #[serde(rename = "overlay.remove")]
    OverlayRemove { page_id: PageId, element: OverlayElement },
    #[serde(rename = "session.snapshot.request")]
    SnapshotRequest,
    /// Relay state for one connection. `acked` is the last client sequence
    /// number the relay processed from that connection.
    #[serde(rename = "session.snapshot")]
    Snapshot {
        snapshot: Box<SessionSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acked: Option<u64>,
    },
    /// In-progress stroke. An empty point list withdraws the preview.
    #[serde(rename = "stroke.preview")]
    StrokePreview {
        page_id: PageId,
        tool: Tool,
        style: StrokeStyle,
        points: Vec<Point>,
    },
    #[serde(rename = "presence.cursor")]
    PresenceCursor { x: f64, y: f64 },
}

impl BoardEvent {
    /// Whether the event mutates a session and must be applied in relay order.
    pub fn is_durable(&self) -> bool {
        !matches!(
            self,
            Self::SnapshotRequest
                | Self::Snapshot { .. }
                | Self::StrokePreview { .. }
                | Self::PresenceCursor { .. }
        )
    }

    /// Logical event name, as used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OpAppend { .. } => "op.append",
            Self::OpUndo { .. } => "op.undo",
            Self::OpRedo { .. } => "op.redo",
            Self::PageClear { .. } => "page.clear",
            Self::PageAdd { .. } => "page.add",
            Self::PageSwitch { .. } => "page.switch",
            Self::PageDelete { .. } => "page.delete",
            Self::OverlayAdd { .. } => "overlay.add",
            Self::OverlayMove { .. } => "overlay.move",
            Self::OverlayUpdate { .. } => "overlay.update",
            Self::OverlayRemove { .. } => "overlay.remove",
            Self::SnapshotRequest => "session.snapshot.request",
            Self::Snapshot { .. } => "session.snapshot",
            Self::StrokePreview { .. } => "stroke.preview",
            Self::PresenceCursor { .. } => "presence.cursor",
        }
    }
}

/// Host-controlled room settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomOptions {
    /// Joiners wait in a lobby until the host approves them.
    pub require_approval: bool,
    /// When false, only the host may publish durable events.
    pub allow_drawing: bool,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            require_approval: false,
            allow_drawing: true,
        }
    }
}

/// Messages sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Create a room and become its host. Fails if the room exists.
    Create {
        room: String,
        author: AuthorId,
        #[serde(default)]
        options: RoomOptions,
    },
    /// Join a room as `author`. A missing room is created with default options.
    Join { room: String, author: AuthorId },
    /// Leave the current room.
    Leave,
    /// Publish an event to the room. Durable events carry a per-connection
    /// client sequence number that the relay echoes back in acks and snapshots.
    Publish {
        event: BoardEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_seq: Option<u64>,
    },
    /// Host only: let a waiting author in.
    Approve { author: AuthorId },
    /// Host only: remove every connection of an author.
    Kick { author: AuthorId },
}

/// Messages received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Room joined. `seq` is the last sequence number assigned in the room.
    Joined {
        room: String,
        peer_count: usize,
        seq: u64,
        #[serde(default)]
        is_host: bool,
        #[serde(default)]
        waiting_for_approval: bool,
        #[serde(default)]
        options: RoomOptions,
    },
    PeerJoined { author: AuthorId },
    PeerLeft { author: AuthorId },
    /// Sent to the host when an author waits in the lobby.
    JoinRequested { author: AuthorId },
    /// The host let us in.
    Approved,
    /// The host removed us from the room.
    Kicked,
    /// An event from another participant. Durable events carry their sequence number.
    Event {
        from: AuthorId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        event: BoardEvent,
    },
    /// One of our own durable events was sequenced.
    Ack {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_seq: Option<u64>,
    },
    Error { message: String },
}

/// Author name the relay uses for messages it originates (snapshot replies).
pub const RELAY_AUTHOR: &str = "relay";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    #[test]
    fn test_event_names_on_the_wire() {
        let op = Operation::clear_marker(PageId(1), "alice");
        let cases = [
            (BoardEvent::OpAppend { page_id: PageId(1), op }, "op.append"),
            (BoardEvent::OpUndo { page_id: PageId(1) }, "op.undo"),
            (BoardEvent::PageSwitch { page_index: 2 }, "page.switch"),
            (BoardEvent::SnapshotRequest, "session.snapshot.request"),
            (BoardEvent::PresenceCursor { x: 1.0, y: 2.0 }, "presence.cursor"),
        ];
        for (event, name) in cases {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], name);
            assert_eq!(event.kind(), name);
        }
    }

    #[test]
    fn test_payload_fields_are_camel_case() {
        let json = serde_json::to_value(BoardEvent::OpRedo { page_id: PageId(3) }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "op.redo", "pageId": 3 }));

        let json = serde_json::to_value(BoardEvent::PageDelete { page_index: 1 }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "page.delete", "pageIndex": 1 }));
    }

    #[test]
    fn test_parse_snapshot_request() {
        let event: BoardEvent = serde_json::from_str(r#"{"type":"session.snapshot.request"}"#).unwrap();
        assert_eq!(event, BoardEvent::SnapshotRequest);
    }

    #[test]
    fn test_unknown_event_kind_is_rejected() {
        let result = serde_json::from_str::<BoardEvent>(r#"{"type":"op.explode","pageId":1}"#);
        assert!(result.is_err());
        let result = serde_json::from_str::<BoardEvent>(r#"{"type":"op.undo"}"#);
        assert!(result.is_err(), "missing pageId");
    }

    #[test]
    fn test_durability() {
        assert!(BoardEvent::OpUndo { page_id: PageId(1) }.is_durable());
        assert!(BoardEvent::PageAdd { page_id: PageId(2) }.is_durable());
        assert!(!BoardEvent::SnapshotRequest.is_durable());
        assert!(!BoardEvent::PresenceCursor { x: 0.0, y: 0.0 }.is_durable());
        let snapshot = Box::new(Session::new().snapshot());
        assert!(!BoardEvent::Snapshot { snapshot, acked: None }.is_durable());
    }

    #[test]
    fn test_client_message_format() {
        let msg = ClientMessage::Join {
            room: "standup".to_string(),
            author: "alice".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"join","room":"standup","author":"alice"}"#);

        let msg = ClientMessage::Publish {
            event: BoardEvent::OpUndo { page_id: PageId(1) },
            client_seq: Some(3),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "publish");
        assert_eq!(json["event"]["type"], "op.undo");
        assert_eq!(json["clientSeq"], 3);

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"publish","event":{"type":"presence.cursor","x":1,"y":2}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Publish { client_seq: None, .. }));
    }

    #[test]
    fn test_server_message_format() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"joined","room":"r","peerCount":2,"seq":7}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Joined {
                room: "r".to_string(),
                peer_count: 2,
                seq: 7,
                is_host: false,
                waiting_for_approval: false,
                options: RoomOptions::default(),
            }
        );

        let msg = ServerMessage::Event {
            from: "bob".to_string(),
            seq: None,
            event: BoardEvent::PresenceCursor { x: 3.0, y: 4.0 },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("seq").is_none());
        assert_eq!(json["event"]["x"], 3.0);
    }

    #[test]
    fn test_moderation_messages() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"create","room":"r","author":"alice","options":{"requireApproval":true}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Create {
                room: "r".to_string(),
                author: "alice".to_string(),
                options: RoomOptions {
                    require_approval: true,
                    allow_drawing: true,
                },
            }
        );

        let json = serde_json::to_string(&ClientMessage::Kick { author: "bob".to_string() }).unwrap();
        assert_eq!(json, r#"{"type":"kick","author":"bob"}"#);

        let json = serde_json::to_value(ServerMessage::Ack { seq: 4, client_seq: Some(2) }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "ack", "seq": 4, "clientSeq": 2 }));
        let json = serde_json::to_string(&ServerMessage::Approved).unwrap();
        assert_eq!(json, r#"{"type":"approved"}"#);
    }
}
