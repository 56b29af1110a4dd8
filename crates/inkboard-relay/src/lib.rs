//! Inkboard WebSocket Relay
//!
//! Hosts one [`RelayRoom`] per room and is the single ordering point for
//! every board event published there.
//!
//! ## Protocol
//!
//! JSON text frames:
//! ```json
//! { "type": "create", "room": "retro", "author": "alice", "options": { "requireApproval": true } }
//! { "type": "join", "room": "retro", "author": "bob" }
//! { "type": "publish", "event": { "type": "op.undo", "pageId": 1 }, "clientSeq": 4 }
//! { "type": "approve", "author": "bob" }
//! { "type": "kick", "author": "bob" }
//! { "type": "leave" }
//! ```
//! The relay answers with `joined`, `event`, `ack`, `peer_joined`,
//! `peer_left`, `join_requested`, `approved`, `kicked` and `error` messages.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use dashmap::{DashMap, mapref::entry::Entry as RoomEntry};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use inkboard_core::relay::{ConnectionId, RelayRoom, Routed};
use inkboard_core::snapshot::BoardExport;
use inkboard_core::sync::{ClientMessage, Entry, ServerMessage};
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 3030;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Relay settings, from flags or environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "inkboard-relay", version, about = "WebSocket relay for shared Inkboard sessions")]
pub struct RelayConfig {
    /// Address to listen on
    #[arg(long, env = "INKBOARD_BIND", default_value = "0.0.0.0:3030")]
    pub bind: SocketAddr,

    /// Per-room broadcast buffer; receivers further behind than this lag
    #[arg(long, env = "INKBOARD_CHANNEL_CAPACITY", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Room outcomes are broadcast whole; each connection picks its own message.
type RoomFeed = broadcast::Receiver<Arc<Routed>>;

struct Room {
    relay: RelayRoom,
    tx: broadcast::Sender<Arc<Routed>>,
}

impl Room {
    fn new(relay: RelayRoom, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { relay, tx }
    }

    fn send(&self, routed: Routed) {
        if routed.is_empty() {
            return;
        }
        // No receivers is fine: the room keeps sequencing.
        let _ = self.tx.send(Arc::new(routed));
    }
}

/// Shared relay state.
pub struct AppState {
    rooms: DashMap<String, Room>,
    channel_capacity: usize,
}

impl AppState {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Last sequence number assigned in a room.
    pub fn room_seq(&self, room_id: &str) -> Option<u64> {
        self.rooms.get(room_id).map(|room| room.relay.seq())
    }

    /// The room's replica in export form.
    pub fn export(&self, room_id: &str) -> Option<BoardExport> {
        self.rooms.get(room_id).map(|room| room.relay.replica().export())
    }

    /// Authors waiting in a room's lobby.
    pub fn waiting(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|room| room.relay.waiting().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Enter a room. Subscribes under the room lock, before the join is
    /// routed, so the `joined` reply is the first thing the feed yields and
    /// its `seq` is exactly the last one the connection will not see.
    fn enter_room(&self, room_id: &str, conn: ConnectionId, author: &str, entry: Entry) -> Result<RoomFeed, ServerMessage> {
        let mut room = match (self.rooms.entry(room_id.to_string()), entry) {
            (RoomEntry::Occupied(_), Entry::Create(_)) => {
                return Err(ServerMessage::Error {
                    message: format!("room {room_id} already exists"),
                });
            }
            (RoomEntry::Occupied(occupied), Entry::Join) => occupied.into_ref(),
            (RoomEntry::Vacant(vacant), entry) => {
                let options = match entry {
                    Entry::Create(options) => options,
                    Entry::Join => Default::default(),
                };
                info!("Room {} opened ({:?})", room_id, options);
                vacant.insert(Room::new(
                    RelayRoom::new(room_id).with_options(options),
                    self.channel_capacity,
                ))
            }
        };
        let rx = room.tx.subscribe();
        let routed = room.relay.join(conn, author);
        room.send(routed);
        Ok(rx)
    }

    fn leave_room(&self, room_id: &str, conn: ConnectionId) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            if let Some(routed) = room.relay.leave(conn) {
                room.send(routed);
            }
        }
        if self.rooms.remove_if(room_id, |_, room| room.relay.is_empty()).is_some() {
            info!("Room {} closed", room_id);
        }
    }

    /// Apply a publish or host request under the room lock, so broadcast
    /// order is sequence order. Returns false if the room is gone.
    fn handle(&self, room_id: &str, conn: ConnectionId, message: ClientMessage) -> bool {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let routed = match message {
            ClientMessage::Publish { event, client_seq } => {
                let kind = event.kind();
                let routed = room.relay.accept(conn, event, client_seq);
                if let Some(seq) = routed.seq() {
                    debug!("Room {} #{} {} from {}", room_id, seq, kind, conn);
                }
                routed
            }
            ClientMessage::Approve { author } => room.relay.approve(conn, &author),
            ClientMessage::Kick { author } => room.relay.kick(conn, &author),
            ClientMessage::Create { .. } | ClientMessage::Join { .. } | ClientMessage::Leave => return true,
        };
        room.send(routed);
        true
    }
}

/// What a connection does with one item of its room feed.
#[derive(Debug, PartialEq)]
enum Forward {
    Send(ServerMessage),
    Skip,
    Closed,
}

fn forward(received: Result<Arc<Routed>, RecvError>, conn: ConnectionId) -> Forward {
    match received {
        Ok(routed) => match routed.message_for(conn) {
            Some(msg) => Forward::Send(msg.clone()),
            None => Forward::Skip,
        },
        Err(RecvError::Lagged(missed)) => {
            warn!("Connection {} lagged by {} messages", conn, missed);
            Forward::Send(ServerMessage::Error {
                message: format!("missed {missed} room messages"),
            })
        }
        Err(RecvError::Closed) => Forward::Closed,
    }
}

/// Build the relay's HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/rooms/{room}/export", get(export_room))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener.
pub async fn serve_on(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

/// Bind `config.bind` and serve until the process exits.
pub async fn serve(config: RelayConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.bind).await?;
    info!("Inkboard relay listening on {}", listener.local_addr()?);
    info!("WebSocket endpoint: ws://{}/ws", listener.local_addr()?);
    serve_on(listener, Arc::new(AppState::new(config.channel_capacity))).await
}

async fn index() -> &'static str {
    "Inkboard Relay - Connect via WebSocket at /ws"
}

async fn health() -> &'static str {
    "ok"
}

async fn export_room(Path(room): Path<String>, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.export(&room) {
        Some(export) => Ok(Json(export)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type Sender = SplitSink<WebSocket, Message>;

/// Send one message. Returns false once the socket is gone.
async fn send_message(sender: &mut Sender, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode relay message: {}", e);
            true
        }
    }
}

/// Room membership of one connection.
struct Joined {
    room: String,
    author: String,
    rx: RoomFeed,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn = Uuid::new_v4();
    info!("New connection: {}", conn);

    let (mut sender, mut receiver) = socket.split();
    let mut joined: Option<Joined> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", conn, e);
                        break;
                    }
                };
                let client_msg = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!("Invalid message from {}: {}", conn, e);
                        let err = ServerMessage::Error { message: format!("Invalid message: {e}") };
                        if !send_message(&mut sender, &err).await {
                            break;
                        }
                        continue;
                    }
                };
                let (room, author, entry) = match client_msg {
                    ClientMessage::Join { room, author } => (room, author, Entry::Join),
                    ClientMessage::Create { room, author, options } => (room, author, Entry::Create(options)),
                    ClientMessage::Leave => {
                        if let Some(old) = joined.take() {
                            state.leave_room(&old.room, conn);
                            info!("{} ({}) left room {}", old.author, conn, old.room);
                        }
                        continue;
                    }
                    request => {
                        let handled = joined.as_ref().is_some_and(|j| state.handle(&j.room, conn, request));
                        if !handled {
                            let err = ServerMessage::Error { message: "join a room first".to_string() };
                            if !send_message(&mut sender, &err).await {
                                break;
                            }
                        }
                        continue;
                    }
                };
                if let Some(old) = joined.take() {
                    state.leave_room(&old.room, conn);
                }
                match state.enter_room(&room, conn, &author, entry) {
                    Ok(rx) => {
                        info!("{} ({}) entered room {}", author, conn, room);
                        joined = Some(Joined { room, author, rx });
                    }
                    Err(err) => {
                        if !send_message(&mut sender, &err).await {
                            break;
                        }
                    }
                }
            }

            msg = async {
                match &mut joined {
                    Some(j) => j.rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match forward(msg, conn) {
                    Forward::Send(reply) => {
                        let kicked = reply == ServerMessage::Kicked;
                        if !send_message(&mut sender, &reply).await {
                            break;
                        }
                        if kicked {
                            // The room already dropped us.
                            if let Some(old) = joined.take() {
                                info!("{} ({}) was removed from room {}", old.author, conn, old.room);
                            }
                        }
                    }
                    Forward::Skip => {}
                    Forward::Closed => joined = None,
                }
            }
        }
    }

    if let Some(old) = joined {
        state.leave_room(&old.room, conn);
    }
    info!("Connection closed: {}", conn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkboard_core::operation::PageId;
    use inkboard_core::sync::{BoardEvent, RoomOptions};

    fn publish(event: BoardEvent, client_seq: Option<u64>) -> ClientMessage {
        ClientMessage::Publish { event, client_seq }
    }

    async fn next(rx: &mut RoomFeed, conn: ConnectionId) -> Forward {
        forward(rx.recv().await, conn)
    }

    #[tokio::test]
    async fn test_joined_reply_comes_first_on_the_feed() {
        let state = AppState::new(16);
        let alice = Uuid::new_v4();

        let mut rx = state.enter_room("retro", alice, "alice", Entry::Join).unwrap();
        assert!(matches!(
            next(&mut rx, alice).await,
            Forward::Send(ServerMessage::Joined { seq: 0, peer_count: 1, is_host: true, .. })
        ));
        assert!(state.handle("retro", alice, publish(BoardEvent::PageAdd { page_id: PageId(2) }, Some(1))));
        assert_eq!(
            next(&mut rx, alice).await,
            Forward::Send(ServerMessage::Ack {
                seq: 1,
                client_seq: Some(1)
            })
        );
        assert_eq!(state.room_seq("retro"), Some(1));
        assert_eq!(state.export("retro").unwrap().slides.len(), 2);
    }

    #[tokio::test]
    async fn test_join_reports_seq_and_empty_rooms_close() {
        let state = AppState::new(16);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        state.enter_room("retro", alice, "alice", Entry::Join).unwrap();
        state.handle("retro", alice, publish(BoardEvent::PageAdd { page_id: PageId(2) }, Some(1)));
        let mut rx = state.enter_room("retro", bob, "bob", Entry::Join).unwrap();
        assert!(matches!(
            next(&mut rx, bob).await,
            Forward::Send(ServerMessage::Joined { seq: 1, peer_count: 2, is_host: false, .. })
        ));

        state.leave_room("retro", alice);
        assert_eq!(state.room_count(), 1);
        state.leave_room("retro", bob);
        assert_eq!(state.room_count(), 0);
    }

    #[test]
    fn test_create_refuses_existing_room() {
        let state = AppState::new(16);
        let options = RoomOptions {
            require_approval: true,
            allow_drawing: false,
        };
        assert!(state.enter_room("retro", Uuid::new_v4(), "alice", Entry::Create(options)).is_ok());
        assert!(matches!(
            state.enter_room("retro", Uuid::new_v4(), "bob", Entry::Create(RoomOptions::default())),
            Err(ServerMessage::Error { .. })
        ));

        // A plain join lands in the lobby of the moderated room.
        state.enter_room("retro", Uuid::new_v4(), "bob", Entry::Join).unwrap();
        assert_eq!(state.waiting("retro"), vec!["bob".to_string()]);
    }

    #[test]
    fn test_requests_to_unknown_room() {
        let state = AppState::new(16);
        assert!(!state.handle("nowhere", Uuid::new_v4(), publish(BoardEvent::SnapshotRequest, None)));
    }

    #[tokio::test]
    async fn test_lagging_feed_reports_missed_messages() {
        let state = AppState::new(2);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        state.enter_room("retro", alice, "alice", Entry::Join).unwrap();
        let mut rx = state.enter_room("retro", bob, "bob", Entry::Join).unwrap();

        for seq in 1..=5 {
            let page_id = PageId(seq + 1);
            state.handle("retro", alice, publish(BoardEvent::PageAdd { page_id }, Some(seq)));
        }

        // Joined plus five events went out; bob's feed only holds the last two.
        assert_eq!(
            next(&mut rx, bob).await,
            Forward::Send(ServerMessage::Error {
                message: "missed 4 room messages".to_string()
            })
        );
        assert!(matches!(
            next(&mut rx, bob).await,
            Forward::Send(ServerMessage::Event { seq: Some(4), .. })
        ));
    }

    #[tokio::test]
    async fn test_feed_skips_messages_for_others() {
        let state = AppState::new(16);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx = state.enter_room("retro", alice, "alice", Entry::Join).unwrap();
        next(&mut rx, alice).await;
        state.enter_room("retro", bob, "bob", Entry::Join).unwrap();
        assert!(matches!(next(&mut rx, alice).await, Forward::Send(ServerMessage::PeerJoined { .. })));

        state.handle("retro", bob, publish(BoardEvent::SnapshotRequest, None));
        assert_eq!(next(&mut rx, alice).await, Forward::Skip);
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::parse_from(["inkboard-relay"]);
        assert_eq!(config.bind.port(), DEFAULT_PORT);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }
}
