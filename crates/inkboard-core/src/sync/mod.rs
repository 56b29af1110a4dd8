//! Transport between a replication engine and the relay.
//!
//! Channels never call back into the engine. They queue what they receive and
//! the host drains the queue with [`SyncChannel::poll`] from its event loop, so
//! session mutation stays on one thread.

mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod native;
pub mod protocol;

pub use memory::{MemoryChannel, MemoryHub};
#[cfg(not(target_arch = "wasm32"))]
pub use native::NativeWebSocket;
pub use protocol::{BoardEvent, ClientMessage, RELAY_AUTHOR, RoomOptions, ServerMessage};

use thiserror::Error;

use crate::operation::AuthorId;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// An event received from another participant (or the relay).
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub from: AuthorId,
    /// Relay sequence number. Only durable events are sequenced.
    pub seq: Option<u64>,
    pub event: BoardEvent,
}

/// Events produced by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Transport connected
    Connected,
    /// Transport closed
    Disconnected,
    /// Joined a room; `seq` is the last sequence number assigned there.
    Joined {
        room: String,
        peer_count: usize,
        seq: u64,
        is_host: bool,
        waiting_for_approval: bool,
        options: RoomOptions,
    },
    PeerJoined { author: AuthorId },
    PeerLeft { author: AuthorId },
    JoinRequested { author: AuthorId },
    Approved,
    Kicked,
    Delivered(Delivery),
    /// One of our durable events was assigned `seq`. `client_seq` is the
    /// number we published it under.
    Ack { seq: u64, client_seq: Option<u64> },
    Error { message: String },
}

impl From<ServerMessage> for ChannelEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Joined {
                room,
                peer_count,
                seq,
                is_host,
                waiting_for_approval,
                options,
            } => Self::Joined {
                room,
                peer_count,
                seq,
                is_host,
                waiting_for_approval,
                options,
            },
            ServerMessage::PeerJoined { author } => Self::PeerJoined { author },
            ServerMessage::PeerLeft { author } => Self::PeerLeft { author },
            ServerMessage::JoinRequested { author } => Self::JoinRequested { author },
            ServerMessage::Approved => Self::Approved,
            ServerMessage::Kicked => Self::Kicked,
            ServerMessage::Event { from, seq, event } => Self::Delivered(Delivery { from, seq, event }),
            ServerMessage::Ack { seq, client_seq } => Self::Ack { seq, client_seq },
            ServerMessage::Error { message } => Self::Error { message },
        }
    }
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

/// How a channel enters its room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Entry {
    /// Join, creating the room with default options if it does not exist.
    #[default]
    Join,
    /// Create the room as its host. Fails if it already exists.
    Create(RoomOptions),
}

impl Entry {
    /// The first message sent on a new connection.
    pub fn hello(self, room: &str, author: &str) -> ClientMessage {
        let (room, author) = (room.to_string(), author.to_string());
        match self {
            Self::Join => ClientMessage::Join { room, author },
            Self::Create(options) => ClientMessage::Create { room, author, options },
        }
    }
}

/// A connection to one room.
pub trait SyncChannel {
    /// Connect and enter `room` as `author`.
    fn connect(&mut self, room: &str, author: &str, entry: Entry) -> Result<(), ChannelError>;

    /// Leave the room and close the connection.
    fn disconnect(&mut self);

    /// Send a message to the relay: publishes and host requests.
    fn send(&mut self, message: &ClientMessage) -> Result<(), ChannelError>;

    /// Drain everything received since the last poll, in arrival order.
    fn poll(&mut self) -> Vec<ChannelEvent>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}
