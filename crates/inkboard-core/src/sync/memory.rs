//! In-process relay for tests and single-process hosts.
//!
//! A [`MemoryHub`] plays the role of the relay server: it owns one
//! [`RelayRoom`] per room and routes events between the [`MemoryChannel`]s
//! connected to it, with the same sequencing, ack and moderation rules as the
//! WebSocket relay.
//!
//! A hub built with [`MemoryHub::with_capacity`] bounds each connection's
//! queue. A connection that falls behind loses the overflow and is told so
//! with an error on its next poll, like a lagged broadcast receiver.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, SyncSender, TrySendError, channel, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::{ChannelError, ChannelEvent, ClientMessage, ConnectionState, Entry, SyncChannel};
use crate::relay::{ConnectionId, RelayRoom, Routed};
use crate::session::Session;

enum Outbox {
    Unbounded(Sender<ChannelEvent>),
    Bounded(SyncSender<ChannelEvent>),
}

struct Member {
    conn: ConnectionId,
    outbox: Outbox,
    missed: Arc<AtomicU64>,
}

impl Member {
    fn deliver(&self, event: ChannelEvent) {
        let full = match &self.outbox {
            Outbox::Unbounded(tx) => {
                let _ = tx.send(event);
                false
            }
            Outbox::Bounded(tx) => matches!(tx.try_send(event), Err(TrySendError::Full(_))),
        };
        if full {
            self.missed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct HubRoom {
    relay: RelayRoom,
    members: Vec<Member>,
}

impl HubRoom {
    fn route(&mut self, routed: &Routed) {
        for member in &self.members {
            if let Some(msg) = routed.message_for(member.conn) {
                member.deliver(msg.clone().into());
            }
        }
        // Kicked connections got their notice and are no longer members.
        let relay = &self.relay;
        self.members
            .retain(|member| relay.members().iter().any(|m| m.conn == member.conn));
    }
}

#[derive(Default)]
struct HubInner {
    rooms: Mutex<HashMap<String, HubRoom>>,
    capacity: Option<usize>,
}

/// Shared in-process relay. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hub whose connections queue at most `capacity` undrained events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::default(),
                capacity: Some(capacity.max(1)),
            }),
        }
    }

    /// Create a disconnected channel attached to this hub.
    pub fn channel(&self) -> MemoryChannel {
        MemoryChannel::new(self.clone())
    }

    /// Copy of a room's replica, if the room exists.
    pub fn replica(&self, room: &str) -> Option<Session> {
        self.rooms().get(room).map(|r| r.relay.replica().clone())
    }

    /// Last sequence number assigned in a room.
    pub fn seq(&self, room: &str) -> Option<u64> {
        self.rooms().get(room).map(|r| r.relay.seq())
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, HubRoom>> {
        self.inner.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbox(&self) -> (Outbox, Receiver<ChannelEvent>) {
        match self.inner.capacity {
            Some(capacity) => {
                let (tx, rx) = sync_channel(capacity);
                (Outbox::Bounded(tx), rx)
            }
            None => {
                let (tx, rx) = channel();
                (Outbox::Unbounded(tx), rx)
            }
        }
    }

    /// Open a connection. Fails when the room could not be entered; the
    /// reason is already queued on the refused connection.
    fn open(&self, room_id: &str, author: &str, entry: Entry) -> Result<Connection, Connection> {
        let (outbox, rx) = self.outbox();
        let member = Member {
            conn: Uuid::new_v4(),
            outbox,
            missed: Arc::default(),
        };
        let connection = Connection {
            conn: member.conn,
            room: room_id.to_string(),
            rx,
            missed: member.missed.clone(),
        };
        member.deliver(ChannelEvent::Connected);

        let mut rooms = self.rooms();
        let room = match (rooms.entry(room_id.to_string()), entry) {
            (MapEntry::Occupied(_), Entry::Create(_)) => {
                member.deliver(ChannelEvent::Error {
                    message: format!("room {room_id} already exists"),
                });
                return Err(connection);
            }
            (MapEntry::Occupied(occupied), Entry::Join) => occupied.into_mut(),
            (MapEntry::Vacant(vacant), entry) => {
                let options = match entry {
                    Entry::Create(options) => options,
                    Entry::Join => Default::default(),
                };
                vacant.insert(HubRoom {
                    relay: RelayRoom::new(room_id).with_options(options),
                    members: Vec::new(),
                })
            }
        };

        let conn = member.conn;
        room.members.push(member);
        let routed = room.relay.join(conn, author);
        room.route(&routed);
        log::info!("{} joined memory room {}", author, room_id);
        Ok(connection)
    }

    fn leave(&self, room_id: &str, conn: ConnectionId) {
        let mut rooms = self.rooms();
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        room.members.retain(|m| m.conn != conn);
        if let Some(routed) = room.relay.leave(conn) {
            room.route(&routed);
        }
        if room.relay.is_empty() {
            rooms.remove(room_id);
        }
    }

    fn handle(&self, room_id: &str, conn: ConnectionId, message: &ClientMessage) -> Result<(), ChannelError> {
        let mut rooms = self.rooms();
        let room = rooms.get_mut(room_id).ok_or(ChannelError::NotConnected)?;
        if !room.members.iter().any(|m| m.conn == conn) {
            return Err(ChannelError::NotConnected);
        }
        let routed = match message {
            ClientMessage::Publish { event, client_seq } => room.relay.accept(conn, event.clone(), *client_seq),
            ClientMessage::Approve { author } => room.relay.approve(conn, author),
            ClientMessage::Kick { author } => room.relay.kick(conn, author),
            ClientMessage::Create { .. } | ClientMessage::Join { .. } => return Err(ChannelError::AlreadyConnected),
            ClientMessage::Leave => return Err(ChannelError::Send("leave with disconnect()".to_string())),
        };
        room.route(&routed);
        Ok(())
    }
}

struct Connection {
    conn: ConnectionId,
    room: String,
    rx: Receiver<ChannelEvent>,
    missed: Arc<AtomicU64>,
}

impl Connection {
    fn drain(&self, events: &mut Vec<ChannelEvent>) {
        events.extend(self.rx.try_iter());
        let missed = self.missed.swap(0, Ordering::Relaxed);
        if missed > 0 {
            events.push(ChannelEvent::Error {
                message: format!("missed {missed} room messages"),
            });
        }
    }
}

/// A [`SyncChannel`] connected to a [`MemoryHub`].
pub struct MemoryChannel {
    hub: MemoryHub,
    connection: Option<Connection>,
    /// Connection whose room refused us; kept until its queue is drained.
    refused: Option<Connection>,
    state: ConnectionState,
    events: Vec<ChannelEvent>,
}

impl MemoryChannel {
    pub fn new(hub: MemoryHub) -> Self {
        Self {
            hub,
            connection: None,
            refused: None,
            state: ConnectionState::Disconnected,
            events: Vec::new(),
        }
    }

    /// Room this channel is joined to.
    pub fn room(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.room.as_str())
    }
}

impl SyncChannel for MemoryChannel {
    fn connect(&mut self, room: &str, author: &str, entry: Entry) -> Result<(), ChannelError> {
        if self.connection.is_some() {
            return Err(ChannelError::AlreadyConnected);
        }
        match self.hub.open(room, author, entry) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state = ConnectionState::Connected;
            }
            Err(connection) => {
                self.refused = Some(connection);
                self.state = ConnectionState::Error;
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.drain(&mut self.events);
            self.hub.leave(&connection.room, connection.conn);
            self.events.push(ChannelEvent::Disconnected);
        }
        self.state = ConnectionState::Disconnected;
    }

    fn send(&mut self, message: &ClientMessage) -> Result<(), ChannelError> {
        let connection = self.connection.as_ref().ok_or(ChannelError::NotConnected)?;
        self.hub.handle(&connection.room, connection.conn, message)
    }

    fn poll(&mut self) -> Vec<ChannelEvent> {
        if let Some(refused) = self.refused.take() {
            refused.drain(&mut self.events);
        }
        if let Some(connection) = &self.connection {
            connection.drain(&mut self.events);
        }
        std::mem::take(&mut self.events)
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::PageId;
    use crate::sync::{BoardEvent, Delivery, RoomOptions};

    fn publish(channel: &mut MemoryChannel, event: BoardEvent, client_seq: Option<u64>) {
        channel.send(&ClientMessage::Publish { event, client_seq }).unwrap();
    }

    #[test]
    fn test_join_reports_room_state() {
        let hub = MemoryHub::new();
        let mut alice = hub.channel();
        alice.connect("room", "alice", Entry::Join).unwrap();

        assert_eq!(
            alice.poll(),
            vec![
                ChannelEvent::Connected,
                ChannelEvent::Joined {
                    room: "room".to_string(),
                    peer_count: 1,
                    seq: 0,
                    is_host: true,
                    waiting_for_approval: false,
                    options: RoomOptions::default(),
                }
            ]
        );
        assert!(alice.is_connected());
        assert_eq!(alice.connect("room", "alice", Entry::Join), Err(ChannelError::AlreadyConnected));
    }

    #[test]
    fn test_publish_fans_out_with_ack() {
        let hub = MemoryHub::new();
        let mut alice = hub.channel();
        let mut bob = hub.channel();
        alice.connect("room", "alice", Entry::Join).unwrap();
        bob.connect("room", "bob", Entry::Join).unwrap();
        alice.poll();
        bob.poll();

        publish(&mut alice, BoardEvent::PageAdd { page_id: PageId(2) }, Some(1));

        assert_eq!(
            alice.poll(),
            vec![ChannelEvent::Ack {
                seq: 1,
                client_seq: Some(1)
            }]
        );
        assert_eq!(
            bob.poll(),
            vec![ChannelEvent::Delivered(Delivery {
                from: "alice".to_string(),
                seq: Some(1),
                event: BoardEvent::PageAdd { page_id: PageId(2) },
            })]
        );
        assert_eq!(hub.replica("room").unwrap().page_count(), 2);
    }

    #[test]
    fn test_peer_presence_events() {
        let hub = MemoryHub::new();
        let mut alice = hub.channel();
        alice.connect("room", "alice", Entry::Join).unwrap();
        alice.poll();

        let mut bob = hub.channel();
        bob.connect("room", "bob", Entry::Join).unwrap();
        assert_eq!(alice.poll(), vec![ChannelEvent::PeerJoined { author: "bob".to_string() }]);

        bob.disconnect();
        assert_eq!(alice.poll(), vec![ChannelEvent::PeerLeft { author: "bob".to_string() }]);
        assert!(bob.poll().contains(&ChannelEvent::Disconnected));
    }

    #[test]
    fn test_empty_room_is_dropped() {
        let hub = MemoryHub::new();
        let mut alice = hub.channel();
        alice.connect("room", "alice", Entry::Join).unwrap();
        publish(&mut alice, BoardEvent::PageAdd { page_id: PageId(2) }, Some(1));
        assert_eq!(hub.seq("room"), Some(1));

        alice.disconnect();
        assert_eq!(hub.seq("room"), None);
    }

    #[test]
    fn test_send_without_connection() {
        let hub = MemoryHub::new();
        let mut channel = hub.channel();
        let message = ClientMessage::Publish {
            event: BoardEvent::SnapshotRequest,
            client_seq: None,
        };
        assert_eq!(channel.send(&message), Err(ChannelError::NotConnected));
    }

    #[test]
    fn test_create_existing_room_is_refused() {
        let hub = MemoryHub::new();
        let mut alice = hub.channel();
        alice.connect("room", "alice", Entry::Create(RoomOptions::default())).unwrap();

        let mut bob = hub.channel();
        bob.connect("room", "bob", Entry::Create(RoomOptions::default())).unwrap();
        let events = bob.poll();
        assert!(matches!(events.last(), Some(ChannelEvent::Error { .. })));
        assert!(bob.room().is_none());
        assert_eq!(bob.state(), ConnectionState::Error);
        alice.poll();
        assert!(alice.poll().is_empty(), "alice hears nothing of the refused join");
    }

    #[test]
    fn test_kicked_connection_is_detached() {
        let hub = MemoryHub::new();
        let mut alice = hub.channel();
        let mut bob = hub.channel();
        alice.connect("room", "alice", Entry::Join).unwrap();
        bob.connect("room", "bob", Entry::Join).unwrap();
        alice.poll();
        bob.poll();

        alice.send(&ClientMessage::Kick { author: "bob".to_string() }).unwrap();
        assert_eq!(bob.poll(), vec![ChannelEvent::Kicked]);
        assert_eq!(alice.poll(), vec![ChannelEvent::PeerLeft { author: "bob".to_string() }]);

        let message = ClientMessage::Publish {
            event: BoardEvent::PageAdd { page_id: PageId(2) },
            client_seq: Some(1),
        };
        assert_eq!(bob.send(&message), Err(ChannelError::NotConnected));
        assert_eq!(hub.seq("room"), Some(0));
    }

    #[test]
    fn test_overflow_reports_missed_messages() {
        let hub = MemoryHub::with_capacity(3);
        let mut alice = hub.channel();
        let mut bob = hub.channel();
        alice.connect("room", "alice", Entry::Join).unwrap();
        alice.poll();
        bob.connect("room", "bob", Entry::Join).unwrap();
        bob.poll();
        alice.poll();

        for seq in 1..=5 {
            publish(&mut alice, BoardEvent::PageAdd { page_id: PageId(seq + 1) }, Some(seq));
            assert_eq!(alice.poll().len(), 1, "the publisher keeps up");
        }

        let events = bob.poll();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ChannelEvent::Delivered(Delivery { seq: Some(1), .. })));
        assert_eq!(
            events[3],
            ChannelEvent::Error {
                message: "missed 2 room messages".to_string()
            }
        );
        assert!(bob.poll().is_empty());
    }
}
