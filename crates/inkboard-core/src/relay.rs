//! Ordering point for one room.
//!
//! Every durable event published to a room gets the next sequence number, is
//! applied to the room's replica and is fanned out in sequence order. The
//! publisher receives an `ack` in the position where the others receive the
//! event, so all participants observe one total order. Late joiners are
//! answered with the replica's snapshot, stamped with the sequence number it
//! reflects and the last client sequence number processed for the requester.
//!
//! The room also carries host moderation: the first member is the host, joins
//! may wait for approval, drawing may be restricted to the host, and the host
//! can remove an author.

use uuid::Uuid;

use crate::operation::AuthorId;
use crate::session::Session;
use crate::sync::protocol::{BoardEvent, RELAY_AUTHOR, RoomOptions, ServerMessage};

/// Identifies one connection to a room. An author may hold several.
pub type ConnectionId = Uuid;

/// One message and the connections that receive it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub to: Vec<ConnectionId>,
    pub message: ServerMessage,
}

/// Outcome of a room operation: per-recipient messages, in delivery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routed {
    envelopes: Vec<Envelope>,
    seq: Option<u64>,
}

impl Routed {
    fn to(mut self, to: Vec<ConnectionId>, message: ServerMessage) -> Self {
        if !to.is_empty() {
            self.envelopes.push(Envelope { to, message });
        }
        self
    }

    fn reply(conn: ConnectionId, message: ServerMessage) -> Self {
        Self::default().to(vec![conn], message)
    }

    fn error(conn: ConnectionId, message: impl Into<String>) -> Self {
        Self::reply(
            conn,
            ServerMessage::Error {
                message: message.into(),
            },
        )
    }

    /// The message `conn` receives, if any.
    pub fn message_for(&self, conn: ConnectionId) -> Option<&ServerMessage> {
        self.envelopes
            .iter()
            .find(|envelope| envelope.to.contains(&conn))
            .map(|envelope| &envelope.message)
    }

    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    /// Sequence number assigned by this outcome, for durable events.
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

/// A connection registered with a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub conn: ConnectionId,
    pub author: AuthorId,
    /// False while the member waits in the lobby.
    pub approved: bool,
    /// Last client sequence number processed from this connection.
    pub last_client_seq: Option<u64>,
}

/// Relay-side state of a room.
#[derive(Debug, Clone)]
pub struct RelayRoom {
    name: String,
    replica: Session,
    seq: u64,
    options: RoomOptions,
    host: Option<AuthorId>,
    members: Vec<Member>,
}

impl RelayRoom {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replica: Session::new(),
            seq: 0,
            options: RoomOptions::default(),
            host: None,
            members: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: RoomOptions) -> Self {
        self.options = options;
        self
    }

    /// Start a room from an existing board (e.g. one loaded from storage).
    pub fn with_session(mut self, replica: Session) -> Self {
        self.replica = replica;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last assigned sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn replica(&self) -> &Session {
        &self.replica
    }

    pub fn options(&self) -> RoomOptions {
        self.options
    }

    /// Author that created the room, or the first one to join it.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Number of approved connections.
    pub fn member_count(&self) -> usize {
        self.members.iter().filter(|m| m.approved).count()
    }

    /// Authors waiting for the host's approval.
    pub fn waiting(&self) -> impl Iterator<Item = &str> {
        self.members.iter().filter(|m| !m.approved).map(|m| m.author.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn member(&self, conn: ConnectionId) -> Option<&Member> {
        self.members.iter().find(|m| m.conn == conn)
    }

    fn is_host(&self, author: &str) -> bool {
        self.host.as_deref() == Some(author)
    }

    /// Approved connections other than `conn`.
    fn audience(&self, conn: ConnectionId) -> Vec<ConnectionId> {
        self.members
            .iter()
            .filter(|m| m.approved && m.conn != conn)
            .map(|m| m.conn)
            .collect()
    }

    fn host_connections(&self) -> Vec<ConnectionId> {
        self.members
            .iter()
            .filter(|m| m.approved && self.is_host(&m.author))
            .map(|m| m.conn)
            .collect()
    }

    /// Register a connection. The first author to join becomes the host.
    pub fn join(&mut self, conn: ConnectionId, author: &str) -> Routed {
        if self.host.is_none() {
            self.host = Some(author.to_string());
        }
        let is_host = self.is_host(author);
        let approved = is_host || !self.options.require_approval;
        self.members.push(Member {
            conn,
            author: author.to_string(),
            approved,
            last_client_seq: None,
        });

        let joined = ServerMessage::Joined {
            room: self.name.clone(),
            peer_count: self.member_count(),
            seq: self.seq,
            is_host,
            waiting_for_approval: !approved,
            options: self.options,
        };
        let routed = Routed::reply(conn, joined);
        if approved {
            routed.to(
                self.audience(conn),
                ServerMessage::PeerJoined {
                    author: author.to_string(),
                },
            )
        } else {
            log::info!("{} is waiting for approval in {}", author, self.name);
            routed.to(
                self.host_connections(),
                ServerMessage::JoinRequested {
                    author: author.to_string(),
                },
            )
        }
    }

    /// Remove a connection. Returns `None` if it was not a member.
    pub fn leave(&mut self, conn: ConnectionId) -> Option<Routed> {
        let idx = self.members.iter().position(|m| m.conn == conn)?;
        let member = self.members.remove(idx);
        if !member.approved {
            return Some(Routed::default());
        }
        Some(Routed::default().to(
            self.audience(conn),
            ServerMessage::PeerLeft { author: member.author },
        ))
    }

    /// Route an event published on `conn`. Unknown connections are ignored.
    pub fn accept(&mut self, conn: ConnectionId, event: BoardEvent, client_seq: Option<u64>) -> Routed {
        let Some(idx) = self.members.iter().position(|m| m.conn == conn) else {
            return Routed::default();
        };
        if event.is_durable() && client_seq.is_some() {
            self.members[idx].last_client_seq = client_seq;
        }
        let member = &self.members[idx];
        let (from, approved, acked) = (member.author.clone(), member.approved, member.last_client_seq);

        if !approved {
            return Routed::error(conn, "waiting for the host's approval");
        }

        match event {
            BoardEvent::SnapshotRequest => {
                let mut snapshot = self.replica.snapshot();
                snapshot.seq = Some(self.seq);
                log::debug!("Answering snapshot request from {} at seq {}", from, self.seq);
                Routed::reply(
                    conn,
                    ServerMessage::Event {
                        from: RELAY_AUTHOR.to_string(),
                        seq: None,
                        event: BoardEvent::Snapshot {
                            snapshot: Box::new(snapshot),
                            acked,
                        },
                    },
                )
            }
            BoardEvent::Snapshot { .. } => {
                log::warn!("Rejecting snapshot published by {}", from);
                Routed::error(conn, "snapshots are only sent by the relay")
            }
            event if !event.is_durable() => Routed::default().to(
                self.audience(conn),
                ServerMessage::Event {
                    from,
                    seq: None,
                    event,
                },
            ),
            _ if !self.options.allow_drawing && !self.is_host(&from) => {
                log::debug!("Rejecting {} from {}: drawing is disabled", event.kind(), from);
                Routed::error(conn, "drawing is disabled by the host")
            }
            event => {
                self.seq += 1;
                if let Err(err) = self.replica.apply_event(&event) {
                    // Still sequenced: every client will ignore it the same way.
                    log::debug!("Replica ignored {} #{} from {}: {}", event.kind(), self.seq, from, err);
                }
                let mut routed = Routed::reply(
                    conn,
                    ServerMessage::Ack {
                        seq: self.seq,
                        client_seq,
                    },
                )
                .to(
                    self.audience(conn),
                    ServerMessage::Event {
                        from,
                        seq: Some(self.seq),
                        event,
                    },
                );
                routed.seq = Some(self.seq);
                routed
            }
        }
    }

    /// Let every waiting connection of `author` in. Only the host may approve.
    pub fn approve(&mut self, conn: ConnectionId, author: &str) -> Routed {
        if !self.member(conn).is_some_and(|m| m.approved && self.is_host(&m.author)) {
            return Routed::error(conn, "only the host can approve joiners");
        }
        let admitted: Vec<ConnectionId> = self
            .members
            .iter_mut()
            .filter(|m| !m.approved && m.author == author)
            .map(|m| {
                m.approved = true;
                m.conn
            })
            .collect();
        if admitted.is_empty() {
            return Routed::error(conn, format!("{author} is not waiting to join"));
        }
        log::info!("{} approved {} in {}", self.host.as_deref().unwrap_or_default(), author, self.name);

        let others = self
            .members
            .iter()
            .filter(|m| m.approved && !admitted.contains(&m.conn))
            .map(|m| m.conn)
            .collect();
        Routed::default()
            .to(admitted, ServerMessage::Approved)
            .to(
                others,
                ServerMessage::PeerJoined {
                    author: author.to_string(),
                },
            )
    }

    /// Remove every connection of `author`. Only the host may kick, and the
    /// host cannot be removed.
    pub fn kick(&mut self, conn: ConnectionId, author: &str) -> Routed {
        if !self.member(conn).is_some_and(|m| m.approved && self.is_host(&m.author)) {
            return Routed::error(conn, "only the host can remove participants");
        }
        if self.is_host(author) {
            return Routed::error(conn, "the host cannot be removed");
        }
        let (removed, kept): (Vec<Member>, Vec<Member>) =
            std::mem::take(&mut self.members).into_iter().partition(|m| m.author == author);
        self.members = kept;
        if removed.is_empty() {
            return Routed::error(conn, format!("{author} is not in the room"));
        }
        log::info!("Removed {} from {}", author, self.name);

        let was_present = removed.iter().any(|m| m.approved);
        let routed = Routed::default().to(removed.iter().map(|m| m.conn).collect(), ServerMessage::Kicked);
        if !was_present {
            return routed;
        }
        let remaining = self.members.iter().filter(|m| m.approved).map(|m| m.conn).collect();
        routed.to(
            remaining,
            ServerMessage::PeerLeft {
                author: author.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Operation, PageId, StrokeStyle, Tool};
    use kurbo::Point;

    fn append(page: u64) -> BoardEvent {
        let op = Operation::shape(
            PageId(page),
            "alice",
            Tool::Rectangle,
            Point::new(10.0, 10.0),
            Point::new(50.0, 40.0),
            StrokeStyle::default(),
        );
        BoardEvent::OpAppend { page_id: PageId(page), op }
    }

    fn conn() -> ConnectionId {
        Uuid::new_v4()
    }

    fn moderated() -> RelayRoom {
        RelayRoom::new("retro").with_options(RoomOptions {
            require_approval: true,
            allow_drawing: true,
        })
    }

    #[test]
    fn test_durable_events_are_sequenced_and_applied() {
        let mut room = RelayRoom::new("retro");
        let alice = conn();
        let routed = room.join(alice, "alice");
        assert!(matches!(
            routed.message_for(alice),
            Some(ServerMessage::Joined { seq: 0, is_host: true, .. })
        ));

        assert_eq!(room.accept(alice, append(1), Some(1)).seq(), Some(1));
        assert_eq!(room.accept(alice, BoardEvent::OpUndo { page_id: PageId(1) }, Some(2)).seq(), Some(2));
        assert_eq!(room.seq(), 2);
        assert_eq!(room.replica().active_page().len(), 1);
        assert!(room.replica().active_page().active_operations().is_empty());
    }

    #[test]
    fn test_ignored_events_still_take_a_sequence_number() {
        let mut room = RelayRoom::new("retro");
        let alice = conn();
        room.join(alice, "alice");
        let routed = room.accept(alice, BoardEvent::OpUndo { page_id: PageId(9) }, None);
        assert_eq!(routed.seq(), Some(1));
    }

    #[test]
    fn test_ephemeral_events_are_not_sequenced() {
        let mut room = RelayRoom::new("retro");
        let (alice, bob) = (conn(), conn());
        room.join(alice, "alice");
        room.join(bob, "bob");

        let routed = room.accept(alice, BoardEvent::PresenceCursor { x: 1.0, y: 1.0 }, None);
        assert_eq!(routed.seq(), None);
        assert_eq!(routed.message_for(alice), None);
        assert!(matches!(routed.message_for(bob), Some(ServerMessage::Event { seq: None, .. })));
        assert_eq!(room.seq(), 0);
    }

    #[test]
    fn test_snapshot_reply_is_stamped() {
        let mut room = RelayRoom::new("retro");
        let (alice, bob) = (conn(), conn());
        room.join(alice, "alice");
        room.join(bob, "bob");
        room.accept(alice, append(1), Some(1));
        room.accept(alice, BoardEvent::PageAdd { page_id: PageId(2) }, Some(2));

        let routed = room.accept(bob, BoardEvent::SnapshotRequest, None);
        assert_eq!(routed.message_for(alice), None);
        let Some(ServerMessage::Event { from, seq, event }) = routed.message_for(bob) else {
            panic!("expected snapshot reply");
        };
        assert_eq!(from, RELAY_AUTHOR);
        assert_eq!(*seq, None);
        let BoardEvent::Snapshot { snapshot, acked } = event else {
            panic!("expected snapshot event");
        };
        assert_eq!(*acked, None);
        assert_eq!(snapshot.seq, Some(2));
        assert_eq!(snapshot.pages.len(), 2);
        assert_eq!(snapshot.active_page_index, 1);
    }

    #[test]
    fn test_snapshot_reports_last_client_seq_of_requester() {
        let mut room = RelayRoom::new("retro");
        let (tab1, tab2) = (conn(), conn());
        room.join(tab1, "alice");
        room.join(tab2, "alice");
        room.accept(tab1, append(1), Some(1));
        room.accept(tab1, BoardEvent::OpUndo { page_id: PageId(1) }, Some(2));
        room.accept(tab2, BoardEvent::OpRedo { page_id: PageId(1) }, Some(7));

        let acked = |routed: &Routed, conn| match routed.message_for(conn) {
            Some(ServerMessage::Event {
                event: BoardEvent::Snapshot { acked, .. },
                ..
            }) => *acked,
            other => panic!("expected snapshot, got {other:?}"),
        };
        let routed = room.accept(tab1, BoardEvent::SnapshotRequest, None);
        assert_eq!(acked(&routed, tab1), Some(2));
        let routed = room.accept(tab2, BoardEvent::SnapshotRequest, None);
        assert_eq!(acked(&routed, tab2), Some(7));
    }

    #[test]
    fn test_clients_cannot_publish_snapshots() {
        let mut room = RelayRoom::new("retro");
        let mallory = conn();
        room.join(mallory, "mallory");
        let snapshot = Box::new(Session::new().snapshot());
        let routed = room.accept(mallory, BoardEvent::Snapshot { snapshot, acked: None }, None);
        assert!(matches!(routed.message_for(mallory), Some(ServerMessage::Error { .. })));
        assert_eq!(room.seq(), 0);
    }

    #[test]
    fn test_publisher_gets_ack_others_get_event() {
        let mut room = RelayRoom::new("retro");
        let (alice, bob) = (conn(), conn());
        room.join(alice, "alice");
        room.join(bob, "bob");

        let routed = room.accept(alice, BoardEvent::OpRedo { page_id: PageId(1) }, Some(3));
        assert_eq!(
            routed.message_for(alice),
            Some(&ServerMessage::Ack {
                seq: 1,
                client_seq: Some(3)
            })
        );
        assert_eq!(
            routed.message_for(bob),
            Some(&ServerMessage::Event {
                from: "alice".to_string(),
                seq: Some(1),
                event: BoardEvent::OpRedo { page_id: PageId(1) },
            })
        );
    }

    #[test]
    fn test_same_author_connections_are_distinct() {
        let mut room = RelayRoom::new("retro");
        let (tab1, tab2) = (conn(), conn());
        room.join(tab1, "alice");
        let routed = room.join(tab2, "alice");
        assert!(matches!(routed.message_for(tab1), Some(ServerMessage::PeerJoined { .. })));

        let routed = room.accept(tab1, append(1), Some(1));
        assert!(matches!(routed.message_for(tab1), Some(ServerMessage::Ack { .. })));
        assert!(matches!(
            routed.message_for(tab2),
            Some(ServerMessage::Event { seq: Some(1), .. })
        ));
    }

    #[test]
    fn test_membership() {
        let mut room = RelayRoom::new("retro");
        let (a1, a2, b) = (conn(), conn(), conn());
        room.join(a1, "alice");
        room.join(a2, "alice");
        room.join(b, "bob");
        assert_eq!(room.member_count(), 3);

        let routed = room.leave(a1).unwrap();
        assert_eq!(
            routed.message_for(b),
            Some(&ServerMessage::PeerLeft {
                author: "alice".to_string()
            })
        );
        assert!(room.leave(a1).is_none());
        assert!(room.leave(a2).is_some());
        assert!(room.leave(b).is_some());
        assert!(room.is_empty());
    }

    #[test]
    fn test_unknown_connection_is_ignored() {
        let mut room = RelayRoom::new("retro");
        let routed = room.accept(conn(), append(1), Some(1));
        assert!(routed.is_empty());
        assert_eq!(room.seq(), 0);
    }

    #[test]
    fn test_joiners_wait_for_approval() {
        let mut room = moderated();
        let (host, guest) = (conn(), conn());
        room.join(host, "alice");
        assert_eq!(room.host(), Some("alice"));

        let routed = room.join(guest, "bob");
        assert!(matches!(
            routed.message_for(guest),
            Some(ServerMessage::Joined {
                waiting_for_approval: true,
                is_host: false,
                peer_count: 1,
                ..
            })
        ));
        assert_eq!(
            routed.message_for(host),
            Some(&ServerMessage::JoinRequested {
                author: "bob".to_string()
            })
        );
        assert_eq!(room.waiting().collect::<Vec<_>>(), vec!["bob"]);

        // The lobby neither hears nor publishes room traffic.
        let routed = room.accept(host, append(1), Some(1));
        assert_eq!(routed.message_for(guest), None);
        let routed = room.accept(guest, append(1), Some(1));
        assert!(matches!(routed.message_for(guest), Some(ServerMessage::Error { .. })));
        let routed = room.accept(guest, BoardEvent::SnapshotRequest, None);
        assert!(matches!(routed.message_for(guest), Some(ServerMessage::Error { .. })));
        assert_eq!(room.seq(), 1);
    }

    #[test]
    fn test_host_approves_joiner() {
        let mut room = moderated();
        let (host, guest) = (conn(), conn());
        room.join(host, "alice");
        room.join(guest, "bob");

        let routed = room.approve(host, "bob");
        assert_eq!(routed.message_for(guest), Some(&ServerMessage::Approved));
        assert_eq!(
            routed.message_for(host),
            Some(&ServerMessage::PeerJoined {
                author: "bob".to_string()
            })
        );
        assert_eq!(room.waiting().count(), 0);
        assert_eq!(room.member_count(), 2);

        let routed = room.accept(guest, append(1), Some(1));
        assert_eq!(routed.seq(), Some(1));
    }

    #[test]
    fn test_only_host_moderates() {
        let mut room = RelayRoom::new("retro");
        let (host, bob, carol) = (conn(), conn(), conn());
        room.join(host, "alice");
        room.join(bob, "bob");
        room.join(carol, "carol");

        let routed = room.kick(bob, "carol");
        assert!(matches!(routed.message_for(bob), Some(ServerMessage::Error { .. })));
        let routed = room.approve(bob, "carol");
        assert!(matches!(routed.message_for(bob), Some(ServerMessage::Error { .. })));
        let routed = room.kick(host, "alice");
        assert!(matches!(routed.message_for(host), Some(ServerMessage::Error { .. })));
        let routed = room.approve(host, "carol");
        assert!(matches!(routed.message_for(host), Some(ServerMessage::Error { .. })));
        assert_eq!(room.member_count(), 3);
    }

    #[test]
    fn test_host_kicks_every_connection_of_author() {
        let mut room = RelayRoom::new("retro");
        let (host, b1, b2) = (conn(), conn(), conn());
        room.join(host, "alice");
        room.join(b1, "bob");
        room.join(b2, "bob");

        let routed = room.kick(host, "bob");
        assert_eq!(routed.message_for(b1), Some(&ServerMessage::Kicked));
        assert_eq!(routed.message_for(b2), Some(&ServerMessage::Kicked));
        assert_eq!(
            routed.message_for(host),
            Some(&ServerMessage::PeerLeft {
                author: "bob".to_string()
            })
        );
        assert_eq!(room.member_count(), 1);

        // Kicked connections are no longer members.
        assert!(room.accept(b1, append(1), Some(1)).is_empty());
        let routed = room.kick(host, "bob");
        assert!(matches!(routed.message_for(host), Some(ServerMessage::Error { .. })));
    }

    #[test]
    fn test_read_only_room_rejects_guest_edits() {
        let mut room = RelayRoom::new("retro").with_options(RoomOptions {
            require_approval: false,
            allow_drawing: false,
        });
        let (host, guest) = (conn(), conn());
        room.join(host, "alice");
        room.join(guest, "bob");

        let routed = room.accept(guest, append(1), Some(1));
        assert!(matches!(routed.message_for(guest), Some(ServerMessage::Error { .. })));
        assert_eq!(routed.message_for(host), None);
        assert_eq!(room.seq(), 0);

        // Ephemeral traffic still flows, and the rejected event counts as processed.
        let routed = room.accept(guest, BoardEvent::PresenceCursor { x: 1.0, y: 2.0 }, None);
        assert!(routed.message_for(host).is_some());
        let routed = room.accept(guest, BoardEvent::SnapshotRequest, None);
        assert!(matches!(
            routed.message_for(guest),
            Some(ServerMessage::Event {
                event: BoardEvent::Snapshot { acked: Some(1), .. },
                ..
            })
        ));

        assert_eq!(room.accept(host, append(1), Some(1)).seq(), Some(1));
    }
}
