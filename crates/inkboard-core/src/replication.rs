//! Replication of a session between participants.
//!
//! [`ReplicationEngine`] is the only writer of its [`Session`]. Local intents
//! are applied first and then published; remote events arrive through
//! [`ReplicationEngine::poll`] and go through the same [`Session::apply_event`]
//! rules the relay uses for its replica.
//!
//! Ordering comes from the relay: durable events carry a room sequence number
//! and our own events are confirmed with an ack in the same stream. A joining
//! engine requests a snapshot and buffers sequenced traffic until it arrives;
//! a gap in the sequence while live triggers the same resync.
//!
//! Every durable event we publish carries a client sequence number. Acks and
//! snapshots echo the last one the relay processed for this connection, so a
//! lost ack never leaves a stale entry in the pending queue.

use std::collections::{HashMap, VecDeque};

use kurbo::Point;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::{AuthorId, InvalidOperation, Operation, OperationId, PageId, StrokeStyle, Tool};
use crate::overlay::{OverlayElement, OverlayId};
use crate::page_log::{ClearPolicy, PageLog};
use crate::render::Surface;
use crate::session::{Session, SessionError};
use crate::snapshot::{SessionSnapshot, SnapshotError};
use crate::sync::{BoardEvent, ChannelError, ChannelEvent, ClientMessage, Delivery, Entry, RoomOptions, SyncChannel};

/// What an applied event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Operations or cursor of a page.
    PageChanged(PageId),
    ActivePageChanged(usize),
    /// Pages were added or removed (the active page may have moved too).
    PagesChanged,
    OverlaysChanged(PageId),
    /// A snapshot replaced the whole session.
    SessionReplaced,
    /// Remote cursors, stroke previews or room membership.
    PresenceChanged,
}

/// Why a local edit was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditError {
    #[error(transparent)]
    Invalid(#[from] InvalidOperation),
    #[error(transparent)]
    Page(#[from] SessionError),
    #[error("the host has disabled drawing")]
    ReadOnly,
}

/// Why an event was not applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("unknown page {0}")]
    UnknownPage(PageId),
    #[error(transparent)]
    Page(#[from] SessionError),
    #[error("page {0} already exists")]
    DuplicatePage(PageId),
    #[error("operation {0} already applied")]
    DuplicateOperation(OperationId),
    #[error("overlay {0} already exists")]
    DuplicateOverlay(OverlayId),
    #[error("unknown overlay {0}")]
    UnknownOverlay(OverlayId),
    #[error("nothing to {0}")]
    NothingTo(&'static str),
    #[error("sequence number {0} already seen")]
    DuplicateSequence(u64),
    #[error("expected sequence number {expected}, got {got}")]
    SnapshotRace { expected: u64, got: u64 },
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(#[from] SnapshotError),
    #[error("unexpected {0} event")]
    Unexpected(&'static str),
}

impl From<InvalidOperation> for RemoteError {
    fn from(err: InvalidOperation) -> Self {
        Self::MalformedEvent(err.to_string())
    }
}

impl Session {
    fn existing_page_mut(&mut self, id: PageId) -> Result<&mut PageLog, RemoteError> {
        self.page_mut(id).ok_or(RemoteError::UnknownPage(id))
    }

    fn check_new_operation(&self, page_id: PageId, op: &Operation) -> Result<(), RemoteError> {
        if op.page_id() != page_id {
            return Err(RemoteError::MalformedEvent(format!(
                "operation for {} sent to {}",
                op.page_id(),
                page_id
            )));
        }
        op.validate()?;
        if self.page(page_id).is_none() {
            return Err(RemoteError::UnknownPage(page_id));
        }
        if self.pages.iter().any(|p| p.contains(op.id())) {
            return Err(RemoteError::DuplicateOperation(op.id()));
        }
        Ok(())
    }

    /// Apply a durable event. Invalid events leave the session untouched.
    pub fn apply_event(&mut self, event: &BoardEvent) -> Result<Change, RemoteError> {
        match event {
            BoardEvent::OpAppend { page_id, op } => {
                self.check_new_operation(*page_id, op)?;
                self.existing_page_mut(*page_id)?.append(op.clone());
                Ok(Change::PageChanged(*page_id))
            }
            BoardEvent::OpUndo { page_id } => {
                if !self.existing_page_mut(*page_id)?.undo() {
                    return Err(RemoteError::NothingTo("undo"));
                }
                Ok(Change::PageChanged(*page_id))
            }
            BoardEvent::OpRedo { page_id } => {
                if !self.existing_page_mut(*page_id)?.redo() {
                    return Err(RemoteError::NothingTo("redo"));
                }
                Ok(Change::PageChanged(*page_id))
            }
            BoardEvent::PageClear { page_id, marker } => {
                match marker {
                    Some(marker) => {
                        if !marker.is_clear_marker() {
                            return Err(RemoteError::MalformedEvent(format!(
                                "{:?} operation used as clear marker",
                                marker.tool()
                            )));
                        }
                        self.check_new_operation(*page_id, marker)?;
                        self.existing_page_mut(*page_id)?.clear_with_marker(marker.clone());
                    }
                    None => self.existing_page_mut(*page_id)?.clear(),
                }
                self.overlays.clear_page(*page_id);
                Ok(Change::PageChanged(*page_id))
            }
            BoardEvent::PageAdd { page_id } => {
                if !self.insert_page(*page_id) {
                    return Err(RemoteError::DuplicatePage(*page_id));
                }
                Ok(Change::PagesChanged)
            }
            BoardEvent::PageSwitch { page_index } => {
                self.switch_page(*page_index)?;
                Ok(Change::ActivePageChanged(*page_index))
            }
            BoardEvent::PageDelete { page_index } => {
                self.delete_page(*page_index)?;
                Ok(Change::PagesChanged)
            }
            BoardEvent::OverlayAdd { page_id, element } => {
                if element.page_id != *page_id {
                    return Err(RemoteError::MalformedEvent(format!(
                        "overlay for {} sent to {}",
                        element.page_id, page_id
                    )));
                }
                if self.page(*page_id).is_none() {
                    return Err(RemoteError::UnknownPage(*page_id));
                }
                if !self.overlays.add(element.clone()) {
                    return Err(RemoteError::DuplicateOverlay(element.id));
                }
                Ok(Change::OverlaysChanged(*page_id))
            }
            BoardEvent::OverlayMove { page_id, element } => {
                if !self.overlays.move_to(element.id, element.position) {
                    return Err(RemoteError::UnknownOverlay(element.id));
                }
                Ok(Change::OverlaysChanged(*page_id))
            }
            BoardEvent::OverlayUpdate { page_id, element } => {
                if !self.overlays.update(element) {
                    return Err(RemoteError::UnknownOverlay(element.id));
                }
                Ok(Change::OverlaysChanged(*page_id))
            }
            BoardEvent::OverlayRemove { page_id, element } => {
                self.overlays
                    .remove(element.id)
                    .ok_or(RemoteError::UnknownOverlay(element.id))?;
                Ok(Change::OverlaysChanged(*page_id))
            }
            BoardEvent::SnapshotRequest
            | BoardEvent::Snapshot { .. }
            | BoardEvent::StrokePreview { .. }
            | BoardEvent::PresenceCursor { .. } => Err(RemoteError::Unexpected(event.kind())),
        }
    }
}

/// Replication settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// How `clear_page` treats history.
    pub clear_policy: ClearPolicy,
    /// Publish `stroke.preview` events while a stroke is drawn.
    pub publish_previews: bool,
    /// Points added between two previews.
    pub preview_interval_points: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clear_policy: ClearPolicy::Discard,
            publish_previews: true,
            preview_interval_points: 5,
        }
    }
}

/// Outcome of a remote delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStatus {
    Applied,
    /// Held until a snapshot is installed.
    Buffered,
    Ignored(RemoteError),
}

/// Render callback invoked after every applied mutation.
pub type ChangeHook = Box<dyn FnMut(&Session, &Change)>;

/// Another participant's stroke in progress. Display only.
#[derive(Debug, Clone, PartialEq)]
pub struct StrokePreview {
    pub page_id: PageId,
    pub tool: Tool,
    pub style: StrokeStyle,
    pub points: Vec<Point>,
}

/// Local stroke in progress.
#[derive(Debug, Clone)]
struct Stroke {
    page_id: PageId,
    tool: Tool,
    style: StrokeStyle,
    points: Vec<Point>,
    since_preview: usize,
    previewed: bool,
}

/// A sequenced item from the relay.
#[derive(Debug, Clone)]
enum Sequenced {
    Event { seq: u64, delivery: Delivery },
    Ack { seq: u64, client_seq: Option<u64> },
}

impl Sequenced {
    fn seq(&self) -> u64 {
        match self {
            Self::Event { seq, .. } | Self::Ack { seq, .. } => *seq,
        }
    }
}

/// Our standing in the current room.
#[derive(Debug, Clone, Default)]
struct Membership {
    is_host: bool,
    waiting: bool,
    options: RoomOptions,
    /// Authors waiting for our approval, when we host.
    requests: Vec<AuthorId>,
}

#[derive(Debug)]
enum Phase {
    /// Not in a room; sequence numbers are not tracked.
    Detached,
    /// Waiting for a snapshot; sequenced traffic is held back.
    CatchingUp { buffer: Vec<Sequenced> },
    Live { last_seq: u64 },
}

/// Owns a session and keeps it in sync over a [`SyncChannel`].
pub struct ReplicationEngine<C: SyncChannel> {
    session: Session,
    channel: C,
    author: AuthorId,
    config: EngineConfig,
    hook: Option<ChangeHook>,
    phase: Phase,
    /// Durable events we published that the relay has not processed yet,
    /// keyed by client sequence number.
    unacked: VecDeque<(u64, BoardEvent)>,
    next_client_seq: u64,
    membership: Membership,
    /// A remote event was applied on top of unacknowledged local ones, so the
    /// local order differs from the relay's.
    diverged: bool,
    stroke: Option<Stroke>,
    peers: Vec<AuthorId>,
    cursors: HashMap<AuthorId, Point>,
    previews: HashMap<AuthorId, StrokePreview>,
}

impl<C: SyncChannel> ReplicationEngine<C> {
    pub fn new(channel: C, author: impl Into<AuthorId>, config: EngineConfig) -> Self {
        Self {
            session: Session::new().with_clear_policy(config.clear_policy),
            channel,
            author: author.into(),
            config,
            hook: None,
            phase: Phase::Detached,
            unacked: VecDeque::new(),
            next_client_seq: 0,
            membership: Membership::default(),
            diverged: false,
            stroke: None,
            peers: Vec::new(),
            cursors: HashMap::new(),
            previews: HashMap::new(),
        }
    }

    /// Start from an existing session (e.g. a loaded board).
    pub fn with_session(mut self, mut session: Session) -> Self {
        session.set_clear_policy(self.config.clear_policy);
        self.session = session;
        self
    }

    pub fn set_change_hook(&mut self, hook: impl FnMut(&Session, &Change) + 'static) {
        self.hook = Some(Box::new(hook));
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the session is in sync with the relay's sequence.
    pub fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Live { .. })
    }

    pub fn is_catching_up(&self) -> bool {
        matches!(self.phase, Phase::CatchingUp { .. })
    }

    /// Last relay sequence number applied, when live.
    pub fn last_seq(&self) -> Option<u64> {
        match self.phase {
            Phase::Live { last_seq } => Some(last_seq),
            _ => None,
        }
    }

    /// Durable events published but not yet processed by the relay.
    pub fn pending_events(&self) -> usize {
        self.unacked.len()
    }

    /// Whether we host the current room.
    pub fn is_host(&self) -> bool {
        self.membership.is_host
    }

    /// Whether we wait in the room's lobby for the host's approval.
    pub fn is_waiting_for_approval(&self) -> bool {
        self.membership.waiting
    }

    pub fn room_options(&self) -> RoomOptions {
        self.membership.options
    }

    /// Whether local edits are allowed: not waiting in the lobby, and either
    /// drawing is open to everyone or we host.
    pub fn can_edit(&self) -> bool {
        !self.membership.waiting && (self.membership.is_host || self.membership.options.allow_drawing)
    }

    /// Authors waiting for our approval.
    pub fn join_requests(&self) -> &[AuthorId] {
        &self.membership.requests
    }

    /// Redraw the active page onto `surface`.
    pub fn render_active<S: Surface + ?Sized>(&self, surface: &mut S) {
        self.session.active_page().render(surface);
    }

    // --- Room lifecycle ---

    /// Connect and join `room`, creating it if needed. Catch-up starts once
    /// the join is confirmed.
    pub fn join(&mut self, room: &str) -> Result<(), ChannelError> {
        log::info!("{} joining room {}", self.author, room);
        self.channel.connect(room, &self.author, Entry::Join)
    }

    /// Connect and create `room` as its host. The relay refuses existing rooms.
    pub fn create(&mut self, room: &str, options: RoomOptions) -> Result<(), ChannelError> {
        log::info!("{} creating room {}", self.author, room);
        self.channel.connect(room, &self.author, Entry::Create(options))
    }

    /// Leave the room. The local session is kept.
    pub fn leave(&mut self) {
        self.channel.disconnect();
        self.detach();
    }

    /// Let a waiting author into the room we host.
    pub fn approve(&mut self, author: &str) -> Result<(), ChannelError> {
        self.channel.send(&ClientMessage::Approve {
            author: author.to_string(),
        })?;
        self.membership.requests.retain(|a| a != author);
        Ok(())
    }

    /// Remove every connection of `author` from the room we host.
    pub fn kick(&mut self, author: &str) -> Result<(), ChannelError> {
        self.channel.send(&ClientMessage::Kick {
            author: author.to_string(),
        })?;
        self.membership.requests.retain(|a| a != author);
        Ok(())
    }

    /// Drop the current state and ask the relay for a snapshot.
    pub fn request_snapshot(&mut self) {
        self.resync(Vec::new());
    }

    // --- Local intents ---

    /// Start a stroke on the active page. Ignored when editing is not allowed.
    pub fn begin_stroke(&mut self, tool: Tool, point: Point, style: StrokeStyle) {
        if !self.can_edit() {
            log::debug!("Stroke refused: {}", EditError::ReadOnly);
            return;
        }
        self.stroke = Some(Stroke {
            page_id: self.session.active_page().id(),
            tool,
            style,
            points: vec![point],
            since_preview: 0,
            previewed: false,
        });
    }

    /// Add a point to the stroke in progress. Shapes keep only their start and
    /// latest point. Returns false if no stroke is in progress.
    pub fn extend_stroke(&mut self, point: Point) -> bool {
        let Some(stroke) = self.stroke.as_mut() else {
            return false;
        };
        if stroke.tool.is_freehand() || stroke.points.len() < 2 {
            stroke.points.push(point);
        } else if let Some(last) = stroke.points.last_mut() {
            *last = point;
        }
        stroke.since_preview += 1;

        if self.config.publish_previews && stroke.since_preview >= self.config.preview_interval_points.max(1) {
            stroke.since_preview = 0;
            stroke.previewed = true;
            let preview = BoardEvent::StrokePreview {
                page_id: stroke.page_id,
                tool: stroke.tool,
                style: stroke.style,
                points: stroke.points.clone(),
            };
            self.publish(preview);
        }
        true
    }

    /// Points of the local stroke in progress.
    pub fn stroke_points(&self) -> Option<&[Point]> {
        self.stroke.as_ref().map(|s| s.points.as_slice())
    }

    /// Complete the stroke at `point` and commit it as one operation.
    pub fn finish_stroke(&mut self, point: Point) -> Option<OperationId> {
        self.extend_stroke(point);
        let stroke = self.stroke.take()?;
        match self.commit(stroke.tool, stroke.points, stroke.style, None) {
            Ok(id) => Some(id),
            Err(err) => {
                log::debug!("Discarding stroke: {}", err);
                if stroke.previewed {
                    self.withdraw_preview(stroke.page_id, stroke.tool, stroke.style);
                }
                None
            }
        }
    }

    /// Abort the stroke in progress without appending anything.
    pub fn cancel_stroke(&mut self) -> bool {
        match self.stroke.take() {
            Some(stroke) => {
                if stroke.previewed {
                    self.withdraw_preview(stroke.page_id, stroke.tool, stroke.style);
                }
                true
            }
            None => false,
        }
    }

    /// Append a complete operation to the active page.
    pub fn commit(
        &mut self,
        tool: Tool,
        points: Vec<Point>,
        style: StrokeStyle,
        text: Option<String>,
    ) -> Result<OperationId, EditError> {
        if !self.can_edit() {
            return Err(EditError::ReadOnly);
        }
        let page_id = self.session.active_page().id();
        let mut op = Operation::new(page_id, self.author.as_str(), tool, points, style);
        if let Some(text) = text {
            op = op.with_text(text);
        }
        op.validate()?;
        let id = op.id();
        self.apply_local(BoardEvent::OpAppend { page_id, op });
        Ok(id)
    }

    /// Undo on the active page. Returns false if there was nothing to undo.
    pub fn undo(&mut self) -> bool {
        let page_id = self.session.active_page().id();
        self.apply_local(BoardEvent::OpUndo { page_id })
    }

    /// Redo on the active page. Returns false if there was nothing to redo.
    pub fn redo(&mut self) -> bool {
        let page_id = self.session.active_page().id();
        self.apply_local(BoardEvent::OpRedo { page_id })
    }

    /// Clear the active page and its overlays.
    pub fn clear_page(&mut self) {
        let page_id = self.session.active_page().id();
        let marker = match self.config.clear_policy {
            ClearPolicy::Marker => Some(Operation::clear_marker(page_id, self.author.as_str())),
            ClearPolicy::Discard => None,
        };
        self.apply_local(BoardEvent::PageClear { page_id, marker });
    }

    /// Append a page and make it active. Returns `None` when editing is not allowed.
    pub fn add_page(&mut self) -> Option<PageId> {
        let page_id = self.session.next_page_id();
        if !self.apply_local(BoardEvent::PageAdd { page_id }) {
            return None;
        }
        self.discard_stroke();
        Some(page_id)
    }

    pub fn switch_page(&mut self, index: usize) -> Result<(), EditError> {
        if !self.can_edit() {
            return Err(EditError::ReadOnly);
        }
        self.session.switch_page(index)?;
        self.discard_stroke();
        self.notify(&Change::ActivePageChanged(index));
        self.publish(BoardEvent::PageSwitch { page_index: index });
        Ok(())
    }

    pub fn delete_page(&mut self, index: usize) -> Result<(), EditError> {
        if !self.can_edit() {
            return Err(EditError::ReadOnly);
        }
        self.session.delete_page(index)?;
        self.discard_stroke();
        self.notify(&Change::PagesChanged);
        self.publish(BoardEvent::PageDelete { page_index: index });
        Ok(())
    }

    pub fn add_overlay(&mut self, element: OverlayElement) -> bool {
        self.apply_local(BoardEvent::OverlayAdd {
            page_id: element.page_id,
            element,
        })
    }

    pub fn move_overlay(&mut self, id: OverlayId, position: Point) -> bool {
        let Some(mut element) = self.session.overlays().get(id).cloned() else {
            return false;
        };
        element.position = position;
        self.apply_local(BoardEvent::OverlayMove {
            page_id: element.page_id,
            element,
        })
    }

    /// Replace the editable fields of an overlay.
    pub fn update_overlay(&mut self, element: OverlayElement) -> bool {
        let Some(page_id) = self.session.overlays().get(element.id).map(|e| e.page_id) else {
            return false;
        };
        self.apply_local(BoardEvent::OverlayUpdate { page_id, element })
    }

    /// Remove an overlay. Unknown ids are a no-op.
    pub fn remove_overlay(&mut self, id: OverlayId) -> bool {
        let Some(element) = self.session.overlays().get(id).cloned() else {
            return false;
        };
        self.apply_local(BoardEvent::OverlayRemove {
            page_id: element.page_id,
            element,
        })
    }

    /// Share the local pointer position.
    pub fn set_cursor(&mut self, x: f64, y: f64) {
        self.publish(BoardEvent::PresenceCursor { x, y });
    }

    fn apply_local(&mut self, event: BoardEvent) -> bool {
        if !self.can_edit() {
            log::debug!("Local {} refused: {}", event.kind(), EditError::ReadOnly);
            return false;
        }
        match self.session.apply_event(&event) {
            Ok(change) => {
                self.notify(&change);
                self.publish(event);
                true
            }
            Err(err) => {
                log::debug!("Local {} not applied: {}", event.kind(), err);
                false
            }
        }
    }

    fn withdraw_preview(&mut self, page_id: PageId, tool: Tool, style: StrokeStyle) {
        self.publish(BoardEvent::StrokePreview {
            page_id,
            tool,
            style,
            points: Vec::new(),
        });
    }

    fn discard_stroke(&mut self) {
        if self.stroke.is_some() {
            log::debug!("Discarding stroke in progress");
            self.cancel_stroke();
        }
    }

    fn publish(&mut self, event: BoardEvent) {
        if self.membership.waiting {
            return;
        }
        let client_seq = event.is_durable().then(|| {
            self.next_client_seq += 1;
            self.next_client_seq
        });
        let message = ClientMessage::Publish { event, client_seq };
        let result = self.channel.send(&message);
        let ClientMessage::Publish { event, client_seq } = message else {
            return;
        };
        match result {
            Ok(()) => {
                if let Some(client_seq) = client_seq {
                    self.unacked.push_back((client_seq, event));
                }
            }
            Err(ChannelError::NotConnected) => {}
            Err(err) => log::warn!("Failed to publish {}: {}", event.kind(), err),
        }
    }

    /// Forget everything tied to the current connection. Unacked events stay
    /// applied locally but are dropped: the relay may or may not have ordered
    /// them, and the next join replaces the session with its snapshot.
    fn detach(&mut self) {
        if !self.unacked.is_empty() {
            log::warn!("Dropping {} unacknowledged events", self.unacked.len());
            self.unacked.clear();
        }
        self.reset_presence();
        self.phase = Phase::Detached;
        self.membership = Membership::default();
        self.diverged = false;
    }

    fn notify(&mut self, change: &Change) {
        if let Some(hook) = self.hook.as_mut() {
            hook(&self.session, change);
        }
    }

    // --- Remote events ---

    /// Drain the channel and apply everything it delivered. Returns the number
    /// of channel events handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let events = self.channel.poll();
            if events.is_empty() {
                return handled;
            }
            handled += events.len();
            for event in events {
                self.handle_channel_event(event);
            }
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => log::info!("{} connected", self.author),
            ChannelEvent::Disconnected => {
                log::info!("{} disconnected", self.author);
                self.detach();
            }
            ChannelEvent::Joined {
                room,
                peer_count,
                seq,
                is_host,
                waiting_for_approval,
                options,
            } => {
                log::info!("Joined room {} ({} peers, seq {})", room, peer_count, seq);
                self.membership = Membership {
                    is_host,
                    waiting: waiting_for_approval,
                    options,
                    requests: Vec::new(),
                };
                if waiting_for_approval {
                    log::info!("Waiting for the host to approve {}", self.author);
                } else {
                    self.request_snapshot();
                }
            }
            ChannelEvent::JoinRequested { author } => {
                log::info!("{} asks to join", author);
                if !self.membership.requests.contains(&author) {
                    self.membership.requests.push(author);
                }
                self.notify(&Change::PresenceChanged);
            }
            ChannelEvent::Approved => {
                log::info!("{} was approved", self.author);
                self.membership.waiting = false;
                self.request_snapshot();
            }
            ChannelEvent::Kicked => {
                log::warn!("{} was removed from the room by the host", self.author);
                self.channel.disconnect();
                self.detach();
            }
            ChannelEvent::PeerJoined { author } => {
                log::info!("{} joined", author);
                self.peers.push(author);
            }
            ChannelEvent::PeerLeft { author } => {
                log::info!("{} left", author);
                if let Some(idx) = self.peers.iter().position(|p| *p == author) {
                    self.peers.remove(idx);
                }
                if !self.peers.contains(&author) {
                    self.cursors.remove(&author);
                    self.previews.remove(&author);
                    self.notify(&Change::PresenceChanged);
                }
            }
            ChannelEvent::Delivered(delivery) => {
                self.apply_remote(delivery);
            }
            ChannelEvent::Ack { seq, client_seq } => {
                self.sequence(Sequenced::Ack { seq, client_seq });
            }
            ChannelEvent::Error { message } => {
                log::warn!("Relay error: {}", message);
                if self.is_live() {
                    self.request_snapshot();
                }
            }
        }
    }

    /// Apply an event received from another participant. Never fails: invalid
    /// input is logged and reported as [`RemoteStatus::Ignored`].
    pub fn apply_remote(&mut self, delivery: Delivery) -> RemoteStatus {
        match delivery.event {
            BoardEvent::Snapshot { snapshot, acked } => return self.receive_snapshot(*snapshot, acked),
            BoardEvent::SnapshotRequest => {
                return RemoteStatus::Ignored(RemoteError::Unexpected(delivery.event.kind()));
            }
            _ => {}
        }
        if !delivery.event.is_durable() {
            return self.apply_presence(delivery);
        }
        match delivery.seq {
            Some(seq) => self.sequence(Sequenced::Event { seq, delivery }),
            None => self.apply_durable(&delivery),
        }
    }

    fn sequence(&mut self, item: Sequenced) -> RemoteStatus {
        let seq = item.seq();
        match self.phase {
            Phase::Detached => self.apply_sequenced(item),
            Phase::CatchingUp { ref mut buffer } => {
                buffer.push(item);
                RemoteStatus::Buffered
            }
            Phase::Live { last_seq } if seq <= last_seq => {
                RemoteStatus::Ignored(RemoteError::DuplicateSequence(seq))
            }
            Phase::Live { last_seq } if seq > last_seq + 1 => {
                log::warn!(
                    "{}, requesting snapshot",
                    RemoteError::SnapshotRace {
                        expected: last_seq + 1,
                        got: seq
                    }
                );
                self.resync(vec![item]);
                RemoteStatus::Buffered
            }
            Phase::Live { .. } => {
                self.phase = Phase::Live { last_seq: seq };
                if matches!(item, Sequenced::Event { .. }) && !self.unacked.is_empty() {
                    self.diverged = true;
                }
                self.apply_sequenced(item)
            }
        }
    }

    fn apply_sequenced(&mut self, item: Sequenced) -> RemoteStatus {
        match item {
            Sequenced::Event { delivery, .. } => self.apply_durable(&delivery),
            Sequenced::Ack { seq, client_seq } => {
                if !self.settle(client_seq) {
                    log::debug!("Ack {} without a pending event", seq);
                }
                if self.unacked.is_empty() && self.diverged {
                    log::debug!("Local events were reordered by the relay, resyncing");
                    self.diverged = false;
                    self.request_snapshot();
                }
                RemoteStatus::Applied
            }
        }
    }

    fn apply_durable(&mut self, delivery: &Delivery) -> RemoteStatus {
        match self.session.apply_event(&delivery.event) {
            Ok(change) => {
                log::debug!("Applied {} from {}", delivery.event.kind(), delivery.from);
                if matches!(delivery.event, BoardEvent::OpAppend { .. })
                    && self.previews.remove(&delivery.from).is_some()
                {
                    self.notify(&Change::PresenceChanged);
                }
                if matches!(change, Change::ActivePageChanged(_) | Change::PagesChanged) {
                    self.discard_stroke();
                }
                self.notify(&change);
                RemoteStatus::Applied
            }
            Err(err) => {
                match err {
                    RemoteError::MalformedEvent(_) => {
                        log::warn!("Dropping {} from {}: {}", delivery.event.kind(), delivery.from, err)
                    }
                    _ => log::debug!("Ignoring {} from {}: {}", delivery.event.kind(), delivery.from, err),
                }
                RemoteStatus::Ignored(err)
            }
        }
    }

    fn apply_presence(&mut self, delivery: Delivery) -> RemoteStatus {
        match delivery.event {
            BoardEvent::PresenceCursor { x, y } => {
                self.cursors.insert(delivery.from, Point::new(x, y));
            }
            BoardEvent::StrokePreview {
                page_id,
                tool,
                style,
                points,
            } => {
                if points.is_empty() {
                    self.previews.remove(&delivery.from);
                } else {
                    self.previews.insert(
                        delivery.from,
                        StrokePreview {
                            page_id,
                            tool,
                            style,
                            points,
                        },
                    );
                }
            }
            other => return RemoteStatus::Ignored(RemoteError::Unexpected(other.kind())),
        }
        self.notify(&Change::PresenceChanged);
        RemoteStatus::Applied
    }

    /// Drop pending events the relay has processed, up to `client_seq`. Acks
    /// without one settle the oldest entry. Returns false if nothing was pending.
    fn settle(&mut self, client_seq: Option<u64>) -> bool {
        let Some(client_seq) = client_seq else {
            return self.unacked.pop_front().is_some();
        };
        let before = self.unacked.len();
        while self.unacked.front().is_some_and(|(c, _)| *c <= client_seq) {
            self.unacked.pop_front();
        }
        self.unacked.len() < before
    }

    fn resync(&mut self, buffer: Vec<Sequenced>) {
        self.phase = Phase::CatchingUp { buffer };
        self.publish(BoardEvent::SnapshotRequest);
    }

    fn receive_snapshot(&mut self, snapshot: SessionSnapshot, acked: Option<u64>) -> RemoteStatus {
        let buffer = match std::mem::replace(&mut self.phase, Phase::Detached) {
            Phase::CatchingUp { buffer } => buffer,
            other => {
                self.phase = other;
                return RemoteStatus::Ignored(RemoteError::Unexpected("session.snapshot"));
            }
        };

        let base = snapshot.seq.unwrap_or(0);
        let session = match self.session.restore(snapshot) {
            Ok(session) => session,
            Err(err) => {
                log::warn!("Rejecting snapshot: {}", err);
                self.phase = Phase::CatchingUp { buffer };
                return RemoteStatus::Ignored(err.into());
            }
        };

        log::info!("Installing snapshot at seq {} ({} buffered)", base, buffer.len());
        if self.stroke.as_ref().is_some_and(|s| session.page(s.page_id).is_none()) {
            self.stroke = None;
        }
        self.session = session;
        self.phase = Phase::Live { last_seq: base };
        self.diverged = false;

        let (covered, pending): (Vec<_>, Vec<_>) = buffer.into_iter().partition(|item| item.seq() <= base);
        match acked {
            Some(_) => {
                self.settle(acked);
            }
            None => {
                for item in covered {
                    if let Sequenced::Ack { client_seq, .. } = item {
                        self.settle(client_seq);
                    }
                }
            }
        }
        // Our events the relay had not processed yet are missing from the snapshot.
        for (_, event) in &self.unacked {
            if let Err(err) = self.session.apply_event(event) {
                log::debug!("Pending {} no longer applies: {}", event.kind(), err);
            }
        }
        self.notify(&Change::SessionReplaced);

        for item in pending {
            self.sequence(item);
        }
        RemoteStatus::Applied
    }

    // --- Presence ---

    /// Other participants in the room.
    pub fn peers(&self) -> &[AuthorId] {
        &self.peers
    }

    pub fn remote_cursors(&self) -> &HashMap<AuthorId, Point> {
        &self.cursors
    }

    /// Live preview of another participant's stroke in progress.
    pub fn preview(&self, author: &str) -> Option<&StrokePreview> {
        self.previews.get(author)
    }

    pub fn previews(&self) -> impl Iterator<Item = (&AuthorId, &StrokePreview)> {
        self.previews.iter()
    }

    fn reset_presence(&mut self) {
        self.peers.clear();
        self.cursors.clear();
        self.previews.clear();
    }
}
