//! Inkboard Core Library
//!
//! Shared multi-page whiteboard: per-page operation logs with an undo/redo
//! cursor, an overlay layer, and the engine that keeps every participant's
//! copy of a board in sync through a relay.

pub mod operation;
pub mod overlay;
pub mod page_log;
pub mod relay;
pub mod render;
pub mod replication;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod sync;

pub use operation::{AuthorId, InvalidOperation, Operation, OperationId, PageId, Rgba, StrokeStyle, Tool};
pub use overlay::{OverlayElement, OverlayId, OverlayKind, OverlayStore};
pub use page_log::{ClearPolicy, PageLog};
pub use relay::{ConnectionId, RelayRoom, Routed};
pub use render::{RecordingSurface, Surface};
pub use replication::{Change, EditError, EngineConfig, RemoteError, RemoteStatus, ReplicationEngine};
pub use session::{Session, SessionError};
pub use snapshot::{BoardExport, SessionSnapshot, SnapshotError};
pub use storage::{AutoSaveManager, MemoryStorage, Storage, StorageError};
pub use sync::{BoardEvent, ChannelEvent, ConnectionState, Entry, MemoryHub, RoomOptions, SyncChannel};
