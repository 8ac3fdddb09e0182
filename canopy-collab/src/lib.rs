//! # canopy-collab — Real-time collaboration core for Canopy
//!
//! Session membership, an ordered per-session operation log, presence
//! tracking and event fan-out, with a WebSocket transport on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ CollabServer │
//! │ (per user)  │     Binary Proto    │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │ Connection per socket
//!                                    ┌───────┴────────────┐
//!                                    │ SessionCoordinator │
//!                                    └───────┬────────────┘
//!             ┌──────────────┬───────────────┼───────────────┐
//!             ▼              ▼               ▼               ▼
//!      ┌────────────┐ ┌────────────┐ ┌──────────────┐ ┌────────────┐
//!      │SessionStore│ │OperationLog│ │PresenceTrack.│ │ EventBus   │
//!      └─────┬──────┘ └─────┬──────┘ └──────┬───────┘ │ (fan-out)  │
//!            └──────────────┴───────────────┘         └────────────┘
//!                           │
//!                    dyn CollabStore (RocksDB | memory)
//! ```
//!
//! ## Modules
//!
//! - [`session`] — Sessions, participants and roles
//! - [`oplog`] — Append-only operation log with replay
//! - [`presence`] — Heartbeats, snapshots and the staleness sweep
//! - [`broadcast`] — Per-session event fan-out with lag detection
//! - [`coordinator`] — Connection state machine composing the above
//! - [`storage`] — Storage trait, memory and RocksDB backends
//! - [`protocol`] — Binary wire protocol (bincode-encoded messages)
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client with offline queue

pub mod broadcast;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, Delivery, EventBus, LocalBus, SessionEvent, Subscription, SubscriptionHandle};
pub use client::{ClientEvent, ClientState, OfflineQueue, SubmitTicket, SyncClient};
pub use config::{CollabConfig, PresenceConfig, RetryPolicy, ServerConfig};
pub use coordinator::{
    ApplierHandle, Connection, ConnectionState, JoinInfo, OperationApplier, SessionCoordinator,
};
pub use error::{CollabError, CollabResult, ErrorKind};
pub use model::{
    ClockOrder, DocumentType, Operation, OperationDraft, OperationId, Participant,
    PresenceRecord, PresenceUpdate, Role, Session, SessionId, UserId, Vec2, VectorClock,
};
pub use oplog::OperationLog;
pub use presence::{PresenceTracker, SweeperHandle};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::{CollabServer, ServerStats};
pub use session::{AllowAll, CapabilityCheck, SessionStore};
pub use storage::{CollabStore, MemoryStore, RocksStore, StoreConfig, StoreError};
