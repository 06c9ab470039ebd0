//! # stagehand-collab — real-time collaboration for the Stagehand editor
//!
//! Keeps several editors of the same seating document in step by relaying
//! recorded [`Action`](stagehand_core::Action)s through a central server.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket     ┌───────────────┐
//! │ CollabSession  │ ◄───────────────► │ RelayServer   │
//! │ (per editor)   │   bincode frames  │ (central)     │
//! └───────┬────────┘                   └───────┬───────┘
//!         │                                    │
//!         ▼                                    ▼
//! ┌────────────────┐                   ┌───────────────┐
//! │ Reconciler     │                   │ SceneGraph +  │
//! │  └► Editor     │                   │ change log    │
//! └────────────────┘                   └───────┬───────┘
//!                                              │
//!                                      ┌───────┴───────┐
//!                                      │ BroadcastGroup│
//!                                      │ (fan-out)     │
//!                                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — bincode-encoded `SyncMessage` and typed payloads
//! - [`transport`] — the `Connector` seam and its WebSocket implementation
//! - [`session`] — connect, join, broadcast and the inbound event loop
//! - [`reconcile`] — applying remote changes and catch-up batches
//! - [`presence`] — who else is editing
//! - [`assets`] — upload lifecycle notices
//! - [`broadcast`] — per-room fan-out with backpressure
//! - [`server`] — the relay

pub mod assets;
pub mod broadcast;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod transport;

pub use assets::{AssetStage, AssetStatus, AssetTracker};
pub use broadcast::BroadcastGroup;
pub use error::{BootstrapError, CollabError, TransportError};
pub use presence::{color_for, PresenceRoster};
pub use protocol::{
    AssetNotice, ChangeKind, HistoryOperation, JoinRequest, JoinSuccess, MessageType,
    PendingChange, ProtocolError, SyncMessage, UserInfo,
};
pub use reconcile::{BatchReport, Reconciler, RemoteOutcome};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{
    BootstrapReport, BroadcastKind, BroadcastOutcome, ChannelConfig, ChannelState,
    CollabSession, SessionEvent,
};
pub use transport::{Connection, Connector, WebSocketConnector};
