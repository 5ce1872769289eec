//! # cowatch-sync: Synchronized playback and chat for shared watch sessions
//!
//! Keeps several viewers of the same video in step: play, pause and seek
//! actions taken by one participant are replayed on everyone else's player,
//! and chat messages are shared alongside.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    JSON text frames    ┌──────────────┐
//! │ WatchSession │ ◄────────────────────► │ RelayServer  │
//! │ (per viewer) │   SessionChannel (WS)  │ (central)    │
//! └──────┬───────┘                        └──────┬───────┘
//!        │                                       │
//!   ┌────┴─────────────┐                  ┌──────┴───────┐
//!   ▼                  ▼                  │ SessionRoom  │
//! ┌─────────┐  ┌──────────────────────┐   │ cache + chat │
//! │ ChatLog │  │ PlaybackSynchronizer │   └──────┬───────┘
//! └─────────┘  │ (echo suppression)   │          │
//!              └──────────┬───────────┘   ┌──────┴────────┐
//!                         ▼               │BroadcastGroup │
//!                  PlaybackEngine         │ (fan-out)     │
//!                                         └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire events (`message` and `command`) and their JSON codec
//! - [`channel`]: WebSocket session channel, split into send and receive halves
//! - [`router`]: Dispatch of inbound frames to chat and playback
//! - [`playback`]: Remote command application with token-based echo suppression
//! - [`chat`]: Ordered, deduplicated chat log
//! - [`session`]: Per-viewer context tying the above together
//! - [`broadcast`]: Session fan-out with lag accounting
//! - [`registry`]: Relay-side sessions, membership and state replay
//! - [`relay`]: WebSocket relay server
//! - [`config`]: Client and relay settings
//! - [`error`]: Client-side error type

pub mod protocol;
pub mod error;
pub mod config;
pub mod channel;
pub mod router;
pub mod playback;
pub mod chat;
pub mod session;
pub mod broadcast;
pub mod registry;
pub mod relay;

// Re-exports for convenience
pub use protocol::{
    Author, ChatEvent, CommandEvent, CommandKind, Event, ProtocolError, SessionId, UserId,
};
pub use error::SyncError;
pub use config::{ClientConfig, RelayConfig};
pub use channel::{
    ChannelReceiver, ChannelSender, ChannelState, EventSink, Identity, MemorySink, SessionChannel,
};
pub use router::{MessageRouter, Route, RouteOutcome};
pub use playback::{
    LocalOutcome, PlaybackEngine, PlaybackSnapshot, PlaybackSynchronizer, SuppressionToken,
};
pub use chat::{ChatLog, ChatLogEntry};
pub use session::WatchSession;
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Frame};
pub use registry::{Member, PlaybackCache, Seat, SessionRegistry, SessionRoom};
pub use relay::{RelayError, RelayServer, RelayStats};
