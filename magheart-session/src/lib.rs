//! # magheart-session — Reconnecting co-creation session client
//!
//! Joins a shared meeting over one long-lived WebSocket, keeps a cached view
//! of the meeting state and recovers from disconnects on its own.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   JSON envelopes    ┌────────────────┐
//! │ SessionClient │ ◄─────────────────► │ meeting server │
//! │ (handle)      │   /cocreation/ws/   │ (black box)    │
//! └──────┬────────┘   {meeting}/{user}  └────────────────┘
//!        │
//!        ▼
//! ┌───────────────┐    ┌────────────────┐    ┌───────────┐
//! │ SessionState  │ ─► │ SnapshotBroad- │ ─► │ listeners │
//! │ (reducer)     │    │ cast (fan-out) │    │ / streams │
//! └───────────────┘    └────────────────┘    └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope and typed events
//! - [`state`] — Session identity, cached state and snapshots
//! - [`reconnect`] — Capped exponential backoff and close-code rules
//! - [`transport`] — Connector/Transport seam and the WebSocket implementation
//! - [`broadcast`] — Synchronous snapshot fan-out
//! - [`client`] — The session client and its background task
//! - [`config`] — Client configuration
//!
//! ## Example
//!
//! ```no_run
//! use magheart_session::{ClientConfig, Role, SessionClient, SessionIdentity};
//!
//! # async fn run() -> Result<(), magheart_session::ConfigError> {
//! let client = SessionClient::with_websocket(ClientConfig::default())?;
//! let _sub = client.subscribe(|snapshot| {
//!     println!("{} participants", snapshot.participants.len());
//! });
//! client.init(SessionIdentity::new("meeting-1", "alice", Role::Host, "fox"));
//! # client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod protocol;
pub mod state;
pub mod reconnect;
pub mod transport;
pub mod broadcast;
pub mod client;
pub mod config;

#[cfg(test)]
mod testutil;

// Re-exports for convenience
pub use protocol::{
    Envelope, HeartRateSample, InboundEvent, JsonObject, MeetingPhase, OutboundMessage,
    ParticipantStatus, ParticipantView, ProtocolError, Role,
};
pub use state::{ConnectionState, SessionIdentity, SessionSnapshot, SessionState};
pub use reconnect::{is_clean_close, ReconnectPolicy};
pub use transport::{
    endpoint_url, CloseInfo, Connector, Incoming, Transport, TransportError, WsConnector,
};
pub use broadcast::{BroadcastStats, SnapshotBroadcast, Subscription};
pub use client::{ClientStats, SessionClient, SnapshotStream};
pub use config::{ClientConfig, ConfigError};
