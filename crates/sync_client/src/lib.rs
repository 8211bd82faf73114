//! Real-time member sync client.
//!
//! Keeps a local view of members and bets consistent with the admin server
//! over a long-lived push channel:
//! - Authenticated WebSocket with reconnection and keepalive
//! - Sequence-gap detection and missing-event recovery
//! - Idempotent, last-write-wins patch application onto cached entities
//!
//! ## Architecture
//!
//! ```text
//! WebSocket (auth, ping/pong, backoff)
//!         ↓
//! ChannelTransport ──▶ TransportEvent queue
//!         ↓
//! SyncPipeline (single task)
//!   ListenerRegistry → SequenceTracker → RecoveryCoordinator
//!         ↓
//! EntityCache (DashMap) ◀── RestClient baseline hydration
//!         ↓
//! listeners / readers
//! ```

pub mod clock;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod reconciler;
pub mod recovery;
pub mod registry;
pub mod rest;
pub mod sequence;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    RecoveryConfig, RegistryConfig, RestConfig, SyncConfig, TrackerConfig, TransportConfig,
};
pub use credentials::{MemoryTokenStore, TokenStore};
pub use engine::SyncEngine;
pub use error::{ConnectError, Result, SyncError};
pub use pipeline::{SessionCursor, SessionNotice, SyncPipeline};
pub use reconciler::{ApplyOutcome, CachedEntity, EntityCache, OrderingKey};
pub use recovery::{Recovered, RecoveryCoordinator};
pub use registry::{Listener, ListenerId, ListenerRegistry, Phase, WILDCARD};
pub use rest::{EntitySource, MemberFilter, RestClient};
pub use sequence::{MissingSet, Observation, SequenceTracker};
pub use transport::{
    ChannelTransport, ConnectOutcome, ConnectResult, ConnectionHandle, ConnectionState,
    FrameSink, TransportEvent,
};
