//! Shared types for the member sync client.
//!
//! - [`messages`]: push channel frames exchanged with the server
//! - [`events`]: typed business events decoded from channel frames
//! - [`models`]: domain records hydrated over REST and patched by events

pub mod error;
pub mod events;
pub mod messages;
pub mod models;

pub use error::{Error, Result};
pub use events::DomainEvent;
pub use messages::{ClientFrame, ControlFrame, Event, RecoveryResponse, ServerFrame};
pub use models::{Bet, BetStatus, Entity, EntityKind, EntityRef, Member, MemberStatus};
