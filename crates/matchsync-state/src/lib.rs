//! MatchSync State - Variable store and the sync pipeline
//!
//! This crate implements the peer-side state machine:
//! - Variable store (shared, user and presence entries)
//! - Presence and host tracking
//! - Presence-ownership rotation
//! - Envelope batching and local-write egress
//! - Host-authoritative ingress with acknowledgements
//! - Schema comparison and snapshots for the handshake

pub mod builder;
pub mod change;
pub mod egress;
pub mod engine;
pub mod ingress;
pub mod presence;
pub mod rotator;
pub mod schema;
pub mod store;

pub use builder::*;
pub use change::*;
pub use engine::*;
pub use ingress::*;
pub use presence::*;
pub use rotator::*;
pub use schema::*;
pub use store::*;
