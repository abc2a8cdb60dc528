//! MatchSync Wire - Message types and binary encoding
//!
//! This crate implements what travels over the match channel:
//! - Envelopes (batched variable updates and acknowledgements)
//! - Handshake request/response with the initial snapshot
//! - RPC calls
//! - The little-endian binary codec for all of the above

pub mod codec;
pub mod envelope;
pub mod message;

pub use codec::*;
pub use envelope::*;
pub use message::*;
