//! MatchSync Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout MatchSync:
//! - Identities (UserId, Presence)
//! - Value kinds and the closed value union
//! - Variable classes and validation status
//! - Error taxonomy

pub mod id;
pub mod value;
pub mod class;
pub mod error;

pub use id::*;
pub use value::*;
pub use class::*;
pub use error::*;
