//! MatchSync Runtime - Sessions over a match transport
//!
//! This crate wires the sync engine to the outside world:
//! - Variable declaration and typed handles
//! - Change listeners invoked outside the session lock
//! - The match session: create/join, handshake, dispatch, dispose
//! - The transport seam and an async event driver
//! - Named RPC targets
//! - Configuration and tracing setup

pub mod config;
pub mod listener;
pub mod logging;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod vars;

pub use config::*;
pub use listener::*;
pub use logging::*;
pub use registry::*;
pub use rpc::*;
pub use session::*;
pub use transport::*;
pub use vars::*;
