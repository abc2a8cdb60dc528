//! MatchSync Test Harness - Multi-peer simulation and protocol validation
//!
//! This crate provides:
//! - An in-memory match network with seeded interleaving and retransmission
//! - A multi-peer environment driving real sessions
//! - Convergence fuzzing over random writes and deliveries
//! - End-to-end match scenarios

pub mod environment;
pub mod fuzzer;
pub mod integration;
pub mod network;

pub use environment::*;
pub use fuzzer::*;
pub use integration::*;
pub use network::*;
