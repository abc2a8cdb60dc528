//! Error types for MatchSync

use thiserror::Error;

use crate::{UserId, VarClass, VarId, VarKind};

/// Core MatchSync errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    // Handshake errors
    #[error("Schema mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    SchemaMismatch {
        missing: Vec<VarId>,
        unexpected: Vec<VarId>,
    },

    // Ingress errors
    #[error("Unknown key: {0}")]
    UnknownKey(VarId),

    #[error("Rotator has no slot for user {user} in collection {collection}")]
    UnrecognizedAssignment { collection: String, user: UserId },

    #[error("Unauthorized write to {id} by {user}")]
    UnauthorizedWrite { id: VarId, user: UserId },

    #[error("Type mismatch on {id}: expected {expected}, got {actual}")]
    TypeMismatch {
        id: VarId,
        expected: VarKind,
        actual: VarKind,
    },

    #[error("Class mismatch on {id}: used as a {expected} variable")]
    ClassMismatch { id: VarId, expected: VarClass },

    // Registry errors
    #[error("Duplicate key: {0}")]
    DuplicateKey(VarId),

    #[error("Variable not found: {0}")]
    NotFound(VarId),

    #[error("Invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("Registry is locked: variables must be declared before the match starts")]
    RegistryLocked,

    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u8),

    #[error("Unknown opcode: {0}")]
    UnknownOpcode(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Session errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Not host")]
    NotHost,

    #[error("Unknown rpc target: {object_id}.{name}")]
    UnknownRpcTarget { object_id: String, name: String },
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for MatchSync operations
pub type SyncResult<T> = Result<T, SyncError>;
