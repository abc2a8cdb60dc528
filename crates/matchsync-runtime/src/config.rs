//! Session configuration

use std::fmt;
use std::sync::Arc;

use matchsync_core::{SyncError, SyncResult};
use matchsync_wire::MessageKind;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Receives every reportable error of a session
pub type ErrorHandler = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Transport opcodes used by the sync layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOpcodes {
    pub handshake_request: i64,
    pub handshake_response: i64,
    pub data: i64,
    pub rpc: i64,
}

impl Default for SyncOpcodes {
    fn default() -> Self {
        SyncOpcodes {
            handshake_request: 1,
            handshake_response: 2,
            data: 3,
            rpc: 4,
        }
    }
}

impl SyncOpcodes {
    /// Opcodes must be pairwise distinct
    pub fn validate(&self) -> SyncResult<()> {
        let all = [self.handshake_request, self.handshake_response, self.data, self.rpc];
        for (i, a) in all.iter().enumerate() {
            if all[i + 1..].contains(a) {
                return Err(SyncError::InvalidDeclaration(format!(
                    "opcode {} is used twice",
                    a
                )));
            }
        }
        Ok(())
    }

    /// Message kind carried on `opcode`
    pub fn kind_of(&self, opcode: i64) -> SyncResult<MessageKind> {
        match opcode {
            o if o == self.handshake_request => Ok(MessageKind::HandshakeRequest),
            o if o == self.handshake_response => Ok(MessageKind::HandshakeResponse),
            o if o == self.data => Ok(MessageKind::Envelope),
            o if o == self.rpc => Ok(MessageKind::Rpc),
            o => Err(SyncError::UnknownOpcode(o)),
        }
    }

    pub fn opcode_for(&self, kind: MessageKind) -> i64 {
        match kind {
            MessageKind::HandshakeRequest => self.handshake_request,
            MessageKind::HandshakeResponse => self.handshake_response,
            MessageKind::Envelope => self.data,
            MessageKind::Rpc => self.rpc,
        }
    }
}

/// When queued envelopes leave
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushMode {
    /// After every local write or applied envelope
    #[default]
    Immediate,
    /// Only on `SyncMatch::flush`
    Manual,
}

/// Sync session configuration
#[derive(Clone)]
pub struct SyncConfig {
    pub opcodes: SyncOpcodes,
    pub flush_mode: FlushMode,
    /// Entries per envelope before a batch is split
    pub max_batch_entries: usize,
    pub error_handler: ErrorHandler,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            opcodes: SyncOpcodes::default(),
            flush_mode: FlushMode::Immediate,
            max_batch_entries: 256,
            error_handler: Arc::new(|e: &SyncError| error!(error = %e, "sync error")),
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("opcodes", &self.opcodes)
            .field("flush_mode", &self.flush_mode)
            .field("max_batch_entries", &self.max_batch_entries)
            .finish_non_exhaustive()
    }
}

impl SyncConfig {
    /// Defaults with manual flushing
    pub fn manual() -> Self {
        SyncConfig::default().with_flush_mode(FlushMode::Manual)
    }

    pub fn with_opcodes(mut self, opcodes: SyncOpcodes) -> Self {
        self.opcodes = opcodes;
        self
    }

    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    pub fn with_max_batch_entries(mut self, max: usize) -> Self {
        self.max_batch_entries = max.max(1);
        self
    }

    pub fn with_error_handler(mut self, handler: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.opcodes.validate()
    }

    pub fn report(&self, error: &SyncError) {
        (self.error_handler)(error);
    }
}
