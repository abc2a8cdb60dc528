//! Variable declaration

use std::sync::Arc;

use matchsync_core::{SyncResult, SyncValue, VarId};
use matchsync_wire::SchemaEntry;
use tracing::debug;

use crate::session::Session;
use crate::{PresenceVar, RpcHandler, SharedVar, UserVar};

/// Declares variables and hands out typed handles
///
/// Declarations are only accepted until the registry is bound to a match;
/// afterwards they fail with `RegistryLocked`.
#[derive(Clone)]
pub struct VarRegistry {
    session: Arc<Session>,
}

impl Default for VarRegistry {
    fn default() -> Self {
        VarRegistry::new()
    }
}

impl VarRegistry {
    pub fn new() -> Self {
        VarRegistry {
            session: Session::new(),
        }
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn declare(&self, id: VarId, slots: u16) -> SyncResult<VarId> {
        self.session.state.lock().engine.declare(id.clone(), slots)?;
        debug!(%id, slots, "declared");
        Ok(id)
    }

    pub fn declare_shared<T: SyncValue>(&self, key: impl Into<String>) -> SyncResult<SharedVar<T>> {
        let id = self.declare(VarId::shared(T::KIND, key), 0)?;
        Ok(SharedVar::new(id, self.session.clone()))
    }

    pub fn declare_user<T: SyncValue>(&self, key: impl Into<String>) -> SyncResult<UserVar<T>> {
        let id = self.declare(VarId::user(T::KIND, key), 0)?;
        Ok(UserVar::new(id, self.session.clone()))
    }

    /// Declare a presence collection with a fixed number of slots
    pub fn declare_presence<T: SyncValue>(
        &self,
        key: impl Into<String>,
        slots: u16,
    ) -> SyncResult<PresenceVar<T>> {
        let id = self.declare(VarId::presence(T::KIND, key), slots)?;
        Ok(PresenceVar::new(id, self.session.clone()))
    }

    pub fn schema(&self) -> Vec<SchemaEntry> {
        self.session.read(|e| e.store().schema())
    }

    pub fn len(&self) -> usize {
        self.session.read(|e| e.store().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an RPC target ahead of the match
    pub fn register_rpc(&self, object_id: &str, name: &str, handler: RpcHandler) {
        self.session.rpc.lock().register(object_id, name, handler);
    }
}
