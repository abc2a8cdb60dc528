//! Typed variable handles
//!
//! Handles are cheap clones sharing the session. `set` is the only way to
//! mutate a variable; it never blocks on I/O and always applies locally,
//! whether or not the session is currently syncing.

use std::marker::PhantomData;
use std::sync::Arc;

use matchsync_core::{SyncValue, UserId, ValidationStatus, VarId};
use matchsync_state::{ChangeSource, PresenceChange, Scope, SyncEngine, VarChange, VarEntry};

use crate::session::Session;
use crate::{SubscriptionHandle, ValueCallback};

/// A typed change of one entry
#[derive(Clone, Debug, PartialEq)]
pub struct ValueChanged<T> {
    pub id: VarId,
    /// Owner of the entry for user and presence variables
    pub user_id: Option<UserId>,
    pub old: T,
    pub new: T,
    pub lock_version: u64,
    pub status: ValidationStatus,
    pub source: ChangeSource,
}

fn typed<T: SyncValue>(f: impl Fn(&ValueChanged<T>) + Send + Sync + 'static) -> ValueCallback {
    Arc::new(move |c: &VarChange| {
        let (Some(old), Some(new)) = (T::from_value(&c.old), T::from_value(&c.new)) else {
            return;
        };
        f(&ValueChanged {
            id: c.id.clone(),
            user_id: c.user_id.clone(),
            old,
            new,
            lock_version: c.lock_version,
            status: c.status,
            source: c.source.clone(),
        })
    })
}

struct Handle<T> {
    id: VarId,
    session: Arc<Session>,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle {
            id: self.id.clone(),
            session: self.session.clone(),
            _ty: PhantomData,
        }
    }
}

impl<T: SyncValue> Handle<T> {
    fn new(id: VarId, session: Arc<Session>) -> Self {
        Handle {
            id,
            session,
            _ty: PhantomData,
        }
    }

    fn read<R>(&self, f: impl FnOnce(&SyncEngine, &VarId) -> R) -> R {
        self.session.read(|engine| f(engine, &self.id))
    }

    fn entry(&self, scope: Option<Scope>) -> Option<VarEntry> {
        self.read(|engine, id| scope.and_then(|s| engine.store().entry(id, &s).ok()))
    }

    fn value(&self, scope: Option<Scope>) -> T {
        self.entry(scope)
            .and_then(|e| T::from_value(&e.value))
            .unwrap_or_default()
    }

    fn subscribe(&self, f: impl Fn(&ValueChanged<T>) + Send + Sync + 'static) -> SubscriptionHandle {
        self.session.state.lock().listeners.on_value(&self.id, typed(f))
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.session.state.lock().listeners.unsubscribe(handle)
    }
}

/// Variable writable by any peer
#[derive(Clone)]
pub struct SharedVar<T>(Handle<T>);

impl<T: SyncValue> SharedVar<T> {
    pub(crate) fn new(id: VarId, session: Arc<Session>) -> Self {
        SharedVar(Handle::new(id, session))
    }

    pub fn id(&self) -> &VarId {
        &self.0.id
    }

    pub fn set(&self, value: T) {
        let id = self.0.id.clone();
        self.0
            .session
            .local_write(move |engine| engine.set_shared(&id, value.into_value()));
    }

    pub fn get(&self) -> T {
        self.0.value(Some(Scope::Shared))
    }

    pub fn lock_version(&self) -> u64 {
        self.0.entry(Some(Scope::Shared)).map_or(0, |e| e.lock_version)
    }

    pub fn status(&self) -> ValidationStatus {
        self.0.entry(Some(Scope::Shared)).map_or_else(Default::default, |e| e.status)
    }

    pub fn on_value_changed(&self, f: impl Fn(&ValueChanged<T>) + Send + Sync + 'static) -> SubscriptionHandle {
        self.0.subscribe(f)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.0.unsubscribe(handle)
    }
}

/// Variable with one entry per peer, writable only by that peer
#[derive(Clone)]
pub struct UserVar<T>(Handle<T>);

impl<T: SyncValue> UserVar<T> {
    pub(crate) fn new(id: VarId, session: Arc<Session>) -> Self {
        UserVar(Handle::new(id, session))
    }

    pub fn id(&self) -> &VarId {
        &self.0.id
    }

    fn self_scope(&self) -> Option<Scope> {
        self.0.read(|engine, _| engine.self_id().cloned().map(Scope::User))
    }

    /// Write this peer's entry; ignored before the match starts
    pub fn set(&self, value: T) {
        let id = self.0.id.clone();
        self.0
            .session
            .local_write(move |engine| engine.set_user(&id, value.into_value()));
    }

    /// This peer's entry
    pub fn get(&self) -> T {
        self.0.value(self.self_scope())
    }

    pub fn get_for(&self, user: &UserId) -> T {
        self.0.value(Some(Scope::User(user.clone())))
    }

    pub fn lock_version(&self) -> u64 {
        self.0.entry(self.self_scope()).map_or(0, |e| e.lock_version)
    }

    pub fn status(&self) -> ValidationStatus {
        self.0.entry(self.self_scope()).map_or_else(Default::default, |e| e.status)
    }

    pub fn status_for(&self, user: &UserId) -> ValidationStatus {
        self.0
            .entry(Some(Scope::User(user.clone())))
            .map_or_else(Default::default, |e| e.status)
    }

    /// Fires for changes of any peer's entry
    pub fn on_value_changed(&self, f: impl Fn(&ValueChanged<T>) + Send + Sync + 'static) -> SubscriptionHandle {
        self.0.subscribe(f)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.0.unsubscribe(handle)
    }
}

/// Collection of slots bound to rotating owners
#[derive(Clone)]
pub struct PresenceVar<T>(Handle<T>);

impl<T: SyncValue> PresenceVar<T> {
    pub(crate) fn new(id: VarId, session: Arc<Session>) -> Self {
        PresenceVar(Handle::new(id, session))
    }

    pub fn id(&self) -> &VarId {
        &self.0.id
    }

    pub fn slot_count(&self) -> usize {
        self.0.read(|engine, id| engine.rotators().get(id).map_or(0, |r| r.slot_count()))
    }

    /// Slot owned by this peer, if any
    pub fn self_slot(&self) -> Option<usize> {
        self.0.read(|engine, id| {
            let me = engine.self_id()?;
            engine.rotators().get(id)?.slot_of(me)
        })
    }

    pub fn slot_of(&self, user: &UserId) -> Option<usize> {
        self.0
            .read(|engine, id| engine.rotators().get(id)?.slot_of(user))
    }

    pub fn owner(&self, slot: usize) -> Option<UserId> {
        self.0
            .read(|engine, id| engine.rotators().get(id)?.owner(slot).cloned())
    }

    /// Write this peer's slot; ignored when it owns none
    pub fn set(&self, value: T) {
        let id = self.0.id.clone();
        self.0
            .session
            .local_write(move |engine| engine.set_presence(&id, value.into_value()));
    }

    /// Value of this peer's slot, the default when it owns none
    pub fn get(&self) -> T {
        self.0.value(self.self_slot().map(Scope::Slot))
    }

    /// Value of the slot owned by `user`
    pub fn get_for(&self, user: &UserId) -> Option<T> {
        let slot = self.slot_of(user)?;
        Some(self.0.value(Some(Scope::Slot(slot))))
    }

    pub fn get_slot(&self, slot: usize) -> T {
        self.0.value(Some(Scope::Slot(slot)))
    }

    pub fn slot_lock_version(&self, slot: usize) -> u64 {
        self.0.entry(Some(Scope::Slot(slot))).map_or(0, |e| e.lock_version)
    }

    pub fn slot_status(&self, slot: usize) -> ValidationStatus {
        self.0
            .entry(Some(Scope::Slot(slot)))
            .map_or_else(Default::default, |e| e.status)
    }

    pub fn lock_version(&self) -> u64 {
        self.0
            .entry(self.self_slot().map(Scope::Slot))
            .map_or(0, |e| e.lock_version)
    }

    pub fn status(&self) -> ValidationStatus {
        self.0
            .entry(self.self_slot().map(Scope::Slot))
            .map_or_else(Default::default, |e| e.status)
    }

    pub fn on_value_changed(&self, f: impl Fn(&ValueChanged<T>) + Send + Sync + 'static) -> SubscriptionHandle {
        self.0.subscribe(f)
    }

    /// Fires when a slot gains or loses its owner
    pub fn on_presence_changed(&self, f: impl Fn(&PresenceChange) + Send + Sync + 'static) -> SubscriptionHandle {
        self.0
            .session
            .state
            .lock()
            .listeners
            .on_presence(&self.0.id, Arc::new(f))
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.0.unsubscribe(handle)
    }
}
