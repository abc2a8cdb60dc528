//! Match session
//!
//! A `SyncMatch` binds a variable registry to one match. All session state
//! sits behind a single mutex; every entry point collects its side effects
//! (listener calls, error reports, outbound payloads) while holding the lock
//! and performs them after releasing it.
//!
//! Outbound payloads are staged in a FIFO outbox before the state lock is
//! released, so the wire order always matches the order in which the state
//! changes were made.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use matchsync_core::{Presence, SyncError, SyncResult, UserId};
use matchsync_state::{IngressReport, SyncEngine, SyncEvent, Target, VarChange};
use matchsync_wire::{Envelope, HandshakeRequest, HandshakeResponse, RpcCall, SyncMessage};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{
    Dispatch, ErrorHandler, FlushMode, ListenerSet, MatchInfo, RpcHandler, RpcRegistry, SyncConfig,
    Transport, TransportEvent, VarRegistry,
};

/// Lifecycle of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Registry not yet bound to a match
    Idle,
    /// Guest waiting for the host snapshot
    Handshaking,
    Ready,
    /// Handshake rejected or snapshot unusable
    Failed,
    Disposed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub envelopes_in: u64,
    pub envelopes_out: u64,
    pub entries_applied: u64,
    pub entries_stale: u64,
    /// Guest proposals overridden by this host
    pub entries_rejected: u64,
    pub entries_dropped: u64,
    pub acks_applied: u64,
    pub errors_reported: u64,
}

impl SessionStats {
    fn record(&mut self, report: &IngressReport) {
        self.entries_applied += report.applied as u64;
        self.entries_stale += report.stale as u64;
        self.entries_rejected += report.rejected as u64;
        self.entries_dropped += report.dropped as u64;
        self.acks_applied += report.acked as u64;
    }
}

type Outgoing = (i64, Bytes, Option<Vec<UserId>>);

/// Payloads staged under the state lock, sent in staging order
#[derive(Default)]
struct Outbox {
    queue: Mutex<VecDeque<Outgoing>>,
    /// Held by whichever thread is currently sending
    sending: Mutex<()>,
}

impl Outbox {
    fn push(&self, outgoing: Outgoing) {
        self.queue.lock().push_back(outgoing);
    }

    fn pop(&self) -> Option<Outgoing> {
        self.queue.lock().pop_front()
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }
}

/// Work deferred until the session lock is released
struct Effects {
    handler: ErrorHandler,
    transport: Option<Arc<dyn Transport>>,
    errors: Vec<SyncError>,
    dispatch: Dispatch,
    outbox: Arc<Outbox>,
    flush: bool,
}

impl Effects {
    /// Stage a payload; callers hold the state lock
    fn send(&self, outgoing: Outgoing) {
        self.outbox.push(outgoing);
    }
}

pub(crate) struct SessionState {
    pub(crate) engine: SyncEngine,
    pub(crate) listeners: ListenerSet,
    phase: Phase,
    config: SyncConfig,
    transport: Option<Arc<dyn Transport>>,
    outbox: Arc<Outbox>,
    match_id: String,
    stats: SessionStats,
}

impl SessionState {
    fn effects(&self) -> Effects {
        Effects {
            handler: self.config.error_handler.clone(),
            transport: self.transport.clone(),
            errors: Vec::new(),
            dispatch: Dispatch::default(),
            outbox: self.outbox.clone(),
            flush: false,
        }
    }

    fn error(&mut self, fx: &mut Effects, error: SyncError) {
        self.stats.errors_reported += 1;
        fx.errors.push(error);
    }

    fn auto_flush(&self) -> bool {
        self.transport.is_some()
            && self.config.flush_mode == FlushMode::Immediate
            && self.engine.pending_len() > 0
    }

    fn queue_handshake(&mut self, fx: &mut Effects) {
        let Some(host) = self.engine.host_id().cloned() else {
            return;
        };
        let request = self.engine.handshake_request();
        debug!(%host, vars = request.schema.len(), "sending handshake request");
        match SyncMessage::HandshakeRequest(request).to_bytes() {
            Ok(payload) => fx.send((self.config.opcodes.handshake_request, payload, Some(vec![host]))),
            Err(e) => self.error(fx, e),
        }
    }

    /// Stop syncing; listeners stay subscribed
    fn close(&mut self, phase: Phase) {
        self.engine.stop();
        self.transport = None;
        self.outbox.clear();
        self.phase = phase;
    }
}

pub(crate) struct Session {
    pub(crate) state: Mutex<SessionState>,
    pub(crate) rpc: Mutex<RpcRegistry>,
}

impl Session {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Session {
            state: Mutex::new(SessionState {
                engine: SyncEngine::new(),
                listeners: ListenerSet::new(),
                phase: Phase::Idle,
                config: SyncConfig::default(),
                transport: None,
                outbox: Arc::new(Outbox::default()),
                match_id: String::new(),
                stats: SessionStats::default(),
            }),
            rpc: Mutex::new(RpcRegistry::new()),
        })
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&SyncEngine) -> R) -> R {
        f(&self.state.lock().engine)
    }

    /// Apply a local write, then notify listeners and dispatch
    pub(crate) fn local_write(
        self: &Arc<Self>,
        write: impl FnOnce(&mut SyncEngine) -> SyncResult<Option<VarChange>>,
    ) {
        let fx = {
            let mut state = self.state.lock();
            let mut fx = state.effects();
            match write(&mut state.engine) {
                Ok(Some(change)) => {
                    fx.dispatch = state.listeners.collect(vec![SyncEvent::Value(change)]);
                    fx.flush = state.auto_flush();
                }
                Ok(None) => {}
                Err(e) => state.error(&mut fx, e),
            }
            fx
        };
        self.finish(fx);
    }

    pub(crate) fn flush(self: &Arc<Self>) {
        let fx = {
            let mut state = self.state.lock();
            if state.transport.is_none() {
                return;
            }
            let mut fx = state.effects();
            let max = state.config.max_batch_entries;
            let opcode = state.config.opcodes.data;
            let host = state.engine.host_id().cloned();
            let is_host = state.engine.is_host();

            for out in state.engine.drain(max) {
                let targets = match (out.target, &host) {
                    (Target::All, _) => None,
                    (Target::Host, Some(host)) if !is_host => Some(vec![host.clone()]),
                    (Target::Host, _) => continue,
                };
                match SyncMessage::Envelope(out.envelope).to_bytes() {
                    Ok(payload) => {
                        state.stats.envelopes_out += 1;
                        fx.send((opcode, payload, targets));
                    }
                    Err(e) => state.error(&mut fx, e),
                }
            }
            fx
        };
        self.finish(fx);
    }

    fn report(&self, error: SyncError) {
        let handler = {
            let mut state = self.state.lock();
            state.stats.errors_reported += 1;
            state.config.error_handler.clone()
        };
        handler(&error);
    }

    fn finish(self: &Arc<Self>, fx: Effects) {
        let Effects {
            handler,
            transport,
            errors,
            dispatch,
            outbox,
            flush,
        } = fx;

        for error in &errors {
            handler(error);
        }
        dispatch.run();
        if flush {
            self.flush();
        }
        if let Some(transport) = transport {
            // whoever holds the send lock sends everything staged so far, in order
            let failed: Vec<SyncError> = {
                let _sending = outbox.sending.lock();
                let mut failed = Vec::new();
                while let Some((opcode, payload, targets)) = outbox.pop() {
                    if let Err(e) = transport.send(opcode, payload, targets.as_deref()) {
                        warn!(opcode, error = %e, "transport send failed");
                        failed.push(e);
                    }
                }
                failed
            };
            for e in failed {
                self.report(e);
            }
        }
    }
}

/// A registry bound to a running match
#[derive(Clone)]
pub struct SyncMatch {
    session: Arc<Session>,
}

impl SyncMatch {
    /// Start a match as its creator, who is the host
    pub fn create(
        registry: &VarRegistry,
        info: MatchInfo,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        if !info.is_self_host() {
            return Err(SyncError::NotHost);
        }
        Self::start(registry, info, transport, config)
    }

    /// Join an existing match; a guest handshakes with the host first
    pub fn join(
        registry: &VarRegistry,
        info: MatchInfo,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        Self::start(registry, info, transport, config)
    }

    fn start(
        registry: &VarRegistry,
        info: MatchInfo,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        config.validate()?;
        let session = registry.session().clone();
        let fx = {
            let mut state = session.state.lock();
            if state.engine.is_started() {
                return Err(SyncError::RegistryLocked);
            }
            let is_host = info.is_self_host();
            let events = state
                .engine
                .start(info.self_presence, info.presences, info.host);
            state.config = config;
            state.transport = Some(transport);
            state.match_id = info.match_id;

            let mut fx = state.effects();
            fx.dispatch = state.listeners.collect(events);
            if is_host {
                state.phase = Phase::Ready;
                info!(match_id = %state.match_id, "match started as host");
            } else {
                state.phase = Phase::Handshaking;
                info!(match_id = %state.match_id, "joining match");
                state.queue_handshake(&mut fx);
            }
            fx
        };
        session.finish(fx);
        Ok(SyncMatch { session })
    }

    pub fn match_id(&self) -> String {
        self.session.state.lock().match_id.clone()
    }

    pub fn phase(&self) -> Phase {
        self.session.state.lock().phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    pub fn is_host(&self) -> bool {
        self.session.read(|e| e.is_host())
    }

    pub fn stats(&self) -> SessionStats {
        self.session.state.lock().stats.clone()
    }

    /// Send everything queued
    pub fn flush(&self) {
        self.session.flush();
    }

    /// End the session
    ///
    /// Drops every listener and all unsent writes. Handles keep working
    /// on local values.
    pub fn dispose(&self) {
        let mut state = self.session.state.lock();
        if state.phase == Phase::Disposed {
            return;
        }
        state.listeners.clear();
        state.close(Phase::Disposed);
        info!(match_id = %state.match_id, "match disposed");
    }

    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::MatchState {
                sender,
                opcode,
                payload,
            } => self.handle_match_state(&sender, opcode, &payload),
            TransportEvent::PresenceJoined(presence) => self.handle_presence_joined(presence),
            TransportEvent::PresenceLeft(user) => self.handle_presence_left(&user),
            TransportEvent::HostChanged(host) => self.handle_host_changed(host),
        }
    }

    /// Inbound payload on the match channel
    pub fn handle_match_state(&self, sender: &UserId, opcode: i64, payload: &[u8]) {
        let kind = {
            let state = self.session.state.lock();
            if state.transport.is_none() {
                trace!(%sender, opcode, "payload after close ignored");
                return;
            }
            state.config.opcodes.kind_of(opcode)
        };
        let Ok(kind) = kind else {
            trace!(opcode, "opcode not used by sync");
            return;
        };
        let message = match SyncMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(%sender, opcode, error = %e, "undecodable payload");
                self.session.report(e);
                return;
            }
        };
        if message.kind() != kind {
            self.session.report(SyncError::InvalidWireFormat(format!(
                "{:?} received on opcode {}",
                message.kind(),
                opcode
            )));
            return;
        }

        match message {
            SyncMessage::Envelope(envelope) => self.on_envelope(sender, envelope),
            SyncMessage::HandshakeRequest(request) => self.on_handshake_request(sender, request),
            SyncMessage::HandshakeResponse(response) => self.on_handshake_response(sender, response),
            SyncMessage::Rpc(call) => self.on_rpc(sender, call),
        }
    }

    fn on_envelope(&self, sender: &UserId, envelope: Envelope) {
        let fx = {
            let mut state = self.session.state.lock();
            state.stats.envelopes_in += 1;
            if state.phase != Phase::Ready {
                debug!(%sender, phase = ?state.phase, "envelope before ready dropped");
                state.stats.entries_dropped += envelope.value_count() as u64;
                return;
            }
            let mut fx = state.effects();
            let outcome = state.engine.apply_envelope(sender, envelope);
            state.stats.record(&outcome.report);
            for e in outcome.errors {
                state.error(&mut fx, e);
            }
            fx.dispatch = state.listeners.collect(outcome.events);
            fx.flush = state.auto_flush();
            fx
        };
        self.session.finish(fx);
    }

    fn on_handshake_request(&self, sender: &UserId, request: HandshakeRequest) {
        let fx = {
            let mut state = self.session.state.lock();
            if !state.engine.is_host() {
                debug!(%sender, "handshake request at non-host ignored");
                return;
            }
            let mut fx = state.effects();
            let response = state.engine.handle_handshake_request(sender, &request);
            let encoded = response.and_then(|r| SyncMessage::HandshakeResponse(r).to_bytes());
            match encoded {
                Ok(payload) => fx.send((
                    state.config.opcodes.handshake_response,
                    payload,
                    Some(vec![sender.clone()]),
                )),
                Err(e) => state.error(&mut fx, e),
            }
            fx
        };
        self.session.finish(fx);
    }

    fn on_handshake_response(&self, sender: &UserId, response: HandshakeResponse) {
        let fx = {
            let mut state = self.session.state.lock();
            if state.phase != Phase::Handshaking || state.engine.host_id() != Some(sender) {
                debug!(%sender, phase = ?state.phase, "unexpected handshake response ignored");
                return;
            }
            let mut fx = state.effects();
            match response {
                HandshakeResponse::Accepted(snapshot) => match state.engine.apply_snapshot(snapshot) {
                    Ok(events) => {
                        state.phase = Phase::Ready;
                        info!(match_id = %state.match_id, "handshake complete");
                        fx.dispatch = state.listeners.collect(events);
                    }
                    Err(e) => {
                        warn!(error = %e, "snapshot rejected");
                        state.close(Phase::Failed);
                        state.error(&mut fx, e);
                    }
                },
                HandshakeResponse::Rejected { missing, unexpected } => {
                    warn!(
                        missing = missing.len(),
                        unexpected = unexpected.len(),
                        "handshake rejected by host"
                    );
                    state.close(Phase::Failed);
                    state.error(&mut fx, SyncError::SchemaMismatch { missing, unexpected });
                }
            }
            fx
        };
        self.session.finish(fx);
    }

    fn on_rpc(&self, sender: &UserId, call: RpcCall) {
        let handler = self.session.rpc.lock().handler(&call);
        let result = handler.and_then(|h| h(sender, &call.args));
        if let Err(e) = result {
            debug!(%sender, target = %call.target_object_id, name = %call.name, error = %e, "rpc failed");
            self.session.report(e);
        }
    }

    pub fn handle_presence_joined(&self, presence: Presence) {
        let fx = {
            let mut state = self.session.state.lock();
            if state.transport.is_none() {
                return;
            }
            let mut fx = state.effects();
            let events = state.engine.on_presence_joined(presence);
            fx.dispatch = state.listeners.collect(events);
            fx
        };
        self.session.finish(fx);
    }

    pub fn handle_presence_left(&self, user: &UserId) {
        let fx = {
            let mut state = self.session.state.lock();
            if state.transport.is_none() {
                return;
            }
            let mut fx = state.effects();
            let events = state.engine.on_presence_left(user);
            fx.dispatch = state.listeners.collect(events);
            fx
        };
        self.session.finish(fx);
    }

    pub fn handle_host_changed(&self, host: Presence) {
        let fx = {
            let mut state = self.session.state.lock();
            if state.transport.is_none() {
                return;
            }
            let mut fx = state.effects();
            let events = state.engine.on_host_changed(host);
            fx.dispatch = state.listeners.collect(events);
            if state.phase == Phase::Handshaking {
                if state.engine.is_active() {
                    // promoted before the handshake finished
                    state.phase = Phase::Ready;
                } else {
                    state.queue_handshake(&mut fx);
                }
            }
            fx.flush = state.auto_flush();
            fx
        };
        self.session.finish(fx);
    }

    /// Broadcast an RPC to every other peer
    pub fn send_rpc(&self, name: &str, target_object_id: &str, args: Vec<serde_json::Value>) -> SyncResult<()> {
        self.send_rpc_to(name, target_object_id, args, None)
    }

    /// Send an RPC; `None` targets every other peer
    pub fn send_rpc_to(
        &self,
        name: &str,
        target_object_id: &str,
        args: Vec<serde_json::Value>,
        targets: Option<&[UserId]>,
    ) -> SyncResult<()> {
        let (transport, opcode) = {
            let state = self.session.state.lock();
            let transport = state.transport.clone().ok_or(SyncError::SessionClosed)?;
            (transport, state.config.opcodes.rpc)
        };
        let payload = SyncMessage::Rpc(RpcCall {
            name: name.to_string(),
            target_object_id: target_object_id.to_string(),
            args,
        })
        .to_bytes()?;
        transport.send(opcode, payload, targets)
    }

    pub fn register_rpc(&self, object_id: &str, name: &str, handler: RpcHandler) {
        self.session.rpc.lock().register(object_id, name, handler);
    }

    pub fn register_rpc_typed<A, F>(&self, object_id: &str, name: &str, handler: F)
    where
        A: DeserializeOwned,
        F: Fn(&UserId, A) + Send + Sync + 'static,
    {
        self.session.rpc.lock().register_typed(object_id, name, handler);
    }

    pub fn unregister_rpc(&self, object_id: &str) -> bool {
        self.session.rpc.lock().unregister(object_id)
    }
}
