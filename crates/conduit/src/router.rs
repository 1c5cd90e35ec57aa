//! Router — addressed delivery between contexts.
//!
//! `RouterState` lives inside the broker's `Core` and holds the routing
//! table (context id → next-hop Stream) and the handler registry (handle →
//! callback). `Router` is the cheap, cloneable façade other threads use;
//! every mutating call is deferred onto the broker thread.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_core::config::ConduitConfig;
use conduit_core::identity::{BootInfo, Identity, BOOT_FLAG};
use conduit_core::value::{self as codec, ContextRef, Tagged};
use conduit_core::wire::{
    ContextId, Handle, ADD_ROUTE, ALLOCATE_ID, FIRST_DYNAMIC_HANDLE, FORWARD_LOG, MASTER_ID,
    SHUTDOWN,
};
use conduit_core::Message;
use tokio::sync::oneshot;

use crate::broker::{Broker, Core};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::logging;
use crate::receiver::Receiver;
use crate::side::StreamId;
use crate::stream::transport::Transport;
use crate::stream::ConnectRequest;
use crate::value::{TypeRegistry, Value};

/// Callback run on the broker thread for each message to a handle.
pub type Callback = Box<dyn FnMut(Message) + Send>;

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(FIRST_DYNAMIC_HANDLE);

/// A fresh handle, unique within this process.
pub fn allocate_handle() -> Handle {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct HandlerEntry {
    /// Context expected to answer. Its loss closes the handler.
    respondent: Option<ContextId>,
    persist: bool,
    callback: Callback,
}

// ── Broker-side state ────────────────────────────────────────────────────────

pub(crate) struct RouterState {
    identity: Identity,
    routes: HashMap<ContextId, StreamId>,
    names: HashMap<ContextId, String>,
    handlers: HashMap<Handle, HandlerEntry>,
    parent_stream: Option<StreamId>,
    next_context_id: Arc<AtomicU32>,
    shutting_down: bool,
}

impl RouterState {
    fn new(identity: Identity, next_context_id: Arc<AtomicU32>) -> Self {
        Self {
            identity,
            routes: HashMap::new(),
            names: HashMap::new(),
            handlers: HashMap::new(),
            parent_stream: None,
            next_context_id,
            shutting_down: false,
        }
    }

    fn local_id(&self) -> ContextId {
        self.identity.context_id()
    }

    pub(crate) fn add_route(&mut self, context_id: ContextId, stream: StreamId, name: &str) {
        tracing::debug!(context_id, stream, name, "route added");
        self.routes.insert(context_id, stream);
        self.names.insert(context_id, name.to_string());
    }

    pub(crate) fn set_parent(&mut self, stream: StreamId, parent_id: ContextId, name: &str) {
        self.parent_stream = Some(stream);
        self.add_route(parent_id, stream, name);
    }

    /// Direct route, or the parent Stream as the default route.
    fn next_hop(&self, dst_id: ContextId) -> Option<StreamId> {
        self.routes.get(&dst_id).copied().or(self.parent_stream)
    }

    fn register(&mut self, handle: Handle, mut entry: HandlerEntry) {
        if self.shutting_down {
            let local = self.local_id();
            (entry.callback)(Message::dead(local, local, handle, ""));
            return;
        }
        if self.handlers.insert(handle, entry).is_some() {
            tracing::warn!(handle, "handler replaced");
        }
    }

    /// Hand `msg` to its handler, or give it back if there is none.
    fn deliver(&mut self, msg: Message) -> std::result::Result<(), Message> {
        match self.handlers.entry(msg.handle) {
            Entry::Occupied(mut slot) if slot.get().persist => (slot.get_mut().callback)(msg),
            Entry::Occupied(slot) => {
                let mut entry = slot.remove();
                (entry.callback)(msg);
            }
            Entry::Vacant(_) => return Err(msg),
        }
        Ok(())
    }

    /// Drop routes through `stream` and close handlers waiting on contexts
    /// behind it. Returns true if `stream` was the parent.
    pub(crate) fn on_disconnect(&mut self, stream: StreamId) -> bool {
        let lost: HashSet<ContextId> = self
            .routes
            .iter()
            .filter(|(_, s)| **s == stream)
            .map(|(id, _)| *id)
            .collect();
        self.routes.retain(|_, s| *s != stream);
        for id in &lost {
            tracing::debug!(context_id = id, "route removed");
        }

        let lost_parent = self.parent_stream == Some(stream);
        if lost_parent {
            self.parent_stream = None;
        }

        let local = self.local_id();
        let orphaned: Vec<Handle> = self
            .handlers
            .iter()
            .filter(|(_, entry)| match entry.respondent {
                Some(r) => {
                    lost.contains(&r) || (lost_parent && r != local && !self.routes.contains_key(&r))
                }
                None => false,
            })
            .map(|(handle, _)| *handle)
            .collect();
        for handle in orphaned {
            if let Some(mut entry) = self.handlers.remove(&handle) {
                (entry.callback)(Message::dead(local, local, handle, ""));
            }
        }
        lost_parent
    }

    /// Close every handler. Handlers registered later are closed at once.
    pub(crate) fn on_shutdown(&mut self) {
        self.shutting_down = true;
        let local = self.local_id();
        for (handle, mut entry) in self.handlers.drain() {
            (entry.callback)(Message::dead(local, local, handle, ""));
        }
    }
}

// ── Broker-side routing ──────────────────────────────────────────────────────

impl Core {
    /// Deliver `msg` locally or forward it one hop. `via` is the Stream it
    /// arrived on, if any.
    pub(crate) fn route(&mut self, msg: Message, via: Option<StreamId>) {
        let Some(router) = self.router.as_ref() else {
            tracing::warn!(dst_id = msg.dst_id, handle = msg.handle, "no router installed, dropping message");
            return;
        };
        if msg.dst_id == router.local_id() {
            self.deliver_local(msg, via);
            return;
        }
        match router.next_hop(msg.dst_id) {
            Some(stream) if Some(stream) != via => {
                let max = self.config.max_message_size;
                if !msg.fits(max) {
                    let reason = format!("message of {} bytes exceeds maximum {max}", msg.data.len());
                    self.undeliverable(msg, reason);
                } else if !self.transmit(stream, &msg) {
                    let reason = format!("stream to context {} is closed", msg.dst_id);
                    self.undeliverable(msg, reason);
                }
            }
            _ => {
                let reason = format!("no route to context {}", msg.dst_id);
                self.undeliverable(msg, reason);
            }
        }
    }

    fn deliver_local(&mut self, msg: Message, via: Option<StreamId>) {
        tracing::trace!(src_id = msg.src_id, handle = msg.handle, dead = msg.is_dead, "deliver");
        if !msg.is_dead {
            match msg.handle {
                ADD_ROUTE => return self.on_add_route(msg, via),
                ALLOCATE_ID => return self.on_allocate_id(msg),
                SHUTDOWN => {
                    tracing::info!(src_id = msg.src_id, "shutdown requested");
                    return self.begin_shutdown();
                }
                FORWARD_LOG => {
                    let origin = self
                        .router
                        .as_ref()
                        .and_then(|r| r.names.get(&msg.src_id).cloned())
                        .unwrap_or_else(|| format!("context.{}", msg.src_id));
                    logging::emit_forwarded(&msg, &origin);
                    return;
                }
                _ => {}
            }
        }

        let Some(router) = self.router.as_mut() else {
            return;
        };
        let local = router.local_id();
        if let Err(msg) = router.deliver(msg) {
            if msg.is_dead {
                tracing::debug!(handle = msg.handle, "dead message for unknown handle");
            } else {
                let reason = format!("no handler {} in context {}", msg.handle, local);
                self.undeliverable(msg, reason);
            }
        }
    }

    /// Log a message that cannot be delivered and, if the sender wants a
    /// reply, reflect the failure back to it.
    fn undeliverable(&mut self, msg: Message, reason: String) {
        // Forwarded logs that cannot be delivered would only log again.
        if msg.handle == FORWARD_LOG {
            return;
        }
        tracing::error!(
            dst_id = msg.dst_id,
            src_id = msg.src_id,
            handle = msg.handle,
            reason = %reason,
            "undeliverable message"
        );
        if msg.is_dead {
            return;
        }
        let (Some(reply_to), Some(router)) = (msg.reply_to, self.router.as_ref()) else {
            return;
        };
        let dead = Message::dead(msg.src_id, router.local_id(), reply_to, &reason);
        self.route(dead, None);
    }

    pub(crate) fn register_handler(&mut self, handle: Handle, entry: HandlerEntry) {
        match self.router.as_mut() {
            Some(router) => router.register(handle, entry),
            None => tracing::warn!(handle, "no router installed, handler dropped"),
        }
    }

    pub(crate) fn is_parent_stream(&self, stream: StreamId) -> bool {
        self.router
            .as_ref()
            .is_some_and(|r| r.parent_stream == Some(stream))
    }

    /// Ask the context behind `stream` to shut down.
    pub(crate) fn send_shutdown(&mut self, stream: StreamId, remote_id: ContextId) {
        let Some(router) = self.router.as_ref() else {
            return;
        };
        let msg = Message::new(remote_id, router.local_id(), SHUTDOWN, Bytes::new());
        self.transmit(stream, &msg);
    }

    /// Tell the parent that `context_id` is now reachable through us.
    pub(crate) fn announce_route(&mut self, context_id: ContextId, name: &str) {
        let Some(router) = self.router.as_ref() else {
            return;
        };
        let Some(parent_id) = router.identity.parent_id() else {
            return;
        };
        let notice = Tagged::Context(ContextRef {
            context_id,
            name: name.to_string(),
        });
        match codec::encode(&notice) {
            Ok(data) => {
                let msg = Message::new(parent_id, router.local_id(), ADD_ROUTE, Bytes::from(data));
                self.route(msg, None);
            }
            Err(e) => tracing::error!(error = %e, "failed to encode route notice"),
        }
    }

    fn on_add_route(&mut self, msg: Message, via: Option<StreamId>) {
        let Some(stream) = via else {
            tracing::warn!(src_id = msg.src_id, "route notice did not arrive on a stream");
            return;
        };
        let notice = match codec::decode(&msg.data) {
            Ok(Tagged::Context(notice)) => notice,
            Ok(other) => {
                tracing::warn!(value = ?other, "malformed route notice");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable route notice");
                return;
            }
        };
        if let Some(router) = self.router.as_mut() {
            router.add_route(notice.context_id, stream, &notice.name);
        }
        self.announce_route(notice.context_id, &notice.name);
    }

    fn on_allocate_id(&mut self, msg: Message) {
        let Some(router) = self.router.as_ref() else {
            return;
        };
        if !router.identity.is_master() {
            let reason = format!("context {} does not allocate ids", router.local_id());
            self.undeliverable(msg, reason);
            return;
        }
        let id = router.next_context_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(context_id = id, requester = msg.src_id, "allocated context id");
        let local = router.local_id();
        match codec::encode(&Tagged::Int(i64::from(id))) {
            Ok(data) => {
                if let Some(reply) = msg.reply(local, Bytes::from(data)) {
                    self.route(reply, None);
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode allocated id"),
        }
    }
}

// ── Public façade ────────────────────────────────────────────────────────────

/// Options for `Router::connect`. Unset fields come from the config.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub name: Option<String>,
    pub child_path: Option<PathBuf>,
    pub child_args: Vec<String>,
    pub connect_timeout: Option<Duration>,
    pub log_level: Option<String>,
}

impl ConnectOptions {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn child_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.child_path = Some(path.into());
        self
    }

    pub fn child_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.child_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }
}

/// Handle to this process's routing layer. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    broker: Broker,
    identity: Identity,
    config: ConduitConfig,
    next_context_id: Arc<AtomicU32>,
    types: TypeRegistry,
}

impl Router {
    /// Install routing state into `broker` for the context `identity`.
    pub fn new(broker: Broker, identity: Identity, config: ConduitConfig) -> Result<Self> {
        let next_context_id = Arc::new(AtomicU32::new(MASTER_ID + 1));
        let state = RouterState::new(identity.clone(), next_context_id.clone());
        broker.defer(move |core| core.router = Some(state))?;
        Ok(Self {
            inner: Arc::new(RouterInner {
                broker,
                identity,
                config,
                next_context_id,
                types: TypeRegistry::new(),
            }),
        })
    }

    /// Start a broker and a router for the master context.
    pub fn start_master(config: ConduitConfig) -> Result<Self> {
        let broker = Broker::new(config.broker.clone());
        broker.start()?;
        tracing::info!("master router started");
        Self::new(broker, Identity::master(), config)
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.identity.context_id()
    }

    pub fn config(&self) -> &ConduitConfig {
        &self.inner.config
    }

    /// Named object types this side may rebuild from the wire.
    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    /// A handle naming this process's own context.
    pub fn myself(&self) -> Context {
        Context::new(self.clone(), self.context_id(), self.identity().name())
    }

    /// A handle naming an already-known context.
    pub fn context(&self, context_id: ContextId, name: impl Into<String>) -> Context {
        Context::new(self.clone(), context_id, name)
    }

    pub fn register_handler<F>(
        &self,
        handle: Handle,
        respondent: Option<ContextId>,
        persist: bool,
        callback: F,
    ) -> Result<()>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let entry = HandlerEntry {
            respondent,
            persist,
            callback: Box::new(callback),
        };
        self.inner
            .broker
            .defer(move |core| core.register_handler(handle, entry))
    }

    pub fn del_handler(&self, handle: Handle) -> Result<()> {
        self.inner.broker.defer(move |core| {
            if let Some(router) = core.router.as_mut() {
                router.handlers.remove(&handle);
            }
        })
    }

    /// Whether a handler is registered for `handle`, as seen after every
    /// previously deferred call has run.
    pub fn has_handler(&self, handle: Handle) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.inner.broker.defer(move |core| {
            let found = core
                .router
                .as_ref()
                .is_some_and(|r| r.handlers.contains_key(&handle));
            let _ = tx.send(found);
        })?;
        rx.blocking_recv().map_err(|_| Error::local_disconnect())
    }

    pub fn add_route(&self, context_id: ContextId, stream: StreamId) -> Result<()> {
        self.inner.broker.defer(move |core| {
            if let Some(router) = core.router.as_mut() {
                let name = format!("context.{context_id}");
                router.add_route(context_id, stream, &name);
            }
        })
    }

    pub fn route(&self, msg: Message) -> Result<()> {
        self.inner.broker.defer(move |core| core.route(msg, None))
    }

    /// A context id unique for the master's lifetime.
    pub fn allocate_id(&self) -> Result<ContextId> {
        if self.identity().is_master() {
            return Ok(self.inner.next_context_id.fetch_add(1, Ordering::SeqCst));
        }
        let receiver = Receiver::new(self, Some(MASTER_ID), false);
        let request = Message::new(MASTER_ID, self.context_id(), ALLOCATE_ID, Bytes::new())
            .with_reply_to(receiver.handle());
        self.route(request)?;
        match receiver.get(None)? {
            Value::Int(id) => ContextId::try_from(id)
                .map_err(|_| Error::Stream(format!("allocated context id {id} is out of range"))),
            other => Err(Error::Stream(format!(
                "unexpected reply to id allocation: {other:?}"
            ))),
        }
    }

    /// Start a child through `transport` and wait for its bootstrap.
    ///
    /// Blocks the calling thread; never call it from a handler callback.
    pub fn connect<T>(&self, transport: T, options: ConnectOptions) -> Result<Context>
    where
        T: Transport + 'static,
    {
        let config = &self.inner.config;
        let context_id = self.allocate_id()?;
        let name = options.name.clone().unwrap_or_else(|| transport.name());

        let boot = BootInfo {
            context_id,
            parent_ids: self.identity().chain_for_child(),
            name: name.clone(),
            log_level: options
                .log_level
                .clone()
                .unwrap_or_else(|| config.child.log_level.clone()),
            max_message_size: config.broker.max_message_size,
        };
        let program = options
            .child_path
            .clone()
            .unwrap_or_else(|| config.child.resolve_child_path());
        let mut child_argv = vec![
            program.to_string_lossy().into_owned(),
            BOOT_FLAG.to_string(),
            boot.to_arg()?,
        ];
        child_argv.extend(options.child_args.iter().cloned());
        let argv = transport.build_argv(&child_argv)?;

        let (reply, result) = oneshot::channel();
        let request = ConnectRequest {
            transport: Box::new(transport),
            argv,
            context_id,
            name: name.clone(),
            timeout: options
                .connect_timeout
                .unwrap_or_else(|| config.broker.connect_timeout()),
            reply,
        };
        self.inner
            .broker
            .defer(move |core| core.connect_stream(request))?;

        match result.blocking_recv() {
            Ok(Ok(())) => Ok(Context::new(self.clone(), context_id, name)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::local_disconnect()),
        }
    }

    /// Forcibly disconnect the Stream leading to `context`.
    pub fn disconnect(&self, context: &Context) -> Result<()> {
        let context_id = context.context_id();
        self.inner.broker.defer(move |core| {
            let stream = core
                .router
                .as_ref()
                .and_then(|r| r.routes.get(&context_id).copied());
            match stream {
                Some(stream) => core.disconnect(stream, None),
                None => tracing::warn!(context_id, "no stream to disconnect"),
            }
        })
    }

    /// Adopt the descriptors leading to this child's parent.
    pub(crate) fn attach_parent(&self, receive: OwnedFd, transmit: OwnedFd) -> Result<StreamId> {
        let parent_id = self
            .identity()
            .parent_id()
            .ok_or(Error::BrokerState("the master has no parent"))?;
        let (tx, rx) = oneshot::channel();
        self.inner.broker.defer(move |core| {
            let _ = tx.send(core.attach_parent(parent_id, receive, transmit));
        })?;
        rx.blocking_recv().map_err(|_| Error::local_disconnect())?
    }

    /// Shut this context's broker down.
    pub fn shutdown(&self) {
        self.inner.broker.shutdown();
    }
}
