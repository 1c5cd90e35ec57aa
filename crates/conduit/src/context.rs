//! Context — a handle naming one process in the tree.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_core::value::Tagged;
use conduit_core::wire::{ContextId, Handle, CALL_FUNCTION, SHUTDOWN};
use conduit_core::Message;

use crate::call::FunctionCall;
use crate::error::Result;
use crate::receiver::Receiver;
use crate::router::Router;
use crate::value::{encode_payload, Value};

/// Cheap to clone. Two handles are equal when they name the same context
/// id and name, even if they were built separately.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    router: Router,
    context_id: ContextId,
    name: String,
}

impl Context {
    pub(crate) fn new(router: Router, context_id: ContextId, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                router,
                context_id,
                name: name.into(),
            }),
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.context_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// True if both handles are the same allocation.
    pub fn ptr_eq(a: &Context, b: &Context) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Start a call and return the Receiver its reply will arrive on.
    pub fn call_async(&self, function: &str, args: Vec<Value>) -> Result<Receiver> {
        self.call_async_with(FunctionCall::new(function, args))
    }

    pub fn call_async_with(&self, call: FunctionCall) -> Result<Receiver> {
        let router = self.router();
        tracing::debug!(context = %self.name(), function = %call.qualified_name(), "call");
        let data = encode_payload(
            &Tagged::Call(call.into_record()),
            router.config().broker.max_message_size,
        )?;
        let receiver = Receiver::new(router, Some(self.context_id()), false);
        let msg = Message::new(self.context_id(), router.context_id(), CALL_FUNCTION, data)
            .with_reply_to(receiver.handle());
        router.route(msg)?;
        Ok(receiver)
    }

    /// Call `function` ("module.name") and wait for its result.
    pub fn call(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        self.call_async(function, args)?.get(None)
    }

    pub fn call_with_kwargs(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let mut call = FunctionCall::new(function, args);
        call.kwargs = kwargs;
        self.call_async_with(call)?.get(None)
    }

    pub fn call_timeout(&self, function: &str, args: Vec<Value>, timeout: Duration) -> Result<Value> {
        self.call_async(function, args)?.get(Some(timeout))
    }

    /// Fire-and-forget delivery of `value` to `handle` on this context.
    pub fn send(&self, handle: Handle, value: Value) -> Result<()> {
        let router = self.router();
        let data = encode_payload(&value.into_tagged(), router.config().broker.max_message_size)?;
        router.route(Message::new(self.context_id(), router.context_id(), handle, data))
    }

    /// Deliver `value` to `handle` and return a Receiver for the reply.
    pub fn send_async(&self, handle: Handle, value: Value) -> Result<Receiver> {
        let router = self.router();
        let data = encode_payload(&value.into_tagged(), router.config().broker.max_message_size)?;
        let receiver = Receiver::new(router, Some(self.context_id()), false);
        let msg = Message::new(self.context_id(), router.context_id(), handle, data)
            .with_reply_to(receiver.handle());
        router.route(msg)?;
        Ok(receiver)
    }

    /// Ask this context to shut down.
    pub fn shutdown(&self) -> Result<()> {
        let router = self.router();
        if self.context_id() == router.context_id() {
            router.shutdown();
            return Ok(());
        }
        tracing::debug!(context = %self.name(), "requesting shutdown");
        router.route(Message::new(
            self.context_id(),
            router.context_id(),
            SHUTDOWN,
            Bytes::new(),
        ))
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.inner.context_id == other.inner.context_id && self.inner.name == other.inner.name
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({}, {:?})", self.inner.context_id, self.inner.name)
    }
}
