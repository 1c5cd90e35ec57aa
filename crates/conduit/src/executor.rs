//! Executor — runs incoming function calls on a dedicated thread.
//!
//! Calls arrive on the well-known CALL_FUNCTION handle and run one at a
//! time in arrival order. Each call's result, or its failure, is sent back
//! to the caller's reply handle. A dead message on the handle (shutdown,
//! parent lost) ends the loop.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use bytes::Bytes;
use conduit_core::value::{self as codec, Tagged};
use conduit_core::wire::CALL_FUNCTION;
use conduit_core::Message;

use crate::broker::panic_message;
use crate::call::{CallArgs, CallFailure, FunctionCall, FunctionRegistry};
use crate::error::{Error, Result};
use crate::receiver::Receiver;
use crate::router::Router;
use crate::value::{encode_payload, Value};

/// Type name reported when a call names no registered function.
pub const UNKNOWN_FUNCTION: &str = "conduit::UnknownFunction";

/// Type name reported when a function panics.
pub const PANIC: &str = "conduit::Panic";

pub struct Executor {
    router: Router,
    functions: FunctionRegistry,
}

impl Executor {
    /// Register on CALL_FUNCTION and start serving calls.
    pub fn spawn(router: Router, functions: FunctionRegistry) -> Result<thread::JoinHandle<()>> {
        let receiver = Receiver::with_handle(&router, CALL_FUNCTION, None, true);
        let executor = Executor { router, functions };
        thread::Builder::new()
            .name("conduit-executor".to_string())
            .spawn(move || executor.run(receiver))
            .map_err(|_| Error::BrokerState("failed to spawn executor thread"))
    }

    fn run(self, receiver: Receiver) {
        tracing::debug!(functions = ?self.functions.names(), "executor started");
        loop {
            match receiver.get_message(None) {
                Ok(msg) if msg.is_dead => break,
                Ok(msg) => self.handle(msg),
                Err(_) => break,
            }
        }
        tracing::debug!("executor stopped");
    }

    fn handle(&self, msg: Message) {
        let outcome = self.execute(&msg);
        if msg.reply_to.is_none() {
            if let Err(failure) = outcome {
                tracing::warn!(
                    error_type = failure.type_name(),
                    error = failure.message(),
                    "call failed with nobody waiting"
                );
            }
            return;
        }

        let tagged = match outcome {
            Ok(value) => value.into_tagged(),
            Err(failure) => Tagged::Failure(failure.into_record()),
        };
        let max = self.router.config().broker.max_message_size;
        let data = encode_payload(&tagged, max).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "reply cannot be sent as-is");
            codec::encode(&Tagged::Unencodable(e.to_string()))
                .map(Bytes::from)
                .unwrap_or_default()
        });
        if let Some(reply) = msg.reply(self.router.context_id(), data) {
            if let Err(e) = self.router.route(reply) {
                tracing::warn!(error = %e, "failed to send reply");
            }
        }
    }

    fn execute(&self, msg: &Message) -> Result<Value, CallFailure> {
        let record = match codec::decode(&msg.data)? {
            Tagged::Call(record) => record,
            other => {
                return Err(CallFailure::new(
                    "conduit::BadCall",
                    format!("expected a function call, got {other:?}"),
                ))
            }
        };
        let call = FunctionCall::from_record(record, &self.router)?;
        let name = call.qualified_name();
        let here = self.router.identity().name().to_string();
        tracing::debug!(function = %name, src_id = msg.src_id, "running call");

        let Some(function) = self.functions.get(&name) else {
            return Err(CallFailure::new(
                UNKNOWN_FUNCTION,
                format!("no function {name:?} is registered in {here}"),
            )
            .in_function(&name, &here));
        };

        let mut args = CallArgs::new(call.args, call.kwargs, self.router.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| function(&mut args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(failure.in_function(&name, &here)),
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::error!(function = %name, panic = %message, "function panicked");
                Err(CallFailure::new(PANIC, message).in_function(&name, &here))
            }
        }
    }
}
