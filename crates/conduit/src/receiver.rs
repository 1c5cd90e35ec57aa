//! Receiver — a blocking queue bound to a handle.
//!
//! Registering a Receiver installs a broker-side handler that pushes each
//! message into a latch. Any thread may then block on the latch with an
//! optional timeout. When the router drops the handler (after a one-shot
//! delivery, on shutdown, on disconnect) the latch is closed so waiters
//! wake instead of hanging.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_core::value as codec;
use conduit_core::value::{CodecError, Tagged};
use conduit_core::wire::{ContextId, Handle};
use conduit_core::Message;
use parking_lot::{Condvar, Mutex};

use crate::call::CallError;
use crate::error::{Error, Result};
use crate::router::{allocate_handle, Router};
use crate::value::Value;

#[derive(Default)]
struct LatchState {
    queue: VecDeque<Message>,
    closed: bool,
}

#[derive(Default)]
struct Latch {
    state: Mutex<LatchState>,
    ready: Condvar,
}

/// Owned by the broker-side handler. Dropping it closes the latch.
struct Feeder(Arc<Latch>);

impl Feeder {
    fn push(&self, msg: Message) {
        self.0.state.lock().queue.push_back(msg);
        self.0.ready.notify_one();
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.0.state.lock().closed = true;
        self.0.ready.notify_all();
    }
}

pub struct Receiver {
    router: Router,
    handle: Handle,
    latch: Arc<Latch>,
}

impl Receiver {
    /// Register on a fresh handle. `respondent` is the context expected to
    /// answer; losing it closes the Receiver.
    pub fn new(router: &Router, respondent: Option<ContextId>, persist: bool) -> Self {
        Self::with_handle(router, allocate_handle(), respondent, persist)
    }

    /// Register on a well-known handle.
    pub fn with_handle(
        router: &Router,
        handle: Handle,
        respondent: Option<ContextId>,
        persist: bool,
    ) -> Self {
        let latch = Arc::new(Latch::default());
        let feeder = Feeder(latch.clone());
        // On failure the feeder is dropped with the callback and the
        // latch reads as closed.
        if let Err(e) = router.register_handler(handle, respondent, persist, move |msg| {
            feeder.push(msg)
        }) {
            tracing::debug!(handle, error = %e, "receiver registered on a stopped broker");
        }
        Self {
            router: router.clone(),
            handle,
            latch,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Next raw message. Dead messages are returned as-is.
    pub fn get_message(&self, timeout: Option<Duration>) -> Result<Message> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.latch.state.lock();
        loop {
            if let Some(msg) = state.queue.pop_front() {
                return Ok(msg);
            }
            if state.closed {
                return Err(Error::local_disconnect());
            }
            match deadline {
                Some(deadline) => {
                    if self.latch.ready.wait_until(&mut state, deadline).timed_out()
                        && state.queue.is_empty()
                        && !state.closed
                    {
                        drop(state);
                        let _ = self.router.del_handler(self.handle);
                        return Err(Error::Timeout);
                    }
                }
                None => self.latch.ready.wait(&mut state),
            }
        }
    }

    /// Next message decoded as a value. A dead message or a remote failure
    /// is returned as an error.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Value> {
        let msg = self.get_message(timeout)?;
        decode_reply(&msg, &self.router)
    }

    /// A queued value, if any, without blocking.
    pub fn try_get(&self) -> Result<Option<Value>> {
        let msg = {
            let mut state = self.latch.state.lock();
            match state.queue.pop_front() {
                Some(msg) => msg,
                None if state.closed => return Err(Error::local_disconnect()),
                None => return Ok(None),
            }
        };
        decode_reply(&msg, &self.router).map(Some)
    }

    pub fn is_closed(&self) -> bool {
        let state = self.latch.state.lock();
        state.closed && state.queue.is_empty()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let _ = self.router.del_handler(self.handle);
    }
}

/// Turn a dead message into the error a waiter should see.
pub(crate) fn dead_error(msg: &Message, local_id: ContextId) -> Error {
    match msg.dead_reason() {
        Some(reason) => Error::Undeliverable(reason),
        None if msg.src_id == local_id => Error::local_disconnect(),
        None => Error::remote_disconnect(),
    }
}

fn decode_reply(msg: &Message, router: &Router) -> Result<Value> {
    if msg.is_dead {
        return Err(dead_error(msg, router.context_id()));
    }
    match codec::decode(&msg.data)? {
        Tagged::Failure(record) => Err(Error::Call(CallError::from(record))),
        Tagged::Unencodable(reason) => Err(CodecError::Unencodable(reason).into()),
        tagged => Ok(Value::from_tagged(tagged, router)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use conduit_core::config::ConduitConfig;

    use crate::error::LOCAL_DISCONNECT_MSG;

    fn router() -> Router {
        Router::start_master(ConduitConfig::default()).unwrap()
    }

    fn send(router: &Router, handle: Handle, value: Tagged) {
        let data = Bytes::from(codec::encode(&value).unwrap());
        router.route(Message::new(0, 0, handle, data)).unwrap();
    }

    #[test]
    fn values_arrive_in_order() {
        let router = router();
        let rx = Receiver::new(&router, None, true);
        for i in 0..3 {
            send(&router, rx.handle(), Tagged::Int(i));
        }
        for i in 0..3 {
            assert_eq!(rx.get(Some(Duration::from_secs(5))).unwrap(), Value::Int(i));
        }
        router.shutdown();
        router.broker().join();
    }

    #[test]
    fn timeout_unregisters_the_handler() {
        let router = router();
        let rx = Receiver::new(&router, None, false);
        let err = rx.get(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(!router.has_handler(rx.handle()).unwrap());
        router.shutdown();
        router.broker().join();
    }

    #[test]
    fn shutdown_wakes_waiters_with_local_disconnect() {
        let router = router();
        let rx = Receiver::new(&router, None, false);
        assert!(router.has_handler(rx.handle()).unwrap());
        router.shutdown();
        match rx.get(Some(Duration::from_secs(5))).unwrap_err() {
            Error::Channel(msg) => assert_eq!(msg, LOCAL_DISCONNECT_MSG),
            other => panic!("unexpected error {other:?}"),
        }
        router.broker().join();
    }

    #[test]
    fn registering_on_a_stopped_broker_reads_as_closed() {
        let router = router();
        router.shutdown();
        router.broker().join();
        let rx = Receiver::new(&router, None, false);
        assert!(rx.is_closed());
        assert!(matches!(rx.try_get(), Err(Error::Channel(_))));
    }

    #[test]
    fn remote_failure_becomes_call_error() {
        let router = router();
        let rx = Receiver::new(&router, None, false);
        send(
            &router,
            rx.handle(),
            Tagged::Failure(codec::FailureRecord {
                type_name: "worker::Broken".into(),
                message: "nope".into(),
                traceback: "  in worker.run".into(),
            }),
        );
        match rx.get(Some(Duration::from_secs(5))).unwrap_err() {
            Error::Call(e) => {
                assert_eq!(e.type_name, "worker::Broken");
                assert!(e.to_string().starts_with("worker::Broken: nope"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        router.shutdown();
        router.broker().join();
    }

    #[test]
    fn dead_reasons_map_to_errors() {
        let reflected = Message::dead(0, 3, 1000, "no route to context 9");
        assert!(matches!(dead_error(&reflected, 0), Error::Undeliverable(r) if r == "no route to context 9"));

        let local = Message::dead(0, 0, 1000, "");
        assert!(matches!(dead_error(&local, 0), Error::Channel(m) if m == LOCAL_DISCONNECT_MSG));

        let remote = Message::dead(0, 3, 1000, "");
        assert!(matches!(dead_error(&remote, 0), Error::Channel(m) if m != LOCAL_DISCONNECT_MSG));
    }
}
