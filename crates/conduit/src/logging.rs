//! Logging — local subscriber setup and forwarding of child logs to the
//! master.
//!
//! A child has no usable stderr, so its tracing events are sent to the
//! master on the FORWARD_LOG handle and re-emitted there under the
//! `conduit::remote` target, tagged with the originating context's name.

use std::cell::Cell;
use std::fmt::{self, Write as _};

use bytes::Bytes;
use conduit_core::value::{self as codec, Tagged};
use conduit_core::wire::{FORWARD_LOG, MASTER_ID};
use conduit_core::Message;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::router::Router;

/// Target under which forwarded records are re-emitted on the master.
pub const REMOTE_TARGET: &str = "conduit::remote";

thread_local! {
    static BROKER_THREAD: Cell<bool> = const { Cell::new(false) };
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn mark_broker_thread() {
    BROKER_THREAD.with(|b| b.set(true));
}

/// Install a stderr subscriber filtered by `CONDUIT_LOG`, else `RUST_LOG`,
/// else `info`. Does nothing if a subscriber is already installed.
pub fn init() {
    let filter = EnvFilter::try_from_env("CONDUIT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Install a subscriber that forwards every event at or above `level` to
/// the master through `router`.
pub fn init_forwarding(router: &Router, level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(ForwardLayer::new(router.clone()))
        .try_init();
}

pub struct ForwardLayer {
    router: Router,
}

impl ForwardLayer {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let meta = event.metadata();
        // The broker's own chatter about moving these records would loop.
        if BROKER_THREAD.with(Cell::get) && *meta.level() > Level::INFO {
            return;
        }
        if FORWARDING.with(|f| f.replace(true)) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let record = Tagged::List(vec![
            Tagged::Str(meta.level().to_string()),
            Tagged::Str(meta.target().to_string()),
            Tagged::Str(visitor.finish()),
        ]);
        if let Ok(data) = codec::encode(&record) {
            let msg = Message::new(
                MASTER_ID,
                self.router.context_id(),
                FORWARD_LOG,
                Bytes::from(data),
            );
            let _ = self.router.route(msg);
        }

        FORWARDING.with(|f| f.set(false));
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: String,
}

impl RecordVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Re-emit a record forwarded by the context named `origin`.
pub(crate) fn emit_forwarded(msg: &Message, origin: &str) {
    let fields = match codec::decode(&msg.data) {
        Ok(Tagged::List(fields)) => fields,
        _ => {
            tracing::warn!(src_id = msg.src_id, "malformed forwarded log record");
            return;
        }
    };
    let [Tagged::Str(level), Tagged::Str(module), Tagged::Str(text)] = fields.as_slice() else {
        tracing::warn!(src_id = msg.src_id, "malformed forwarded log record");
        return;
    };
    match level.as_str() {
        "ERROR" => tracing::error!(target: REMOTE_TARGET, context = %origin, module = %module, "{text}"),
        "WARN" => tracing::warn!(target: REMOTE_TARGET, context = %origin, module = %module, "{text}"),
        "INFO" => tracing::info!(target: REMOTE_TARGET, context = %origin, module = %module, "{text}"),
        "DEBUG" => tracing::debug!(target: REMOTE_TARGET, context = %origin, module = %module, "{text}"),
        _ => tracing::trace!(target: REMOTE_TARGET, context = %origin, module = %module, "{text}"),
    }
}
