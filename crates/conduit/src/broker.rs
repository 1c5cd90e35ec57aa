//! Broker — the single control thread owning every Stream and the routing
//! table.
//!
//! The broker thread hosts a current-thread tokio runtime. Each loop
//! iteration waits on three sources: deferred calls submitted from other
//! threads, I/O events reported by the per-Side reader and writer tasks,
//! and the nearest timer (bootstrap deadlines, child reaping, shutdown
//! deadline). Other threads never touch `Core`; they `defer` closures that
//! run on the broker thread in submission order.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::process::Child;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use conduit_core::config::BrokerConfig;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::logging;
use crate::router::RouterState;
use crate::side::{IoEvent, StreamId};
use crate::stream::Stream;

/// Upper bound on how long the loop sleeps with no timer armed.
const IDLE_WAKE: Duration = Duration::from_secs(60);

/// How often children awaiting exit are polled.
const REAP_POLL: Duration = Duration::from_millis(50);

/// Grace given to each remaining child when the broker exits.
const FINAL_REAP_GRACE: Duration = Duration::from_secs(1);

type Deferred = Box<dyn FnOnce(&mut Core) + Send>;

enum Command {
    Defer(Deferred),
    Shutdown,
}

/// Handle to the broker thread. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    commands: mpsc::UnboundedSender<Command>,
    /// Taken by `start`.
    pending: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BrokerInner {
                config,
                commands,
                pending: Mutex::new(Some(pending)),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Spawn the broker thread. Calls deferred before this run once it starts.
    pub fn start(&self) -> Result<()> {
        let commands = self
            .inner
            .pending
            .lock()
            .take()
            .ok_or(Error::BrokerState("broker already started"))?;
        let config = self.inner.config.clone();

        let handle = thread::Builder::new()
            .name("conduit-broker".to_string())
            .spawn(move || {
                logging::mark_broker_thread();
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build broker runtime");
                        return;
                    }
                };
                runtime.block_on(run(config, commands));
            })
            .map_err(|_| Error::BrokerState("failed to spawn broker thread"))?;

        *self.inner.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Run `f` on the broker thread.
    pub fn defer<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Core) + Send + 'static,
    {
        self.inner
            .commands
            .send(Command::Defer(Box::new(f)))
            .map_err(|_| Error::BrokerState("broker is not running"))
    }

    pub fn stop_receive(&self, stream: StreamId) -> Result<()> {
        self.defer(move |core| core.stop_receive(stream))
    }

    pub fn stop_transmit(&self, stream: StreamId) -> Result<()> {
        self.defer(move |core| core.stop_transmit(stream))
    }

    pub fn disconnect(&self, stream: StreamId) -> Result<()> {
        self.defer(move |core| core.disconnect(stream, None))
    }

    /// Begin graceful shutdown. Idempotent; safe from any thread.
    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Shutdown);
    }

    /// Block until the broker thread exits.
    pub fn join(&self) {
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("broker thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .thread
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

// ── Core ─────────────────────────────────────────────────────────────────────

/// State owned by the broker thread.
pub struct Core {
    pub(crate) config: BrokerConfig,
    pub(crate) streams: HashMap<StreamId, Stream>,
    pub(crate) router: Option<RouterState>,
    pub(crate) events: mpsc::UnboundedSender<IoEvent>,
    next_stream_id: StreamId,
    reaping: Vec<Reaping>,
    shutdown_deadline: Option<Instant>,
}

struct Reaping {
    name: String,
    child: Child,
    deadline: Instant,
    killed: bool,
}

impl Core {
    fn new(config: BrokerConfig, events: mpsc::UnboundedSender<IoEvent>) -> Self {
        Self {
            config,
            streams: HashMap::new(),
            router: None,
            events,
            next_stream_id: 1,
            reaping: Vec::new(),
            shutdown_deadline: None,
        }
    }

    pub(crate) fn allocate_stream_id(&mut self) -> StreamId {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_deadline.is_some()
    }

    fn run_command(&mut self, command: Command) {
        match command {
            Command::Defer(f) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
                    tracing::error!(panic = %panic_message(&*payload), "deferred call panicked");
                }
            }
            Command::Shutdown => self.begin_shutdown(),
        }
    }

    fn handle_event(&mut self, event: IoEvent) {
        let stream = event.stream();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_event(event))) {
            let message = panic_message(&*payload);
            tracing::error!(stream, panic = %message, "I/O callback panicked");
            self.disconnect(stream, Some(Error::Stream(format!("I/O callback panicked: {message}"))));
        }
    }

    /// Start graceful shutdown: fail every waiter, flush and close every
    /// Stream, and arm the force-close deadline.
    pub fn begin_shutdown(&mut self) {
        if self.shutdown_deadline.is_some() {
            return;
        }
        tracing::info!(streams = self.streams.len(), "broker shutting down");
        self.shutdown_deadline = Some(Instant::now() + self.config.shutdown_timeout());
        if let Some(router) = self.router.as_mut() {
            router.on_shutdown();
        }
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            self.close_for_shutdown(id);
        }
    }

    fn finished(&self) -> bool {
        self.shutdown_deadline.is_some() && self.streams.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        let reap = (!self.reaping.is_empty()).then(|| Instant::now() + REAP_POLL);
        [self.bootstrap_deadline(), reap, self.shutdown_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        self.expire_bootstraps(now);
        self.reap_children(now);
        if self.shutdown_deadline.is_some_and(|d| now >= d) && !self.streams.is_empty() {
            tracing::warn!(streams = self.streams.len(), "shutdown deadline passed, force closing");
            let ids: Vec<StreamId> = self.streams.keys().copied().collect();
            for id in ids {
                self.disconnect(id, None);
            }
        }
    }

    /// Queue a disconnected Stream's child for non-blocking reaping.
    pub(crate) fn reap_later(&mut self, name: String, child: Child) {
        self.reaping.push(Reaping {
            name,
            child,
            deadline: Instant::now() + self.config.reap_timeout(),
            killed: false,
        });
    }

    fn reap_children(&mut self, now: Instant) {
        self.reaping.retain_mut(|r| match r.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(stream = %r.name, %status, "child reaped");
                false
            }
            Ok(None) if now >= r.deadline && !r.killed => {
                tracing::warn!(stream = %r.name, "child outlived reap timeout, killing");
                if let Err(e) = r.child.kill() {
                    tracing::warn!(stream = %r.name, error = %e, "failed to kill child");
                }
                r.killed = true;
                true
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(stream = %r.name, error = %e, "failed to poll child");
                false
            }
        });
    }

    /// Last act of the broker thread: nothing may outlive it.
    fn finish(&mut self) {
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            self.disconnect(id, None);
        }
        for mut r in self.reaping.drain(..) {
            let give_up = Instant::now() + FINAL_REAP_GRACE;
            loop {
                match r.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < give_up => thread::sleep(Duration::from_millis(10)),
                    Ok(None) => {
                        match r.child.kill() {
                            Ok(()) => {
                                let _ = r.child.wait();
                            }
                            Err(e) => {
                                tracing::warn!(stream = %r.name, error = %e, "child left running")
                            }
                        }
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
        self.router = None;
    }
}

async fn run(config: BrokerConfig, mut commands: mpsc::UnboundedReceiver<Command>) {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut core = Core::new(config, events_tx);
    let mut commands_open = true;
    tracing::info!("broker started");

    loop {
        let deadline = core
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAKE);

        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(command) => {
                    core.run_command(command);
                    while let Ok(command) = commands.try_recv() {
                        core.run_command(command);
                    }
                }
                // Every Broker handle is gone; nobody can ask for anything.
                None => {
                    commands_open = false;
                    core.begin_shutdown();
                }
            },
            Some(event) = events.recv() => core.handle_event(event),
            _ = tokio::time::sleep_until(deadline.into()) => core.fire_timers(),
        }

        if core.finished() {
            break;
        }
    }

    core.finish();
    drop(core);

    // Dropping queued calls closes any reply channels they own, which
    // unblocks their callers.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        drop(command);
    }
    tracing::info!("broker stopped");
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
