//! Stream — one connection to a neighbouring context.
//!
//! A Stream owns a receive Side and a transmit Side, the child process it
//! started (if any), the bootstrap handshake and then the frame decoder.
//! Streams live in `Core::streams` and are only touched on the broker
//! thread.
//!
//! Lifecycle: `Unconnected → Connecting → Bootstrapping → Connected →
//! Disconnected`. The parent attachment inside a child starts `Connected`.

pub mod handshake;
pub mod local;
pub mod spawn;
pub mod ssh;
pub mod sudo;
pub mod transport;

use std::io;
use std::os::fd::OwnedFd;
use std::process::Child;
use std::time::{Duration, Instant};

use bytes::Bytes;
use conduit_core::wire::{ContextId, FrameDecoder, BOOT_SENTINEL};
use conduit_core::Message;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broker::Core;
use crate::error::{Error, Result};
use crate::side::{self, IoEvent, Side, StreamId};

use handshake::{Handshake, Progress};
use transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unconnected,
    Connecting,
    Bootstrapping,
    Connected,
    Disconnected,
}

pub struct Stream {
    pub(crate) id: StreamId,
    pub(crate) name: String,
    pub(crate) state: StreamState,
    /// Context at the far end.
    pub(crate) remote_id: ContextId,
    transport: Option<Box<dyn Transport>>,
    handshake: Option<Handshake>,
    decoder: FrameDecoder,
    child: Option<Child>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    receive_open: bool,
    transmit_open: bool,
    on_connect: Option<oneshot::Sender<Result<()>>>,
}

/// Everything needed to start a child, prepared off the broker thread.
pub(crate) struct ConnectRequest {
    pub transport: Box<dyn Transport>,
    pub argv: Vec<String>,
    pub context_id: ContextId,
    pub name: String,
    pub timeout: Duration,
    pub reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Default)]
struct Received {
    connected: bool,
    messages: Vec<Message>,
}

impl Stream {
    fn new(id: StreamId, name: String, remote_id: ContextId, max_message_size: usize) -> Self {
        Self {
            id,
            name,
            state: StreamState::Unconnected,
            remote_id,
            transport: None,
            handshake: None,
            decoder: FrameDecoder::new(max_message_size),
            child: None,
            writer: None,
            reader_task: None,
            writer_task: None,
            receive_open: false,
            transmit_open: false,
            on_connect: None,
        }
    }

    /// Register both descriptors with the reactor and start their tasks.
    fn open_sides(
        &mut self,
        receive: OwnedFd,
        transmit: OwnedFd,
        events: &mpsc::UnboundedSender<IoEvent>,
    ) -> io::Result<()> {
        let receive = Side::new("receive", receive)?;
        let transmit = Side::new("transmit", transmit)?;
        self.reader_task = Some(side::spawn_reader(self.id, receive, events.clone()));
        let (writer, task) = side::spawn_writer(self.id, transmit, events.clone());
        self.writer = Some(writer);
        self.writer_task = Some(task);
        self.receive_open = true;
        self.transmit_open = true;
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn write(&self, data: Bytes) -> bool {
        match &self.writer {
            Some(writer) => writer.send(data).is_ok(),
            None => false,
        }
    }

    /// Queue one message. False if the transmit Side is already closed.
    pub(crate) fn send(&self, msg: &Message) -> bool {
        if self.state != StreamState::Connected {
            return false;
        }
        tracing::trace!(
            stream = %self.name,
            dst_id = msg.dst_id,
            handle = msg.handle,
            bytes = msg.data.len(),
            "send"
        );
        self.write(msg.to_frame())
    }

    fn receive(&mut self, data: &[u8]) -> Result<Received> {
        let mut received = Received::default();
        match self.state {
            StreamState::Bootstrapping => {
                let (Some(hs), Some(transport)) = (self.handshake.as_mut(), self.transport.as_mut())
                else {
                    return Ok(received);
                };
                let mut replies = Vec::new();
                let progress = hs.feed(data, transport.as_mut(), &mut replies);
                for reply in replies {
                    self.write(reply);
                }
                match progress? {
                    Progress::Pending => return Ok(received),
                    Progress::Connected(rest) => {
                        self.state = StreamState::Connected;
                        self.handshake = None;
                        self.decoder.extend(&rest);
                        received.connected = true;
                    }
                }
            }
            StreamState::Connected => self.decoder.extend(data),
            _ => return Ok(received),
        }
        while let Some((header, payload)) = self.decoder.next_frame()? {
            received
                .messages
                .push(Message::from_frame(&header, payload));
        }
        Ok(received)
    }

    fn close(&mut self) {
        self.state = StreamState::Disconnected;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        self.receive_open = false;
        self.transmit_open = false;
    }

    /// Why the stream failed if it ends now without an explicit reason.
    fn eof_reason(&self) -> Option<Error> {
        let hs = self.handshake.as_ref()?;
        let last = hs.last_output();
        Some(Error::Stream(if last.is_empty() {
            format!("EOF on stream {} before {BOOT_SENTINEL}; no output received", self.name)
        } else {
            format!(
                "EOF on stream {} before {BOOT_SENTINEL}; last output: {last:?}",
                self.name
            )
        }))
    }
}

// ── Broker-side stream operations ────────────────────────────────────────────

impl Core {
    /// Spawn a child and begin its bootstrap. The result is reported on
    /// `request.reply` once the handshake completes or fails.
    pub(crate) fn connect_stream(&mut self, request: ConnectRequest) {
        let ConnectRequest {
            transport,
            argv,
            context_id,
            name,
            timeout,
            reply,
        } = request;

        if self.is_shutting_down() {
            let _ = reply.send(Err(Error::local_disconnect()));
            return;
        }

        let id = self.allocate_stream_id();
        let mut stream = Stream::new(id, name, context_id, self.config.max_message_size);
        stream.state = StreamState::Connecting;
        tracing::debug!(stream = %stream.name, context_id, argv = ?argv, "connecting");

        let spawned = match transport.spawn(&argv) {
            Ok(spawned) => spawned,
            Err(e) => {
                let program = argv.first().map(String::as_str).unwrap_or("");
                let _ = reply.send(Err(Error::Stream(format!(
                    "failed to start {program}: {e}"
                ))));
                return;
            }
        };
        stream.child = Some(spawned.child);
        if let Err(e) = stream.open_sides(spawned.receive, spawned.transmit, &self.events) {
            let _ = reply.send(Err(Error::Stream(format!(
                "failed to register {}: {e}",
                stream.name
            ))));
            if let Some(child) = stream.child.take() {
                self.reap_later(stream.name.clone(), child);
            }
            return;
        }

        stream.transport = Some(transport);
        stream.handshake = Some(Handshake::new(timeout));
        stream.on_connect = Some(reply);
        stream.state = StreamState::Bootstrapping;
        self.streams.insert(id, stream);
    }

    /// Adopt the descriptors connecting this child to its parent.
    pub(crate) fn attach_parent(
        &mut self,
        parent_id: ContextId,
        receive: OwnedFd,
        transmit: OwnedFd,
    ) -> Result<StreamId> {
        let id = self.allocate_stream_id();
        let mut stream = Stream::new(
            id,
            format!("parent.{parent_id}"),
            parent_id,
            self.config.max_message_size,
        );
        stream
            .open_sides(receive, transmit, &self.events)
            .map_err(|e| Error::Stream(format!("failed to attach parent stream: {e}")))?;
        stream.state = StreamState::Connected;
        let name = stream.name.clone();
        self.streams.insert(id, stream);
        if let Some(router) = self.router.as_mut() {
            router.set_parent(id, parent_id, &name);
        }
        tracing::info!(stream = %name, "attached to parent");
        Ok(id)
    }

    pub(crate) fn dispatch_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Data(id, data) => self.on_receive(id, &data),
            IoEvent::Eof(id) => {
                let reason = self.streams.get(&id).and_then(Stream::eof_reason);
                self.disconnect(id, reason);
            }
            IoEvent::ReadError(id, e) => {
                self.disconnect(id, Some(Error::Stream(format!("read failed: {e}"))))
            }
            IoEvent::WriteError(id, e) => {
                self.disconnect(id, Some(Error::Stream(format!("write failed: {e}"))))
            }
            IoEvent::TransmitClosed(id) => {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return;
                };
                stream.transmit_open = false;
                stream.writer_task = None;
                if !stream.receive_open {
                    self.disconnect(id, None);
                }
            }
        }
    }

    fn on_receive(&mut self, id: StreamId, data: &[u8]) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        match stream.receive(data) {
            Ok(received) => {
                if received.connected {
                    self.on_connected(id);
                }
                for msg in received.messages {
                    self.route(msg, Some(id));
                }
            }
            Err(e) => self.disconnect(id, Some(e)),
        }
    }

    fn on_connected(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        let remote_id = stream.remote_id;
        let name = stream.name.clone();
        let reply = stream.on_connect.take();
        tracing::info!(stream = %name, context_id = remote_id, "stream connected");

        if let Some(router) = self.router.as_mut() {
            router.add_route(remote_id, id, &name);
        }
        self.announce_route(remote_id, &name);
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
    }

    /// Earliest pending bootstrap deadline.
    pub(crate) fn bootstrap_deadline(&self) -> Option<Instant> {
        self.streams
            .values()
            .filter_map(|s| s.handshake.as_ref().map(Handshake::deadline))
            .min()
    }

    pub(crate) fn expire_bootstraps(&mut self, now: Instant) {
        let expired: Vec<(StreamId, Error)> = self
            .streams
            .values()
            .filter_map(|s| {
                let hs = s.handshake.as_ref()?;
                (now >= hs.deadline()).then(|| {
                    (
                        s.id,
                        Error::Stream(format!(
                            "bootstrap failed: {} did not print {BOOT_SENTINEL} within {:?}; last output: {:?}",
                            s.name,
                            hs.timeout(),
                            hs.last_output()
                        )),
                    )
                })
            })
            .collect();
        for (id, reason) in expired {
            self.disconnect(id, Some(reason));
        }
    }

    /// Queue `msg` on a Stream. False if the Stream is gone or closing.
    pub(crate) fn transmit(&mut self, id: StreamId, msg: &Message) -> bool {
        self.streams.get(&id).is_some_and(|s| s.send(msg))
    }

    /// Stop reading. The Stream is disconnected once both Sides are closed.
    pub fn stop_receive(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if let Some(task) = stream.reader_task.take() {
            task.abort();
        }
        stream.receive_open = false;
        tracing::debug!(stream = %stream.name, "receive side stopped");
        if !stream.transmit_open {
            self.disconnect(id, None);
        }
    }

    /// Stop writing once everything already queued has been flushed.
    pub fn stop_transmit(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        stream.writer = None;
        tracing::debug!(stream = %stream.name, "transmit side closing");
        if stream.writer_task.is_none() && !stream.receive_open {
            self.disconnect(id, None);
        }
    }

    /// Tear a Stream down. Later calls for the same id do nothing.
    pub fn disconnect(&mut self, id: StreamId, reason: Option<Error>) {
        let Some(mut stream) = self.streams.remove(&id) else {
            return;
        };
        stream.close();
        match &reason {
            Some(e) => tracing::warn!(stream = %stream.name, error = %e, "stream disconnected"),
            None => tracing::info!(stream = %stream.name, "stream disconnected"),
        }

        if let Some(reply) = stream.on_connect.take() {
            let err = reason.unwrap_or_else(|| {
                Error::Stream(format!("bootstrap failed: stream {} closed", stream.name))
            });
            let _ = reply.send(Err(err));
        }
        if let Some(child) = stream.child.take() {
            self.reap_later(stream.name.clone(), child);
        }

        let lost_parent = self
            .router
            .as_mut()
            .map(|router| router.on_disconnect(id))
            .unwrap_or(false);
        if lost_parent {
            tracing::info!("parent stream lost");
            self.begin_shutdown();
        }
    }

    /// Flush and close one Stream as part of broker shutdown.
    pub(crate) fn close_for_shutdown(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get(&id) else {
            return;
        };
        if stream.state != StreamState::Connected {
            self.disconnect(id, Some(Error::local_disconnect()));
            return;
        }
        let remote_id = stream.remote_id;
        if self.is_parent_stream(id) {
            // A leaving child reads nothing more from its parent.
            self.stop_receive(id);
        } else {
            self.send_shutdown(id, remote_id);
        }
        self.stop_transmit(id);
    }
}
