//! Side — one direction of a Stream's transport.
//!
//! A Side wraps a single non-blocking descriptor registered with the
//! broker's reactor. The receive Side is drained by a reader task and the
//! transmit Side is fed by a writer task; both report back to the broker
//! loop through `IoEvent`s and never touch Stream state themselves.
//! Dropping a Side closes its descriptor.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Broker-local identifier of a Stream.
pub type StreamId = u64;

const READ_CHUNK: usize = 64 * 1024;

/// What a reader or writer task observed.
#[derive(Debug)]
pub enum IoEvent {
    Data(StreamId, Bytes),
    Eof(StreamId),
    ReadError(StreamId, io::Error),
    WriteError(StreamId, io::Error),
    /// The writer flushed everything queued and closed its descriptor.
    TransmitClosed(StreamId),
}

impl IoEvent {
    pub fn stream(&self) -> StreamId {
        match self {
            IoEvent::Data(id, _)
            | IoEvent::Eof(id)
            | IoEvent::ReadError(id, _)
            | IoEvent::WriteError(id, _)
            | IoEvent::TransmitClosed(id) => *id,
        }
    }
}

pub struct Side {
    name: &'static str,
    fd: AsyncFd<File>,
}

impl Side {
    /// Take ownership of `fd`, switch it to non-blocking mode and register
    /// it with the current runtime's reactor.
    pub fn new(name: &'static str, fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        // SAFETY: the File owns the descriptor, so it stays open and
        // unchanged until the AsyncFd is dropped.
        let fd = unsafe { AsyncFd::register(File::from(fd)) }?;
        Ok(Self { name, fd })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Read whatever is available. Ok(0) means end of file.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(Ok(n)) => return Ok(n),
                // A pty master reports EIO once the slave side is gone.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(data)
            }) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl is called on a descriptor we own, with valid commands.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above; only O_NONBLOCK is added to the existing flags.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ── Tasks ────────────────────────────────────────────────────────────────────

/// Drain `side` into the broker until EOF or error. Aborting the returned
/// task closes the descriptor.
pub fn spawn_reader(
    stream: StreamId,
    side: Side,
    events: mpsc::UnboundedSender<IoEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match side.read(&mut buf).await {
                Ok(0) => {
                    let _ = events.send(IoEvent::Eof(stream));
                    break;
                }
                Ok(n) => {
                    tracing::trace!(stream, bytes = n, "read");
                    if events
                        .send(IoEvent::Data(stream, Bytes::copy_from_slice(&buf[..n])))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let _ = events.send(IoEvent::ReadError(stream, e));
                    break;
                }
            }
        }
    })
}

/// Write queued buffers to `side` in submission order. Dropping the
/// returned sender lets the writer flush what is queued, close the
/// descriptor and report `TransmitClosed`.
pub fn spawn_writer(
    stream: StreamId,
    side: Side,
    events: mpsc::UnboundedSender<IoEvent>,
) -> (mpsc::UnboundedSender<Bytes>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let task = tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if let Err(e) = side.write_all(&buf).await {
                let _ = events.send(IoEvent::WriteError(stream, e));
                return;
            }
            tracing::trace!(stream, bytes = buf.len(), "wrote");
        }
        drop(side);
        let _ = events.send(IoEvent::TransmitClosed(stream));
    });
    (tx, task)
}
