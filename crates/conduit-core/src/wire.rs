//! conduit wire format — everything that crosses a Stream after bootstrap.
//!
//! Every routed message is a fixed 24-byte header followed by `length`
//! payload bytes. All integers are big-endian and the header derives
//! zerocopy traits, so encoding and decoding never touch unsafe code.
//!
//! Before the header-framed phase begins a child speaks plain text lines;
//! the line `EC0` marks the switch. See `BOOT_SENTINEL`.

use bytes::{Buf, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Master-assigned identifier of one context. 0 is the master itself.
pub type ContextId = u32;

/// Identifier of one conversation endpoint inside a context.
pub type Handle = u32;

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Header preceding every routed message.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Bit flags:
    ///   bit    0: dead; the channel named by `handle` is closed
    ///   bits 1-7: reserved, must be zero
    pub flags: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],

    /// Context the message is addressed to.
    pub dst_id: U32<BigEndian>,

    /// Context that produced the message.
    pub src_id: U32<BigEndian>,

    /// Endpoint inside `dst_id`.
    pub handle: U32<BigEndian>,

    /// Endpoint inside `src_id` expecting the reply. 0 = no reply wanted.
    pub reply_to: U32<BigEndian>,

    /// Payload length in bytes, not including this header.
    pub length: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 24]);

impl FrameHeader {
    /// Check version and reserved bits, and the payload bound.
    pub fn validate(&self, max_message_size: usize) -> Result<(), WireError> {
        if self.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        if self.flags & !FLAG_DEAD != 0 {
            return Err(WireError::ReservedFlagsSet(self.flags));
        }
        let length = self.length.get() as usize;
        if length > max_message_size {
            return Err(WireError::PayloadTooLarge(length, max_message_size));
        }
        Ok(())
    }
}

// ── Well-known handles ───────────────────────────────────────────────────────

/// Function-call executor.
pub const CALL_FUNCTION: Handle = 101;

/// Log records forwarded from a child to the master.
pub const FORWARD_LOG: Handle = 102;

/// Notice that a context became reachable through the sending Stream.
pub const ADD_ROUTE: Handle = 103;

/// Request for a fresh, master-unique context id.
pub const ALLOCATE_ID: Handle = 104;

/// Request that the receiving context shut its broker down.
pub const SHUTDOWN: Handle = 106;

/// First handle handed out by the dynamic allocator.
pub const FIRST_DYNAMIC_HANDLE: Handle = 1000;

/// Context id of the master.
pub const MASTER_ID: ContextId = 0;

// ── Constants ────────────────────────────────────────────────────────────────

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// `flags` bit marking a dead (closed-channel) message.
pub const FLAG_DEAD: u8 = 0x01;

/// Size of `FrameHeader` on the wire.
pub const HEADER_LEN: usize = 24;

/// Default upper bound on one payload: 128 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Line printed by a child once it is ready for framed traffic.
pub const BOOT_SENTINEL: &str = "EC0";

/// Default bootstrap deadline in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

// ── Frame decoder ────────────────────────────────────────────────────────────

/// Accumulates raw bytes and yields complete frames in arrival order.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Append bytes read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// The header is validated as soon as it is complete, so an oversized
    /// length is rejected before its payload is waited for.
    pub fn next_frame(&mut self) -> Result<Option<(FrameHeader, Bytes)>, WireError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = FrameHeader::read_from_prefix(&self.buf[..HEADER_LEN])
            .ok_or(WireError::Truncated(self.buf.len()))?;
        header.validate(self.max_message_size)?;

        let length = header.length.get() as usize;
        if self.buf.len() < HEADER_LEN + length {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(length).freeze();
        Ok(Some((header, payload)))
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("payload length {0} exceeds maximum {1}")]
    PayloadTooLarge(usize, usize),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("frame header truncated at {0} bytes")]
    Truncated(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
