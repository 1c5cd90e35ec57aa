//! Routed message envelope.
//!
//! A `Message` is what the Router moves between contexts. Its payload is
//! opaque at this layer; the value codec (`crate::value`) gives it meaning.

use bytes::{Bytes, BytesMut};
use zerocopy::byteorder::U32;
use zerocopy::AsBytes;

use crate::wire::{ContextId, FrameHeader, Handle, FLAG_DEAD, FRAME_VERSION};

/// One addressed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Destination context.
    pub dst_id: ContextId,
    /// Originating context.
    pub src_id: ContextId,
    /// Endpoint inside `dst_id`.
    pub handle: Handle,
    /// Endpoint inside `src_id` that wants the reply.
    pub reply_to: Option<Handle>,
    /// Encoded payload.
    pub data: Bytes,
    /// The channel named by `handle` is closed; `data` is empty or a reason.
    pub is_dead: bool,
}

impl Message {
    pub fn new(dst_id: ContextId, src_id: ContextId, handle: Handle, data: Bytes) -> Self {
        Self {
            dst_id,
            src_id,
            handle,
            reply_to: None,
            data,
            is_dead: false,
        }
    }

    pub fn with_reply_to(mut self, reply_to: Handle) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// A dead message closing `handle` on `dst_id`. `reason` may be empty.
    pub fn dead(dst_id: ContextId, src_id: ContextId, handle: Handle, reason: &str) -> Self {
        Self {
            dst_id,
            src_id,
            handle,
            reply_to: None,
            data: Bytes::copy_from_slice(reason.as_bytes()),
            is_dead: true,
        }
    }

    /// Build the message replying to this one, or None if no reply is wanted.
    pub fn reply(&self, local_id: ContextId, data: Bytes) -> Option<Message> {
        self.reply_to
            .map(|handle| Message::new(self.src_id, local_id, handle, data))
    }

    /// Reason text carried by a dead message.
    pub fn dead_reason(&self) -> Option<String> {
        if !self.is_dead || self.data.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.data).into_owned())
    }

    /// Whether the payload fits both `max_len` and the header's length field.
    pub fn fits(&self, max_len: usize) -> bool {
        self.data.len() <= max_len && u32::try_from(self.data.len()).is_ok()
    }

    /// Serialize header and payload into one frame. Senders check `fits`
    /// first; a payload too long for the length field is a bug.
    pub fn to_frame(&self) -> Bytes {
        debug_assert!(u32::try_from(self.data.len()).is_ok(), "payload too long to frame");
        let header = FrameHeader {
            version: FRAME_VERSION,
            flags: if self.is_dead { FLAG_DEAD } else { 0 },
            reserved: [0; 2],
            dst_id: U32::new(self.dst_id),
            src_id: U32::new(self.src_id),
            handle: U32::new(self.handle),
            reply_to: U32::new(self.reply_to.unwrap_or(0)),
            length: U32::new(self.data.len() as u32),
        };
        let mut frame = BytesMut::with_capacity(header.as_bytes().len() + self.data.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&self.data);
        frame.freeze()
    }

    /// Rebuild a message from a validated header and its payload.
    pub fn from_frame(header: &FrameHeader, data: Bytes) -> Self {
        let reply_to = header.reply_to.get();
        Self {
            dst_id: header.dst_id.get(),
            src_id: header.src_id.get(),
            handle: header.handle.get(),
            reply_to: (reply_to != 0).then_some(reply_to),
            data,
            is_dead: header.flags & FLAG_DEAD != 0,
        }
    }
}
