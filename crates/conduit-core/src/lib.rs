//! conduit-core — shared types, wire format, value codec and configuration.
//! The `conduit` runtime crate depends on this one.

pub mod config;
pub mod identity;
pub mod message;
pub mod value;
pub mod wire;

pub use identity::{BootInfo, Identity};
pub use message::Message;
pub use wire::{ContextId, Handle};
