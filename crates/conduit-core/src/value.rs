//! Tagged value encoding — the payload format of routed messages.
//!
//! `Tagged` is the on-wire shape of every value the call layer moves:
//! primitives, opaque blobs, containers, and four records (context
//! reference, function call, call failure, named object). It is encoded
//! as MessagePack. The runtime crate converts between `Tagged` and its
//! live `Value`, which is where context references are bound to a router
//! and named objects are checked against the types a side can rebuild.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::wire::ContextId;

/// A value as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tagged {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    List(Vec<Tagged>),
    Dict(BTreeMap<String, Tagged>),
    /// The dead sentinel.
    Dead,
    Context(ContextRef),
    Call(CallRecord),
    Failure(FailureRecord),
    Object(ObjectRecord),
    /// Stand-in sent when the real value could not be encoded by the sender.
    Unencodable(String),
}

/// Reference to a context, rebuilt as a live handle on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    pub context_id: ContextId,
    pub name: String,
}

/// A request to invoke `module.function` with positional and keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub module: String,
    pub function: String,
    pub args: Vec<Tagged>,
    pub kwargs: BTreeMap<String, Tagged>,
}

/// A failure raised by the callee. Never carries the original error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Fully qualified type name of the callee's error.
    pub type_name: String,
    pub message: String,
    pub traceback: String,
}

/// An instance of a named type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub module: String,
    pub name: String,
    pub state: Box<Tagged>,
}

/// Encode a value to MessagePack.
pub fn encode(value: &Tagged) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a MessagePack payload.
pub fn decode(data: &[u8]) -> Result<Tagged, CodecError> {
    rmp_serde::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("cannot encode value: {0}")]
    Encode(String),

    #[error("cannot decode value: {0}")]
    Decode(String),

    #[error("cannot reconstruct '{module}'/'{name}'")]
    UnknownType { module: String, name: String },

    #[error("sender could not encode value: {0}")]
    Unencodable(String),

    #[error("encoded value of {0} bytes exceeds maximum {1}")]
    TooLarge(usize, usize),
}
