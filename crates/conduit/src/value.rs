//! Live values passed to and returned from remote calls.
//!
//! `Value` mirrors the wire `Tagged` shape, except that context references
//! are bound to a router and call records carry live arguments. Named
//! objects are only rebuilt when their type is registered locally.

use std::collections::BTreeMap;

use bytes::Bytes;
use conduit_core::value::{self as codec, CodecError, ContextRef, ObjectRecord, Tagged};
use dashmap::DashSet;

use crate::call::{CallError, FunctionCall};
use crate::context::Context;
use crate::router::Router;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    /// The dead sentinel, as an ordinary value.
    Dead,
    Context(Context),
    Call(FunctionCall),
    Failure(CallError),
    Object(Object),
}

/// An instance of a named type.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub module: String,
    pub name: String,
    pub state: Box<Value>,
}

impl Object {
    pub fn new(module: impl Into<String>, name: impl Into<String>, state: Value) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            state: Box::new(state),
        }
    }
}

impl Value {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Dead => "dead",
            Value::Context(_) => "context",
            Value::Call(_) => "call",
            Value::Failure(_) => "failure",
            Value::Object(_) => "object",
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Value::Dead)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_context(&self) -> Option<&Context> {
        match self {
            Value::Context(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_tagged(self) -> Tagged {
        match self {
            Value::None => Tagged::None,
            Value::Bool(b) => Tagged::Bool(b),
            Value::Int(i) => Tagged::Int(i),
            Value::Float(f) => Tagged::Float(f),
            Value::Str(s) => Tagged::Str(s),
            Value::Bytes(b) => Tagged::Bytes(b),
            Value::List(items) => Tagged::List(items.into_iter().map(Value::into_tagged).collect()),
            Value::Dict(map) => {
                Tagged::Dict(map.into_iter().map(|(k, v)| (k, v.into_tagged())).collect())
            }
            Value::Dead => Tagged::Dead,
            Value::Context(ctx) => Tagged::Context(ContextRef {
                context_id: ctx.context_id(),
                name: ctx.name().to_string(),
            }),
            Value::Call(call) => Tagged::Call(call.into_record()),
            Value::Failure(err) => Tagged::Failure(err.into_record()),
            Value::Object(obj) => Tagged::Object(ObjectRecord {
                module: obj.module,
                name: obj.name,
                state: Box::new(obj.state.into_tagged()),
            }),
        }
    }

    /// Rebuild a live value. Context references are bound to `router`.
    pub fn from_tagged(tagged: Tagged, router: &Router) -> Result<Value, CodecError> {
        Ok(match tagged {
            Tagged::None => Value::None,
            Tagged::Bool(b) => Value::Bool(b),
            Tagged::Int(i) => Value::Int(i),
            Tagged::Float(f) => Value::Float(f),
            Tagged::Str(s) => Value::Str(s),
            Tagged::Bytes(b) => Value::Bytes(b),
            Tagged::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| Value::from_tagged(item, router))
                    .collect::<Result<_, _>>()?,
            ),
            Tagged::Dict(map) => Value::Dict(
                map.into_iter()
                    .map(|(k, v)| Ok((k, Value::from_tagged(v, router)?)))
                    .collect::<Result<_, CodecError>>()?,
            ),
            Tagged::Dead => Value::Dead,
            Tagged::Context(r) => Value::Context(router.context(r.context_id, r.name)),
            Tagged::Call(record) => Value::Call(FunctionCall::from_record(record, router)?),
            Tagged::Failure(record) => Value::Failure(CallError::from(record)),
            Tagged::Object(record) => {
                if !router.types().contains(&record.module, &record.name) {
                    return Err(CodecError::UnknownType {
                        module: record.module,
                        name: record.name,
                    });
                }
                Value::Object(Object {
                    module: record.module,
                    name: record.name,
                    state: Box::new(Value::from_tagged(*record.state, router)?),
                })
            }
            Tagged::Unencodable(reason) => return Err(CodecError::Unencodable(reason)),
        })
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

value_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int,
    u32 => Int,
    f64 => Float,
    String => Str,
    &str => Str,
    Vec<u8> => Bytes,
    Vec<Value> => List,
    Context => Context,
    Object => Object,
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

/// Named object types this side is willing to rebuild.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: DashSet<(String, String)>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: impl Into<String>, name: impl Into<String>) {
        self.types.insert((module.into(), name.into()));
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.types.contains(&(module.to_string(), name.to_string()))
    }
}

/// Encode a payload, refusing anything larger than `max_message_size`.
pub(crate) fn encode_payload(tagged: &Tagged, max_message_size: usize) -> Result<Bytes, CodecError> {
    let data = codec::encode(tagged)?;
    if data.len() > max_message_size {
        return Err(CodecError::TooLarge(data.len(), max_message_size));
    }
    Ok(Bytes::from(data))
}

// ── Argument extraction ──────────────────────────────────────────────────────

/// A value had the wrong shape for where it was used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected}, got {got}")]
pub struct ArgumentError {
    pub expected: &'static str,
    pub got: String,
}

impl ArgumentError {
    pub fn new(expected: &'static str, got: impl Into<String>) -> Self {
        Self {
            expected,
            got: got.into(),
        }
    }
}

/// Conversion out of a `Value`.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ArgumentError>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ArgumentError> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, ArgumentError> {
        match value {
            Value::Int(i) => Ok(i),
            other => Err(ArgumentError::new("int", other.kind())),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, ArgumentError> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(i) => Ok(i as f64),
            other => Err(ArgumentError::new("float", other.kind())),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, ArgumentError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(ArgumentError::new("bool", other.kind())),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, ArgumentError> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(ArgumentError::new("str", other.kind())),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, ArgumentError> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(ArgumentError::new("bytes", other.kind())),
        }
    }
}

impl FromValue for Context {
    fn from_value(value: Value) -> Result<Self, ArgumentError> {
        match value {
            Value::Context(c) => Ok(c),
            other => Err(ArgumentError::new("context", other.kind())),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, ArgumentError> {
        match value {
            Value::None => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, ArgumentError> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(ArgumentError::new("list", other.kind())),
        }
    }
}
