//! Remote function calls: the call record, the failure a callee reports,
//! and the registry of functions a context is willing to run.

use std::backtrace::Backtrace;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use conduit_core::value::{CallRecord, CodecError, FailureRecord};
use dashmap::DashMap;

use crate::router::Router;
use crate::value::{ArgumentError, FromValue, Value};

/// A request to run `module.function` somewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub module: String,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl FunctionCall {
    /// `name` is split at its last '.' into module and function.
    pub fn new(name: &str, args: Vec<Value>) -> Self {
        let (module, function) = match name.rsplit_once('.') {
            Some((module, function)) => (module.to_string(), function.to_string()),
            None => (String::new(), name.to_string()),
        };
        Self {
            module,
            function,
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn qualified_name(&self) -> String {
        if self.module.is_empty() {
            self.function.clone()
        } else {
            format!("{}.{}", self.module, self.function)
        }
    }

    pub(crate) fn into_record(self) -> CallRecord {
        CallRecord {
            module: self.module,
            function: self.function,
            args: self.args.into_iter().map(Value::into_tagged).collect(),
            kwargs: self
                .kwargs
                .into_iter()
                .map(|(k, v)| (k, v.into_tagged()))
                .collect(),
        }
    }

    pub(crate) fn from_record(record: CallRecord, router: &Router) -> Result<Self, CodecError> {
        Ok(Self {
            module: record.module,
            function: record.function,
            args: record
                .args
                .into_iter()
                .map(|a| Value::from_tagged(a, router))
                .collect::<Result<_, _>>()?,
            kwargs: record
                .kwargs
                .into_iter()
                .map(|(k, v)| Ok((k, Value::from_tagged(v, router)?)))
                .collect::<Result<_, CodecError>>()?,
        })
    }
}

// ── Failures ─────────────────────────────────────────────────────────────────

/// A remote function failed. Carries the callee's error type name, its
/// message and a textual traceback; never the error value itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub type_name: String,
    pub message: String,
    pub traceback: String,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}\n{}", self.type_name, self.message, self.traceback)
    }
}

impl std::error::Error for CallError {}

impl From<FailureRecord> for CallError {
    fn from(r: FailureRecord) -> Self {
        Self {
            type_name: r.type_name,
            message: r.message,
            traceback: r.traceback,
        }
    }
}

impl CallError {
    pub(crate) fn into_record(self) -> FailureRecord {
        FailureRecord {
            type_name: self.type_name,
            message: self.message,
            traceback: self.traceback,
        }
    }
}

/// What a registered function returns on failure. Any error converts into
/// it with `?`; the error's type name, message, cause chain and a
/// backtrace are captured at that point.
#[derive(Debug)]
pub struct CallFailure {
    type_name: String,
    message: String,
    traceback: String,
}

impl<E> From<E> for CallFailure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let mut traceback = String::new();
        let mut source = err.source();
        while let Some(cause) = source {
            let _ = writeln!(traceback, "caused by: {cause}");
            source = cause.source();
        }
        let _ = write!(traceback, "{}", Backtrace::force_capture());
        Self {
            type_name: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            traceback,
        }
    }
}

impl CallFailure {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prefix the traceback with the call site that produced it.
    pub(crate) fn in_function(mut self, function: &str, context: &str) -> Self {
        self.traceback = format!("  in {function} on {context}\n{}", self.traceback);
        self
    }

    pub(crate) fn into_record(self) -> FailureRecord {
        FailureRecord {
            type_name: self.type_name,
            message: self.message,
            traceback: self.traceback,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub type Function = Arc<dyn Fn(&mut CallArgs) -> Result<Value, CallFailure> + Send + Sync>;

/// Functions a context will run on request, keyed by "module.function".
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: Arc<DashMap<String, Function>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&mut CallArgs) -> Result<Value, CallFailure> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(function = %name, "function registered");
        self.functions.insert(name, Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<Function> {
        self.functions.get(name).map(|f| f.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Arguments of one call, consumed in order by the function.
pub struct CallArgs {
    args: VecDeque<Value>,
    kwargs: BTreeMap<String, Value>,
    router: Router,
}

impl CallArgs {
    pub(crate) fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>, router: Router) -> Self {
        Self {
            args: args.into(),
            kwargs,
            router,
        }
    }

    /// The next positional argument.
    pub fn next<T: FromValue>(&mut self) -> Result<T, ArgumentError> {
        match self.args.pop_front() {
            Some(value) => T::from_value(value),
            None => Err(ArgumentError::new("an argument", "nothing")),
        }
    }

    pub fn kwarg<T: FromValue>(&mut self, name: &str) -> Result<Option<T>, ArgumentError> {
        self.kwargs.remove(name).map(T::from_value).transpose()
    }

    /// Every positional argument not yet taken.
    pub fn rest(&mut self) -> Vec<Value> {
        self.args.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// The router of the context running the call.
    pub fn router(&self) -> &Router {
        &self.router
    }
}
