//! conduit — run functions in child processes reached over pipes, sudo or
//! ssh, and route messages between every context in the resulting tree.
//!
//! The master builds a `Router` with `Router::start_master`, connects
//! children through a `Transport`, and calls registered functions on the
//! returned `Context` handles. Child programs hand their functions to
//! `child::run`.

pub mod broker;
pub mod builtins;
pub mod call;
pub mod child;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod receiver;
pub mod router;
pub mod side;
pub mod stream;
pub mod value;

pub use broker::Broker;
pub use call::{CallArgs, CallError, CallFailure, FunctionCall, FunctionRegistry};
pub use context::Context;
pub use error::{Error, Result, LOCAL_DISCONNECT_MSG, REMOTE_DISCONNECT_MSG};
pub use receiver::Receiver;
pub use router::{ConnectOptions, Router};
pub use stream::local::LocalTransport;
pub use stream::ssh::SshTransport;
pub use stream::sudo::SudoTransport;
pub use stream::transport::Transport;
pub use value::{ArgumentError, FromValue, Object, TypeRegistry, Value};

pub use conduit_core;
