//! Functions every child serves regardless of what the host program adds.

use std::collections::BTreeMap;

use crate::call::{CallArgs, CallFailure, FunctionRegistry};
use crate::router::ConnectOptions;
use crate::stream::local::LocalTransport;
use crate::value::Value;

/// Echo the arguments back as a list.
pub const PING: &str = "conduit.ping";

/// Describe the running context.
pub const IDENTITY: &str = "conduit.identity";

/// Start a grandchild on this host from the running executable.
pub const CONNECT_LOCAL: &str = "conduit.connect_local";

pub fn register(functions: &FunctionRegistry) {
    functions.register(PING, ping);
    functions.register(IDENTITY, identity);
    functions.register(CONNECT_LOCAL, connect_local);
}

fn ping(args: &mut CallArgs) -> Result<Value, CallFailure> {
    Ok(Value::List(args.rest()))
}

fn identity(args: &mut CallArgs) -> Result<Value, CallFailure> {
    let identity = args.router().identity();
    let mut out = BTreeMap::new();
    out.insert("context_id".to_string(), Value::from(identity.context_id()));
    out.insert(
        "parent_ids".to_string(),
        Value::List(identity.parent_ids().iter().map(|&id| Value::from(id)).collect()),
    );
    out.insert("name".to_string(), Value::from(identity.name()));
    out.insert("pid".to_string(), Value::from(std::process::id()));
    Ok(Value::Dict(out))
}

fn connect_local(args: &mut CallArgs) -> Result<Value, CallFailure> {
    let name: Option<String> = args.kwarg("name")?;
    let mut options = ConnectOptions::default().child_path(std::env::current_exe()?);
    if let Some(name) = name {
        options = options.name(name);
    }
    let context = args.router().connect(LocalTransport::new(), options)?;
    Ok(Value::Context(context))
}
