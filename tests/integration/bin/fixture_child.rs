//! fixture-child — child program used by the integration tests.

use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};

use conduit::{child, CallArgs, CallFailure, Context, FunctionRegistry, Object, Value};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ValueError(String);

fn add(args: &mut CallArgs) -> Result<Value, CallFailure> {
    let a: i64 = args.next()?;
    let b: i64 = args.next()?;
    let scale: i64 = args.kwarg("scale")?.unwrap_or(1);
    Ok(Value::Int((a + b) * scale))
}

fn fail_value(_: &mut CallArgs) -> Result<Value, CallFailure> {
    Err(ValueError("exception text".into()).into())
}

fn crazy(_: &mut CallArgs) -> Result<Value, CallFailure> {
    Ok(Value::Object(Object::new("__main__", "CrazyType", Value::None)))
}

fn return_dead(_: &mut CallArgs) -> Result<Value, CallFailure> {
    Ok(Value::Dead)
}

fn echo(args: &mut CallArgs) -> Result<Value, CallFailure> {
    Ok(args.next::<Value>()?)
}

fn sleep(args: &mut CallArgs) -> Result<Value, CallFailure> {
    let secs: f64 = args.next()?;
    thread::sleep(Duration::from_secs_f64(secs));
    Ok(Value::None)
}

fn blob(args: &mut CallArgs) -> Result<Value, CallFailure> {
    let len: i64 = args.next()?;
    Ok(Value::Bytes(vec![0x5a; len.max(0) as usize]))
}

fn explode(_: &mut CallArgs) -> Result<Value, CallFailure> {
    panic!("fixture exploded");
}

/// Call `function` on another context from inside this one.
fn relay(args: &mut CallArgs) -> Result<Value, CallFailure> {
    let target: Value = args.next()?;
    let function: String = args.next()?;
    let rest = args.rest();
    let target: Context = match target {
        Value::Context(ctx) => ctx,
        Value::Int(id) => args.router().context(id as u32, format!("context.{id}")),
        other => {
            return Err(CallFailure::new(
                "fixture::BadTarget",
                format!("cannot call into a {}", other.kind()),
            ))
        }
    };
    Ok(target.call(&function, rest)?)
}

fn main() -> Result<()> {
    let functions = FunctionRegistry::new();
    functions.register("fixture.add", add);
    functions.register("fixture.fail_value", fail_value);
    functions.register("fixture.crazy", crazy);
    functions.register("fixture.return_dead", return_dead);
    functions.register("fixture.echo", echo);
    functions.register("fixture.sleep", sleep);
    functions.register("fixture.blob", blob);
    functions.register("fixture.explode", explode);
    functions.register("fixture.relay", relay);
    child::run(functions).context("fixture child failed")
}
