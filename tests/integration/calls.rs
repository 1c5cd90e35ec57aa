//! Function calls that succeed.

use std::collections::BTreeMap;

use anyhow::Result;
use conduit::{Context, Value};

use crate::{Master, PATIENCE};

#[test]
fn test_add_returns_sum() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("adder")?;
    assert_eq!(child.call("fixture.add", vec![1.into(), 2.into()])?, Value::Int(3));
    Ok(())
}

#[test]
fn test_keyword_arguments() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("adder")?;
    let mut kwargs = BTreeMap::new();
    kwargs.insert("scale".to_string(), Value::Int(10));
    let sum = child.call_with_kwargs("fixture.add", vec![1.into(), 2.into()], kwargs)?;
    assert_eq!(sum, Value::Int(30));
    Ok(())
}

/// The dead sentinel is an ordinary return value, not a closed channel.
#[test]
fn test_dead_is_returned_as_a_value() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("dead")?;
    assert_eq!(child.call("fixture.return_dead", vec![])?, Value::Dead);
    Ok(())
}

#[test]
fn test_ping_echoes_arguments() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("ping")?;
    let reply = child.call("conduit.ping", vec!["a".into(), Value::Bytes(vec![1, 2])])?;
    assert_eq!(reply, Value::List(vec!["a".into(), Value::Bytes(vec![1, 2])]));
    Ok(())
}

#[test]
fn test_identity_matches_handle() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("who")?;
    let Value::Dict(identity) = child.call("conduit.identity", vec![])? else {
        panic!("identity should be a dict");
    };
    assert_eq!(identity["context_id"], Value::from(child.context_id()));
    assert_eq!(identity["name"], Value::from("who"));
    assert_eq!(identity["parent_ids"], Value::List(vec![Value::Int(0)]));
    Ok(())
}

/// A context handle sent out and back is equal to the original but is a
/// new handle.
#[test]
fn test_context_round_trip() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("echo")?;
    let back = child.call("fixture.echo", vec![Value::Context(child.clone())])?;
    let Value::Context(back) = back else {
        panic!("expected a context, got {back:?}");
    };
    assert_eq!(back, child);
    assert_eq!(back.context_id(), child.context_id());
    assert_eq!(back.name(), child.name());
    assert!(!Context::ptr_eq(&back, &child));
    Ok(())
}

/// Replies are matched to their own calls even when they overlap.
#[test]
fn test_overlapping_calls() -> Result<()> {
    let master = Master::start()?;
    let a = master.local("a")?;
    let b = master.local("b")?;
    let pending: Vec<_> = (0..8)
        .map(|i| {
            let ctx = if i % 2 == 0 { &a } else { &b };
            ctx.call_async("fixture.add", vec![Value::Int(i), Value::Int(100)])
        })
        .collect::<conduit::Result<_>>()?;
    for (i, rx) in pending.into_iter().enumerate() {
        assert_eq!(rx.get(Some(PATIENCE))?, Value::Int(i as i64 + 100));
    }
    Ok(())
}
