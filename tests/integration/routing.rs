//! Messages that cross more than one stream.

use std::collections::BTreeMap;

use anyhow::Result;
use conduit::{Context, Error, Value};

use crate::{wait_until, Master, PATIENCE};

fn connect_grandchild(child: &Context, name: &str) -> Result<Context> {
    let mut kwargs = BTreeMap::new();
    kwargs.insert("name".to_string(), Value::from(name));
    match child.call_with_kwargs("conduit.connect_local", vec![], kwargs)? {
        Value::Context(ctx) => Ok(ctx),
        other => anyhow::bail!("expected a context, got {other:?}"),
    }
}

/// The master reaches a grandchild through the child that started it.
#[test]
fn test_grandchild_is_routed_through_child() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("child")?;
    let grandchild = connect_grandchild(&child, "grandchild")?;
    assert_eq!(grandchild.name(), "grandchild");
    assert_ne!(grandchild.context_id(), child.context_id());

    assert_eq!(grandchild.call("fixture.add", vec![2.into(), 3.into()])?, Value::Int(5));

    let Value::Dict(identity) = grandchild.call("conduit.identity", vec![])? else {
        panic!("identity should be a dict");
    };
    assert_eq!(
        identity["parent_ids"],
        Value::List(vec![Value::from(child.context_id()), Value::Int(0)])
    );
    Ok(())
}

/// Losing a child loses everything behind it.
#[test]
fn test_grandchild_lost_with_child() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("child")?;
    let grandchild = connect_grandchild(&child, "grandchild")?;
    master.router.disconnect(&child)?;
    wait_until(PATIENCE, || {
        matches!(
            grandchild.call("conduit.ping", vec![]),
            Err(Error::Undeliverable(_))
        )
    })?;
    Ok(())
}

/// One child calls another; the request and reply pass through the master.
#[test]
fn test_child_calls_sibling() -> Result<()> {
    let master = Master::start()?;
    let a = master.local("a")?;
    let b = master.local("b")?;
    let sum = a.call(
        "fixture.relay",
        vec![Value::Context(b), "fixture.add".into(), 20.into(), 22.into()],
    )?;
    assert_eq!(sum, Value::Int(42));
    Ok(())
}

/// A message to a context nobody knows comes back to its sender as a
/// failure naming the missing route.
#[test]
fn test_undeliverable_is_reflected_to_sender() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("lost")?;
    match child.call("fixture.relay", vec![999.into(), "conduit.ping".into()]) {
        Err(Error::Call(e)) => {
            assert_eq!(e.type_name, "conduit::error::Error");
            assert!(e.message.contains("no route to context 999"), "{}", e.message);
        }
        other => panic!("expected a call error, got {other:?}"),
    }
    Ok(())
}

/// A child can allocate ids for its own children from the master.
#[test]
fn test_ids_stay_unique_across_the_tree() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("child")?;
    let first = connect_grandchild(&child, "g1")?;
    let second = connect_grandchild(&child, "g2")?;
    let direct = master.local("direct")?;
    let mut ids = vec![
        child.context_id(),
        first.context_id(),
        second.context_id(),
        direct.context_id(),
    ];
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    Ok(())
}
