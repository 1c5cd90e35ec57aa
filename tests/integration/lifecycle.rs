//! Disconnects, shutdown and timeouts while calls are outstanding.

use std::time::Duration;

use anyhow::Result;
use conduit::{Error, Value, LOCAL_DISCONNECT_MSG};

use crate::{wait_until, Master, PATIENCE};

fn assert_local_disconnect(result: conduit::Result<Value>) {
    match result {
        Err(Error::Channel(msg)) => assert_eq!(msg, LOCAL_DISCONNECT_MSG),
        other => panic!("expected a locally closed channel, got {other:?}"),
    }
}

#[test]
fn test_forced_disconnect_fails_pending_call() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("sleeper")?;
    let pending = child.call_async("fixture.sleep", vec![Value::Float(30.0)])?;
    master.router.disconnect(&child)?;
    assert_local_disconnect(pending.get(Some(PATIENCE)));
    Ok(())
}

#[test]
fn test_shutdown_fails_pending_call() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("sleeper")?;
    let pending = child.call_async("fixture.sleep", vec![Value::Float(30.0)])?;
    master.router.shutdown();
    assert_local_disconnect(pending.get(Some(PATIENCE)));
    Ok(())
}

#[test]
fn test_call_timeout() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("slow")?;
    let err = child
        .call_timeout("fixture.sleep", vec![Value::Float(5.0)], Duration::from_millis(200))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err:?}");
    Ok(())
}

/// After a disconnect the child is unreachable rather than hanging.
#[test]
fn test_calls_after_disconnect_fail() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("gone")?;
    master.router.disconnect(&child)?;
    wait_until(PATIENCE, || child.call("fixture.add", vec![1.into(), 1.into()]).is_err())?;
    match child.call("fixture.add", vec![1.into(), 1.into()]) {
        Err(Error::Undeliverable(reason)) => {
            assert!(reason.contains(&format!("no route to context {}", child.context_id())))
        }
        other => panic!("expected undeliverable, got {other:?}"),
    }
    Ok(())
}

/// A child asked to shut down closes its stream; the master notices.
#[test]
fn test_child_shutdown_on_request() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("polite")?;
    child.shutdown()?;
    wait_until(PATIENCE, || {
        matches!(
            child.call_timeout("conduit.ping", vec![], Duration::from_secs(1)),
            Err(Error::Undeliverable(_)) | Err(Error::Channel(_))
        )
    })?;
    Ok(())
}

/// Other children are untouched when one goes away.
#[test]
fn test_siblings_survive_disconnect() -> Result<()> {
    let master = Master::start()?;
    let doomed = master.local("doomed")?;
    let survivor = master.local("survivor")?;
    master.router.disconnect(&doomed)?;
    assert_eq!(survivor.call("fixture.add", vec![3.into(), 4.into()])?, Value::Int(7));
    Ok(())
}
