//! Calls and connections that fail, and what the caller sees.

use anyhow::Result;
use conduit::conduit_core::config::ConduitConfig;
use conduit::conduit_core::wire::CALL_FUNCTION;
use conduit::conduit_core::Message;
use conduit::{ConnectOptions, Error, LocalTransport, Receiver, Value};

use crate::{Master, PATIENCE};

#[test]
fn test_remote_error_carries_type_and_message() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("failing")?;
    match child.call("fixture.fail_value", vec![]) {
        Err(Error::Call(e)) => {
            assert_eq!(e.type_name, "fixture_child::ValueError");
            assert_eq!(e.message, "exception text");
            assert!(e.traceback.contains("in fixture.fail_value on failing"));
            assert!(e.to_string().starts_with("fixture_child::ValueError: exception text\n"));
        }
        other => panic!("expected a call error, got {other:?}"),
    }
    Ok(())
}

/// A named type the master does not know cannot be rebuilt.
#[test]
fn test_unknown_type_is_a_stream_error() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("crazy")?;
    match child.call("fixture.crazy", vec![]) {
        Err(Error::Stream(msg)) => assert_eq!(msg, "cannot reconstruct '__main__'/'CrazyType'"),
        other => panic!("expected a stream error, got {other:?}"),
    }
    Ok(())
}

/// Once the type is registered the same object comes back intact.
#[test]
fn test_registered_type_is_rebuilt() -> Result<()> {
    let master = Master::start()?;
    master.router.types().register("__main__", "CrazyType");
    let child = master.local("crazy")?;
    let Value::Object(obj) = child.call("fixture.crazy", vec![])? else {
        panic!("expected an object");
    };
    assert_eq!((obj.module.as_str(), obj.name.as_str()), ("__main__", "CrazyType"));
    Ok(())
}

#[test]
fn test_unknown_function() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("plain")?;
    match child.call("fixture.missing", vec![]) {
        Err(Error::Call(e)) => {
            assert_eq!(e.type_name, conduit::executor::UNKNOWN_FUNCTION);
            assert!(e.message.contains("fixture.missing"));
        }
        other => panic!("expected a call error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_panic_is_reported_and_child_survives() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("fragile")?;
    match child.call("fixture.explode", vec![]) {
        Err(Error::Call(e)) => {
            assert_eq!(e.type_name, conduit::executor::PANIC);
            assert_eq!(e.message, "fixture exploded");
        }
        other => panic!("expected a call error, got {other:?}"),
    }
    assert_eq!(child.call("fixture.add", vec![2.into(), 2.into()])?, Value::Int(4));
    Ok(())
}

#[test]
fn test_bad_argument_is_a_call_error() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("strict")?;
    match child.call("fixture.add", vec!["one".into(), 2.into()]) {
        Err(Error::Call(e)) => {
            assert!(e.type_name.ends_with("ArgumentError"), "{}", e.type_name);
            assert_eq!(e.message, "expected int, got str");
        }
        other => panic!("expected a call error, got {other:?}"),
    }
    Ok(())
}

/// A reply larger than the limit is replaced by a marker the caller
/// reports as a stream error.
#[test]
fn test_oversized_reply_is_unencodable() -> Result<()> {
    let mut config = ConduitConfig::default();
    config.broker.max_message_size = 4096;
    let master = Master::with_config(config)?;
    let child = master.local("blob")?;
    assert_eq!(child.call("fixture.blob", vec![16.into()])?, Value::Bytes(vec![0x5a; 16]));
    match child.call("fixture.blob", vec![10_000.into()]) {
        Err(Error::Stream(msg)) => assert!(msg.contains("exceeds maximum 4096"), "{msg}"),
        other => panic!("expected a stream error, got {other:?}"),
    }
    Ok(())
}

/// Raw messages over the limit are refused before they reach a stream.
#[test]
fn test_oversized_raw_message_is_refused() -> Result<()> {
    let mut config = ConduitConfig::default();
    config.broker.max_message_size = 4096;
    let master = Master::with_config(config)?;
    let child = master.local("guarded")?;

    let reply = Receiver::new(&master.router, Some(child.context_id()), false);
    let msg = Message::new(
        child.context_id(),
        master.router.context_id(),
        CALL_FUNCTION,
        vec![0u8; 10_000].into(),
    )
    .with_reply_to(reply.handle());
    master.router.route(msg)?;
    match reply.get(Some(PATIENCE)) {
        Err(Error::Undeliverable(reason)) => {
            assert_eq!(reason, "message of 10000 bytes exceeds maximum 4096")
        }
        other => panic!("expected undeliverable, got {other:?}"),
    }
    assert_eq!(child.call("fixture.add", vec![1.into(), 2.into()])?, Value::Int(3));
    Ok(())
}

#[test]
fn test_missing_child_program() -> Result<()> {
    let master = Master::start()?;
    let err = master
        .router
        .connect(
            LocalTransport::new(),
            ConnectOptions::default().child_path("/nonexistent/conduit-child"),
        )
        .unwrap_err();
    assert!(err.is_bootstrap(), "{err:?}");
    match err {
        Error::Stream(msg) => {
            assert!(msg.starts_with("failed to start /nonexistent/conduit-child"), "{msg}")
        }
        other => panic!("expected a stream error, got {other:?}"),
    }
    Ok(())
}

/// A program that exits without the sentinel fails the bootstrap with
/// whatever it printed.
#[test]
fn test_child_exits_before_sentinel() -> Result<()> {
    let master = Master::start()?;
    let err = master
        .router
        .connect(
            LocalTransport::new(),
            ConnectOptions::default().child_path("/bin/echo"),
        )
        .unwrap_err();
    match err {
        Error::Stream(msg) => assert!(msg.contains("--conduit-boot"), "{msg}"),
        other => panic!("expected a stream error, got {other:?}"),
    }
    Ok(())
}
