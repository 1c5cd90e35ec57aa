//! Children started through a password-prompting helper on a pty.

use std::time::Duration;

use anyhow::Result;
use conduit::{Error, SudoTransport, Value};

use crate::{Master, FAKE_SUDO};

fn fake_sudo(helper_args: &[&str]) -> SudoTransport {
    SudoTransport::new()
        .sudo_path(FAKE_SUDO)
        .sudo_args(helper_args.iter().copied())
}

#[test]
fn test_password_prompt_answered() -> Result<()> {
    let master = Master::start()?;
    let child = master
        .router
        .connect(
            fake_sudo(&["--password", "s3cret"]).password("s3cret"),
            master.options(),
        )?;
    assert_eq!(child.name(), "sudo.root");
    assert_eq!(child.call("fixture.add", vec![1.into(), 2.into()])?, Value::Int(3));
    Ok(())
}

#[test]
fn test_no_prompt_needs_no_password() -> Result<()> {
    let master = Master::start()?;
    let child = master.router.connect(fake_sudo(&[]), master.options().name("nopasswd"))?;
    assert_eq!(child.call("conduit.ping", vec![])?, Value::List(vec![]));
    Ok(())
}

#[test]
fn test_wrong_password() -> Result<()> {
    let master = Master::start()?;
    let err = master
        .router
        .connect(
            fake_sudo(&["--password", "s3cret"]).password("guess"),
            master.options(),
        )
        .unwrap_err();
    match err {
        Error::Password(msg) => assert_eq!(msg, "sudo password is incorrect"),
        other => panic!("expected a password error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_missing_password() -> Result<()> {
    let master = Master::start()?;
    let err = master
        .router
        .connect(fake_sudo(&["--password", "s3cret"]), master.options())
        .unwrap_err();
    match err {
        Error::Password(msg) => assert_eq!(msg, "sudo password is required"),
        other => panic!("expected a password error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_silent_helper_hits_deadline() -> Result<()> {
    let master = Master::start()?;
    let err = master
        .router
        .connect(
            fake_sudo(&["--stall"]),
            master.options().connect_timeout(Duration::from_millis(500)),
        )
        .unwrap_err();
    assert!(err.is_bootstrap());
    match err {
        Error::Stream(msg) => assert!(msg.starts_with("bootstrap failed"), "{msg}"),
        other => panic!("expected a stream error, got {other:?}"),
    }
    Ok(())
}
