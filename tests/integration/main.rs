//! conduit integration test harness.
//!
//! Every test starts its own master router and real child processes built
//! from this package's binaries:
//!
//!   fixture-child   serves the `fixture.*` functions plus the built-ins
//!   fake-sudo       answers like sudo on a pty, then execs the child
//!
//! Nothing here needs root or network access. Each test owns its master;
//! dropping the `Master` shuts the tree down and waits for the broker.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use conduit::conduit_core::config::ConduitConfig;
use conduit::{ConnectOptions, Context, LocalTransport, Router};

mod calls;
mod failures;
mod lifecycle;
mod routing;
mod sudo;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const FIXTURE_CHILD: &str = env!("CARGO_BIN_EXE_fixture-child");
pub const FAKE_SUDO: &str = env!("CARGO_BIN_EXE_fake-sudo");

/// How long a test waits for anything that should be quick.
pub const PATIENCE: Duration = Duration::from_secs(10);

pub struct Master {
    pub router: Router,
}

impl Master {
    pub fn start() -> Result<Self> {
        Self::with_config(ConduitConfig::default())
    }

    pub fn with_config(mut config: ConduitConfig) -> Result<Self> {
        conduit::logging::init();
        config.child.child_path = FIXTURE_CHILD.to_string();
        let router = Router::start_master(config).context("failed to start master")?;
        Ok(Self { router })
    }

    pub fn options(&self) -> ConnectOptions {
        ConnectOptions::default().child_path(PathBuf::from(FIXTURE_CHILD))
    }

    /// Start a fixture child on this host.
    pub fn local(&self, name: &str) -> Result<Context> {
        self.router
            .connect(LocalTransport::new(), self.options().name(name))
            .with_context(|| format!("failed to connect {name}"))
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.router.shutdown();
        self.router.broker().join();
    }
}

/// Poll `check` until it returns true or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    bail!("condition not met within {timeout:?}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The two binaries the tests drive must exist before anything else runs.
#[test]
fn test_fixture_binaries_built() {
    assert!(PathBuf::from(FIXTURE_CHILD).is_file(), "missing {FIXTURE_CHILD}");
    assert!(PathBuf::from(FAKE_SUDO).is_file(), "missing {FAKE_SUDO}");
}

/// A child started and dropped with nothing else happening shuts down
/// cleanly.
#[test]
fn test_master_starts_and_stops() -> Result<()> {
    let master = Master::start()?;
    let child = master.local("idle")?;
    assert_eq!(child.name(), "idle");
    assert!(child.context_id() > 0);
    drop(master);
    Ok(())
}
