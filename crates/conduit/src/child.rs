//! Child runtime — the entry point of every spawned context.
//!
//! The parent starts the child with its boot record on the command line
//! and talks to it over stdin/stdout. The child takes those descriptors
//! for itself, points the standard streams at /dev/null, announces itself
//! with the bootstrap sentinel and then serves calls until its parent goes
//! away or asks it to shut down.

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use conduit_core::config::ConduitConfig;
use conduit_core::identity::BootInfo;
use conduit_core::wire::BOOT_SENTINEL;

use crate::broker::Broker;
use crate::builtins;
use crate::call::FunctionRegistry;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::logging;
use crate::router::Router;

/// Run as a child context, serving `functions` plus the built-ins.
/// Returns once the broker has stopped.
pub fn run(functions: FunctionRegistry) -> Result<()> {
    let boot = BootInfo::from_args(std::env::args())?;
    let (receive, transmit) = take_stdio()
        .map_err(|e| Error::Stream(format!("failed to take over stdio: {e}")))?;
    let transmit = announce(transmit)
        .map_err(|e| Error::Stream(format!("failed to write {BOOT_SENTINEL}: {e}")))?;

    let mut config = ConduitConfig::default();
    config.broker.max_message_size = boot.max_message_size;
    config.child.log_level = boot.log_level.clone();

    let broker = Broker::new(config.broker.clone());
    broker.start()?;
    let router = Router::new(broker.clone(), boot.identity(), config)?;
    logging::init_forwarding(&router, &boot.log_level);
    install_panic_hook();

    builtins::register(&functions);
    // The call handler must exist before the parent's first frame is read.
    Executor::spawn(router.clone(), functions)?;
    router.attach_parent(receive, transmit)?;
    tracing::debug!(context_id = boot.context_id, name = %boot.name, "child ready");

    broker.join();
    Ok(())
}

/// Duplicate stdin and stdout for the parent stream, then point the
/// standard descriptors at /dev/null. Stderr is kept unless it is a
/// terminal.
fn take_stdio() -> io::Result<(OwnedFd, OwnedFd)> {
    let receive = io::stdin().as_fd().try_clone_to_owned()?;
    let transmit = io::stdout().as_fd().try_clone_to_owned()?;
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    redirect(&null, libc::STDIN_FILENO)?;
    redirect(&null, libc::STDOUT_FILENO)?;
    if io::stderr().is_terminal() {
        redirect(&null, libc::STDERR_FILENO)?;
    }
    Ok((receive, transmit))
}

fn redirect(null: &File, target: RawFd) -> io::Result<()> {
    // SAFETY: both descriptors are valid; dup2 atomically replaces target.
    if unsafe { libc::dup2(null.as_raw_fd(), target) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn announce(transmit: OwnedFd) -> io::Result<OwnedFd> {
    let mut file = File::from(transmit);
    file.write_all(format!("{BOOT_SENTINEL}\n").as_bytes())?;
    file.flush()?;
    Ok(OwnedFd::from(file))
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let thread = std::thread::current();
        tracing::error!(
            thread = thread.name().unwrap_or("<unnamed>"),
            "panic: {info}"
        );
    }));
}
