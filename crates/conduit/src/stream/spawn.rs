//! Child process creation: argv in, process plus two descriptors out.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use nix::pty::openpty;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};

/// A started child and the parent's ends of its stdio.
#[derive(Debug)]
pub struct Spawned {
    pub child: Child,
    /// Parent reads the child's output from here.
    pub receive: OwnedFd,
    /// Parent writes the child's input here.
    pub transmit: OwnedFd,
}

/// Start `argv` with a pipe on stdin and one on stdout. stderr is inherited.
pub fn spawn_pipes(argv: &[String]) -> io::Result<Spawned> {
    let mut cmd = command(argv)?;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    install_fd_sanitizer(&mut cmd, false);

    let mut child = cmd.spawn()?;
    let transmit = child
        .stdin
        .take()
        .map(OwnedFd::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdin was not captured"))?;
    let receive = child
        .stdout
        .take()
        .map(OwnedFd::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdout was not captured"))?;
    Ok(Spawned {
        child,
        receive,
        transmit,
    })
}

/// Start `argv` on a fresh pty that becomes its controlling terminal.
///
/// Both ends are put in raw mode so nothing the child prints is echoed
/// back or rewritten. The master is duplicated so each Side owns its own
/// descriptor.
pub fn spawn_pty(argv: &[String]) -> io::Result<Spawned> {
    let pty = openpty(None, None)?;
    make_raw(&pty.master)?;
    make_raw(&pty.slave)?;

    let mut cmd = command(argv)?;
    cmd.stdin(Stdio::from(pty.slave.try_clone()?))
        .stdout(Stdio::from(pty.slave.try_clone()?))
        .stderr(Stdio::from(pty.slave));
    install_fd_sanitizer(&mut cmd, true);

    let child = cmd.spawn()?;
    drop(cmd);
    let transmit = pty.master.try_clone()?;
    Ok(Spawned {
        child,
        receive: pty.master,
        transmit,
    })
}

fn command(argv: &[String]) -> io::Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

fn make_raw(fd: &OwnedFd) -> io::Result<()> {
    let mut termios = tcgetattr(fd)?;
    cfmakeraw(&mut termios);
    tcsetattr(fd, SetArg::TCSANOW, &termios)?;
    Ok(())
}

fn install_fd_sanitizer(cmd: &mut Command, controlling_tty: bool) {
    let upper = open_max();
    // SAFETY: `pre_exec` runs in the child after `fork` and before `exec`.
    // The closure only makes async-signal-safe libc calls and does not
    // allocate.
    unsafe {
        cmd.pre_exec(move || {
            if controlling_tty {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
            }
            // Marked rather than closed: std reports a failed exec through
            // a pipe among these descriptors.
            for fd in 3..upper {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
            Ok(())
        });
    }
}

/// Upper bound for the descriptor sweep, computed before fork.
fn open_max() -> i32 {
    // SAFETY: sysconf has no preconditions.
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max_fd > 0 && max_fd <= 65536 {
        max_fd as i32
    } else {
        1024
    }
}
