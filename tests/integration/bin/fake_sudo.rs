//! fake-sudo — behaves like sudo on a terminal without needing root.
//!
//!   fake-sudo -u USER -H [--password PW] [--stall] -- CHILD ARGS...
//!
//! With `--password`, prompts until the right password is typed (three
//! tries), then execs the child on the same terminal. `--stall` prints
//! nothing and never starts the child.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

fn read_line(input: &mut File) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if input.read(&mut byte)? == 0 || byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let split = args
        .iter()
        .position(|a| a == "--")
        .context("missing -- before the child command")?;
    let (options, child) = (&args[..split], &args[split + 1..]);
    if child.is_empty() {
        bail!("no child command");
    }

    let mut user = "root".to_string();
    let mut password = None;
    let mut stall = false;
    let mut opts = options.iter();
    while let Some(opt) = opts.next() {
        match opt.as_str() {
            "-u" => user = opts.next().context("-u needs a value")?.clone(),
            "--password" => password = Some(opts.next().context("--password needs a value")?.clone()),
            "--stall" => stall = true,
            _ => {}
        }
    }

    if stall {
        thread::sleep(Duration::from_secs(60));
        return Ok(());
    }

    if let Some(expected) = password {
        let mut input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
        let mut out = io::stdout();
        let mut accepted = false;
        for attempt in 0..3 {
            if attempt > 0 {
                write!(out, "\r\nSorry, try again.\r\n")?;
            }
            write!(out, "[sudo] password for {user}: ")?;
            out.flush()?;
            if read_line(&mut input)? == expected {
                accepted = true;
                break;
            }
        }
        if !accepted {
            bail!("3 incorrect password attempts");
        }
        write!(out, "\r\n")?;
        out.flush()?;
    }

    let err = Command::new(&child[0]).args(&child[1..]).exec();
    Err(err).with_context(|| format!("failed to exec {}", child[0]))
}
