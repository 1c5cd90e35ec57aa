//! The seam between the fixed Stream state machine and the ways a child
//! can be started.

use std::io;

use bytes::Bytes;

use crate::error::Error;
use crate::stream::spawn::{self, Spawned};

/// What the handshake should do after a line of bootstrap output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    Continue,
    /// Write these bytes to the child.
    Reply(Bytes),
}

/// A way of starting a child: locally, through an escalation helper, or
/// through a remote shell.
pub trait Transport: Send {
    /// Default display name of the context this transport creates.
    fn name(&self) -> String;

    /// Wrap the child's own argv in whatever the transport needs.
    fn build_argv(&self, child_argv: &[String]) -> Result<Vec<String>, Error>;

    fn spawn(&self, argv: &[String]) -> io::Result<Spawned> {
        spawn::spawn_pipes(argv)
    }

    /// Inspect one line (or the unterminated tail) of bootstrap output.
    fn on_handshake_line(&mut self, _line: &str) -> Result<HandshakeAction, Error> {
        Ok(HandshakeAction::Continue)
    }
}

/// One-shot answer to a password prompt.
///
/// The first prompt is answered with the configured password, or fails if
/// there is none. A second prompt means the password was rejected.
#[derive(Debug, Clone)]
pub struct CredentialPrompt {
    helper: &'static str,
    password: Option<String>,
    answered: bool,
}

impl CredentialPrompt {
    pub fn new(helper: &'static str, password: Option<String>) -> Self {
        Self {
            helper,
            password,
            answered: false,
        }
    }

    pub fn on_line(&mut self, line: &str) -> Result<HandshakeAction, Error> {
        if !line.to_ascii_lowercase().contains("password") {
            return Ok(HandshakeAction::Continue);
        }
        if self.answered {
            return Err(Error::Password(format!("{} password is incorrect", self.helper)));
        }
        let Some(password) = self.password.as_deref() else {
            return Err(Error::Password(format!("{} password is required", self.helper)));
        };
        self.answered = true;
        tracing::debug!(helper = self.helper, "answering password prompt");
        Ok(HandshakeAction::Reply(Bytes::from(format!("{password}\n"))))
    }
}
