//! Child started through sudo on a pty, answering one password prompt.

use std::io;

use conduit_core::config::SudoConfig;

use crate::error::Error;
use crate::stream::spawn::{self, Spawned};
use crate::stream::transport::{CredentialPrompt, HandshakeAction, Transport};

#[derive(Debug, Clone)]
pub struct SudoTransport {
    username: String,
    sudo_path: String,
    /// Extra arguments placed before the `--` separator.
    sudo_args: Vec<String>,
    prompt: CredentialPrompt,
}

impl SudoTransport {
    pub fn new() -> Self {
        Self::from_config(&SudoConfig::default())
    }

    pub fn from_config(config: &SudoConfig) -> Self {
        Self {
            username: config.username.clone(),
            sudo_path: config.sudo_path.clone(),
            sudo_args: Vec::new(),
            prompt: CredentialPrompt::new("sudo", None),
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn sudo_path(mut self, path: impl Into<String>) -> Self {
        self.sudo_path = path.into();
        self
    }

    pub fn sudo_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sudo_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.prompt = CredentialPrompt::new("sudo", Some(password.into()));
        self
    }
}

impl Default for SudoTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SudoTransport {
    fn name(&self) -> String {
        format!("sudo.{}", self.username)
    }

    fn build_argv(&self, child_argv: &[String]) -> Result<Vec<String>, Error> {
        if self.username.is_empty() {
            return Err(Error::Stream("sudo: username must not be empty".into()));
        }
        let mut argv = vec![
            self.sudo_path.clone(),
            "-u".to_string(),
            self.username.clone(),
            "-H".to_string(),
        ];
        argv.extend(self.sudo_args.iter().cloned());
        argv.push("--".to_string());
        argv.extend_from_slice(child_argv);
        Ok(argv)
    }

    fn spawn(&self, argv: &[String]) -> io::Result<Spawned> {
        spawn::spawn_pty(argv)
    }

    fn on_handshake_line(&mut self, line: &str) -> Result<HandshakeAction, Error> {
        self.prompt.on_line(line)
    }
}
