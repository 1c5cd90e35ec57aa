//! Child started on a remote host through ssh, over pipes.

use conduit_core::config::SshConfig;

use crate::error::Error;
use crate::stream::transport::Transport;

#[derive(Debug, Clone)]
pub struct SshTransport {
    hostname: String,
    username: Option<String>,
    port: Option<u16>,
    ssh_path: String,
    ssh_args: Vec<String>,
}

impl SshTransport {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self::from_config(hostname, &SshConfig::default())
    }

    pub fn from_config(hostname: impl Into<String>, config: &SshConfig) -> Self {
        Self {
            hostname: hostname.into(),
            username: None,
            port: None,
            ssh_path: config.ssh_path.clone(),
            ssh_args: Vec::new(),
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn ssh_path(mut self, path: impl Into<String>) -> Self {
        self.ssh_path = path.into();
        self
    }

    pub fn ssh_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ssh_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Transport for SshTransport {
    fn name(&self) -> String {
        match &self.username {
            Some(user) => format!("ssh.{user}@{}", self.hostname),
            None => format!("ssh.{}", self.hostname),
        }
    }

    fn build_argv(&self, child_argv: &[String]) -> Result<Vec<String>, Error> {
        if self.hostname.is_empty() {
            return Err(Error::Stream("ssh: hostname must not be empty".into()));
        }
        let mut argv = vec![self.ssh_path.clone()];
        if let Some(user) = &self.username {
            argv.push("-l".to_string());
            argv.push(user.clone());
        }
        if let Some(port) = self.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        argv.extend(self.ssh_args.iter().cloned());
        argv.push(self.hostname.clone());
        // The remote end runs the command through a shell.
        argv.push(
            child_argv
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
        );
        Ok(argv)
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
