//! Bootstrap handshake: line-oriented text until the child prints the
//! sentinel, after which the Stream switches to framed messages.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use conduit_core::wire::BOOT_SENTINEL;

use crate::error::Error;
use crate::stream::transport::{HandshakeAction, Transport};

/// Longest chunk of bootstrap output kept for error messages.
const LAST_OUTPUT_LIMIT: usize = 200;

#[derive(Debug)]
pub enum Progress {
    Pending,
    /// Sentinel seen. Carries the bytes that followed it.
    Connected(Bytes),
}

#[derive(Debug)]
pub struct Handshake {
    buf: BytesMut,
    deadline: Instant,
    timeout: Duration,
    last_output: String,
}

impl Handshake {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buf: BytesMut::new(),
            deadline: Instant::now() + timeout,
            timeout,
            last_output: String::new(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The most recent non-empty line the child printed.
    pub fn last_output(&self) -> &str {
        &self.last_output
    }

    /// Consume bootstrap output. Replies the transport wants written are
    /// appended to `replies`.
    pub fn feed(
        &mut self,
        data: &[u8],
        transport: &mut dyn Transport,
        replies: &mut Vec<Bytes>,
    ) -> Result<Progress, Error> {
        self.buf.extend_from_slice(data);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim_end_matches('\r');
            if text == BOOT_SENTINEL {
                tracing::debug!("bootstrap sentinel received");
                return Ok(Progress::Connected(self.buf.split().freeze()));
            }
            self.remember(text);
            tracing::debug!(line = %text, "bootstrap output");
            if let HandshakeAction::Reply(reply) = transport.on_handshake_line(text)? {
                replies.push(reply);
            }
        }

        // Prompts usually arrive without a trailing newline.
        if !self.buf.is_empty() {
            let tail = String::from_utf8_lossy(&self.buf).into_owned();
            if let HandshakeAction::Reply(reply) = transport.on_handshake_line(&tail)? {
                self.remember(&tail);
                self.buf.clear();
                replies.push(reply);
            }
        }
        Ok(Progress::Pending)
    }

    fn remember(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.last_output = text.chars().take(LAST_OUTPUT_LIMIT).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::spawn::Spawned;
    use crate::stream::transport::CredentialPrompt;

    struct Prompting(CredentialPrompt);

    impl Transport for Prompting {
        fn name(&self) -> String {
            "test".into()
        }
        fn build_argv(&self, child_argv: &[String]) -> Result<Vec<String>, Error> {
            Ok(child_argv.to_vec())
        }
        fn spawn(&self, _argv: &[String]) -> std::io::Result<Spawned> {
            Err(std::io::ErrorKind::Unsupported.into())
        }
        fn on_handshake_line(&mut self, line: &str) -> Result<HandshakeAction, Error> {
            self.0.on_line(line)
        }
    }

    fn transport(password: Option<&str>) -> Prompting {
        Prompting(CredentialPrompt::new("sudo", password.map(str::to_string)))
    }

    #[test]
    fn sentinel_completes_and_keeps_following_bytes() {
        let mut hs = Handshake::new(Duration::from_secs(10));
        let mut t = transport(None);
        let mut replies = Vec::new();

        let progress = hs.feed(b"motd line\r\nEC", &mut t, &mut replies).unwrap();
        assert!(matches!(progress, Progress::Pending));

        match hs.feed(b"0\r\n\x01\x02", &mut t, &mut replies).unwrap() {
            Progress::Connected(rest) => assert_eq!(&rest[..], b"\x01\x02"),
            other => panic!("expected connected, got {other:?}"),
        }
        assert_eq!(hs.last_output(), "motd line");
        assert!(replies.is_empty());
    }

    #[test]
    fn unterminated_prompt_is_answered_once() {
        let mut hs = Handshake::new(Duration::from_secs(10));
        let mut t = transport(Some("pw"));
        let mut replies = Vec::new();

        hs.feed(b"[sudo] password for alice: ", &mut t, &mut replies).unwrap();
        assert_eq!(replies, vec![Bytes::from_static(b"pw\n")]);

        // The newline echoed after the password must not re-trigger the prompt.
        let progress = hs.feed(b"\nEC0\n", &mut t, &mut replies).unwrap();
        assert!(matches!(progress, Progress::Connected(_)));
        assert_eq!(replies.len(), 1);
    }

    #[test]
    fn second_prompt_fails_as_incorrect() {
        let mut hs = Handshake::new(Duration::from_secs(10));
        let mut t = transport(Some("pw"));
        let mut replies = Vec::new();

        hs.feed(b"Password: ", &mut t, &mut replies).unwrap();
        let err = hs.feed(b"\nSorry, try again.\nPassword: ", &mut t, &mut replies).unwrap_err();
        assert_eq!(err.to_string(), "sudo password is incorrect");
        assert_eq!(hs.last_output(), "Sorry, try again.");
    }

    #[test]
    fn sentinel_must_be_a_whole_line() {
        let mut hs = Handshake::new(Duration::from_secs(10));
        let mut t = transport(None);
        let mut replies = Vec::new();
        let progress = hs.feed(b"xEC0\n", &mut t, &mut replies).unwrap();
        assert!(matches!(progress, Progress::Pending));
    }
}
