//! Error type shared by every public conduit operation.

use conduit_core::config::ConfigError;
use conduit_core::identity::BootError;
use conduit_core::value::CodecError;
use conduit_core::wire::WireError;

use crate::call::CallError;

/// Text carried by `Error::Channel` when this process tore the channel down.
pub const LOCAL_DISCONNECT_MSG: &str = "Channel closed by local end.";

/// Text carried by `Error::Channel` when the peer closed the channel.
pub const REMOTE_DISCONNECT_MSG: &str = "Channel closed by remote end.";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure: spawn, bootstrap, framing, or a value that could
    /// not be encoded or rebuilt.
    #[error("{0}")]
    Stream(String),

    /// Credential prompt could not be answered.
    #[error("{0}")]
    Password(String),

    /// The channel a caller was waiting on was closed.
    #[error("{0}")]
    Channel(String),

    /// The remote function failed.
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("undeliverable message: {0}")]
    Undeliverable(String),

    #[error("timed out waiting for reply")]
    Timeout,

    #[error("broker: {0}")]
    BrokerState(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Boot(#[from] BootError),
}

impl Error {
    /// True for failures raised while a connection was being established.
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Error::Stream(_) | Error::Password(_))
    }

    pub(crate) fn local_disconnect() -> Self {
        Error::Channel(LOCAL_DISCONNECT_MSG.to_string())
    }

    pub(crate) fn remote_disconnect() -> Self {
        Error::Channel(REMOTE_DISCONNECT_MSG.to_string())
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Stream(e.to_string())
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Stream(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_and_stream_errors_are_bootstrap_errors() {
        assert!(Error::Password("sudo password is required".into()).is_bootstrap());
        assert!(Error::Stream("EOF".into()).is_bootstrap());
        assert!(!Error::Timeout.is_bootstrap());
        assert!(!Error::local_disconnect().is_bootstrap());
    }

    #[test]
    fn codec_errors_become_stream_errors() {
        let err: Error = CodecError::UnknownType {
            module: "__main__".into(),
            name: "CrazyType".into(),
        }
        .into();
        assert!(matches!(err, Error::Stream(ref m) if m == "cannot reconstruct '__main__'/'CrazyType'"));
    }

    #[test]
    fn channel_messages_are_fixed() {
        assert_eq!(Error::local_disconnect().to_string(), LOCAL_DISCONNECT_MSG);
        assert_eq!(Error::remote_disconnect().to_string(), REMOTE_DISCONNECT_MSG);
    }
}
