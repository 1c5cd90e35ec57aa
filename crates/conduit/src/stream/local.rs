//! Plain local child over two pipes.

use crate::error::Error;
use crate::stream::transport::Transport;

#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    name: Option<String>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("local.{}", std::process::id()))
    }

    fn build_argv(&self, child_argv: &[String]) -> Result<Vec<String>, Error> {
        if child_argv.is_empty() {
            return Err(Error::Stream("local: empty child command".into()));
        }
        Ok(child_argv.to_vec())
    }
}
