//! Process identity — who this context is and where it sits in the tree.
//!
//! Built exactly once at process start: `Identity::master()` in the
//! controlling process, or decoded from the boot argument in a child. It
//! is passed by value into the router; nothing reads it from globals.

use serde::{Deserialize, Serialize};

use crate::wire::{ContextId, MASTER_ID};

/// Command-line flag carrying the hex-encoded `BootInfo`.
pub const BOOT_FLAG: &str = "--conduit-boot";

/// Immutable identity of the running context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    context_id: ContextId,
    /// Ancestors, nearest first. Empty in the master.
    parent_ids: Vec<ContextId>,
    name: String,
}

impl Identity {
    pub fn master() -> Self {
        Self {
            context_id: MASTER_ID,
            parent_ids: Vec::new(),
            name: "master".to_string(),
        }
    }

    pub fn child(context_id: ContextId, parent_ids: Vec<ContextId>, name: impl Into<String>) -> Self {
        Self {
            context_id,
            parent_ids,
            name: name.into(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.parent_ids.is_empty()
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn parent_id(&self) -> Option<ContextId> {
        self.parent_ids.first().copied()
    }

    pub fn parent_ids(&self) -> &[ContextId] {
        &self.parent_ids
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ancestor chain a child of this context will have.
    pub fn chain_for_child(&self) -> Vec<ContextId> {
        let mut chain = Vec::with_capacity(self.parent_ids.len() + 1);
        chain.push(self.context_id);
        chain.extend_from_slice(&self.parent_ids);
        chain
    }
}

/// Everything a child needs to know at boot, passed as one argv token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootInfo {
    pub context_id: ContextId,
    pub parent_ids: Vec<ContextId>,
    pub name: String,
    /// Level filter for records forwarded to the master.
    pub log_level: String,
    pub max_message_size: usize,
}

impl BootInfo {
    /// Hex-encoded JSON: survives sudo, ssh and shell quoting untouched.
    pub fn to_arg(&self) -> Result<String, BootError> {
        let json = serde_json::to_vec(self).map_err(BootError::Encode)?;
        Ok(hex::encode(json))
    }

    pub fn from_arg(arg: &str) -> Result<Self, BootError> {
        let json = hex::decode(arg).map_err(BootError::Hex)?;
        serde_json::from_slice(&json).map_err(BootError::Decode)
    }

    /// Find `--conduit-boot <arg>` (or `--conduit-boot=<arg>`) in argv.
    pub fn from_args<I>(args: I) -> Result<Self, BootError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if arg == BOOT_FLAG {
                let value = args.next().ok_or(BootError::Missing)?;
                return Self::from_arg(&value);
            }
            if let Some(value) = arg.strip_prefix(BOOT_FLAG).and_then(|v| v.strip_prefix('=')) {
                return Self::from_arg(value);
            }
        }
        Err(BootError::Missing)
    }

    pub fn identity(&self) -> Identity {
        Identity::child(self.context_id, self.parent_ids.clone(), self.name.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("no {} argument: this program must be started by a conduit parent", BOOT_FLAG)]
    Missing,
    #[error("boot argument is not hex: {0}")]
    Hex(hex::FromHexError),
    #[error("boot argument is not valid: {0}")]
    Decode(serde_json::Error),
    #[error("failed to encode boot argument: {0}")]
    Encode(serde_json::Error),
}
