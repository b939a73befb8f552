//! Key namespacing.

use super::Command;
use bytes::Bytes;

/// Prefix prepended to every key of every command a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPrefix(Bytes);

impl KeyPrefix {
    /// Create a prefix.
    pub fn new(prefix: impl Into<Bytes>) -> Self {
        Self(prefix.into())
    }

    /// Raw prefix bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Rewrite the key arguments of `command`.
    pub fn apply(&self, command: &mut Command) {
        command.prefix_keys(&self.0);
    }
}

impl From<&str> for KeyPrefix {
    fn from(prefix: &str) -> Self {
        Self(Bytes::copy_from_slice(prefix.as_bytes()))
    }
}

impl From<String> for KeyPrefix {
    fn from(prefix: String) -> Self {
        Self(Bytes::from(prefix))
    }
}
