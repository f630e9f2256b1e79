//! Composite cache keys derived from a command id and command string.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the id and the command. An `i64` rendered in decimal
/// never contains it, so the first occurrence always ends the id.
const SEPARATOR: char = '+';

/// Deterministic key identifying one unit of cacheable work, `"<id>+<cmd>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandKey(String);

impl CommandKey {
    pub fn new(id: i64, command: &str) -> Self {
        Self(format!("{id}{SEPARATOR}{command}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the key back into `(id, command)`.
    ///
    /// Returns `None` for strings that were not produced by [`CommandKey::new`],
    /// which can only happen for keys loaded from a hand-edited store file.
    pub fn parts(&self) -> Option<(i64, &str)> {
        let (id, command) = self.0.split_once(SEPARATOR)?;
        Some((id.parse().ok()?, command))
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CommandKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
