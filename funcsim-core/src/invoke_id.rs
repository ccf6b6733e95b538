//! Invocation ID generation

use uuid::Uuid;

/// Per-invocation identifier, exposed to handlers and used in logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeId(String);

impl InvokeId {
    /// Generate a new invocation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Create an invocation ID with a specific value (for testing)
    pub fn with_id(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InvokeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvokeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
