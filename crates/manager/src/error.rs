//! Errors returned by the dispatcher API
//!
//! Discovery failures never surface here; they reach the registered
//! callback instead.

use thiserror::Error;

/// Errors of the security key manager
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The lifecycle owner's kind is excluded by configuration
    #[error("Lifecycle owner kind `{kind}` is excluded from security key dispatch")]
    ExcludedOwner {
        /// Kind of the rejected owner
        kind: String,
    },

    /// The dispatcher threads are gone
    #[error("Security key manager is shut down")]
    ShutDown,

    /// A dispatcher thread could not be spawned
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        /// Thread name
        name: &'static str,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl ManagerError {
    /// Create a new excluded owner error
    pub fn excluded_owner(kind: impl Into<String>) -> Self {
        Self::ExcludedOwner { kind: kind.into() }
    }
}

/// Result type for manager operations
pub type Result<T, E = ManagerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            ManagerError::excluded_owner("SettingsScreen").to_string(),
            "Lifecycle owner kind `SettingsScreen` is excluded from security key dispatch"
        );
        assert_eq!(ManagerError::ShutDown.to_string(), "Security key manager is shut down");
    }
}
