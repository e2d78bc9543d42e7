//! Error types for plug host operations.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while hosting plugs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// No plug with this name is currently loaded.
    #[error("plug not found: {0}")]
    PlugNotFound(String),

    /// No syscall is registered under this name.
    #[error("syscall not found: {0}")]
    SyscallNotFound(String),

    /// The calling plug was not granted a namespace the operation requires.
    #[error("permission denied: plug {plug} was not granted namespace '{namespace}'")]
    PermissionDenied {
        /// Plug that attempted the operation.
        plug: String,
        /// Namespace that was missing from its grants.
        namespace: String,
    },

    /// Plug code raised an error or panicked.
    #[error("sandbox execution failed: {0}")]
    SandboxExecution(String),

    /// Plug code exceeded one of its sandbox limits.
    #[error("sandbox resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The sandbox has been stopped and accepts no further calls.
    #[error("sandbox stopped")]
    SandboxStopped,

    /// A sandbox could not be constructed at all.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// An exclusive hook binding is already owned by another plug.
    #[error("hook registration conflict: {route} is already bound by plug {owner}")]
    HookConflict {
        /// Route or key that collided.
        route: String,
        /// Plug currently owning it.
        owner: String,
    },

    /// Function is not exported by the plug.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// Invalid manifest.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Missing required field in manifest.
    #[error("missing required manifest field: {0}")]
    MissingManifestField(String),

    /// Manifest could not be parsed.
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// A host-side syscall implementation failed.
    #[error("{0}")]
    Syscall(String),

    /// Document does not exist in the store.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// Write rejected because the document changed since it was read.
    #[error("write conflict on {name}: expected last modified {expected}, found {actual}")]
    Conflict {
        /// Document name.
        name: String,
        /// Timestamp the writer expected.
        expected: u64,
        /// Timestamp currently stored.
        actual: u64,
    },

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(String),

    /// Watch error.
    #[cfg(feature = "watch")]
    #[error("watch error: {0}")]
    Watch(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::ManifestParse(e.to_string())
    }
}

impl Error {
    /// Create a plug not found error.
    pub fn plug_not_found(name: impl Into<String>) -> Self {
        Self::PlugNotFound(name.into())
    }

    /// Create a syscall not found error.
    pub fn syscall_not_found(name: impl Into<String>) -> Self {
        Self::SyscallNotFound(name.into())
    }

    /// Create a permission denied error.
    pub fn permission_denied(plug: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::PermissionDenied {
            plug: plug.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a sandbox execution error.
    pub fn execution_failed(msg: impl Into<String>) -> Self {
        Self::SandboxExecution(msg.into())
    }

    /// Create a resource exhausted error.
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        Self::InvalidManifest(msg.into())
    }

    /// Create a missing manifest field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingManifestField(field.into())
    }

    /// Create a syscall failure error.
    pub fn syscall(msg: impl Into<String>) -> Self {
        Self::Syscall(msg.into())
    }

    /// Returns true if this error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PlugNotFound(_)
                | Self::SyscallNotFound(_)
                | Self::FunctionNotFound(_)
                | Self::DocumentNotFound(_)
        )
    }

    /// Returns true if the failure originated inside a sandbox.
    pub fn is_sandbox_failure(&self) -> bool {
        matches!(
            self,
            Self::SandboxExecution(_) | Self::ResourceExhausted(_) | Self::SandboxStopped
        )
    }

    /// HTTP status the gateway answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PlugNotFound(_) => 404,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::plug_not_found("greeter");
        assert_eq!(err.to_string(), "plug not found: greeter");

        let err = Error::permission_denied("reader", "fs");
        assert!(err.to_string().contains("reader"));
        assert!(err.to_string().contains("'fs'"));

        let err = Error::syscall("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::plug_not_found("x").is_not_found());
        assert!(Error::syscall_not_found("x.y").is_not_found());
        assert!(!Error::permission_denied("x", "fs").is_not_found());

        assert!(Error::exhausted("timeout").is_sandbox_failure());
        assert!(Error::SandboxStopped.is_sandbox_failure());
        assert!(!Error::syscall("x").is_sandbox_failure());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::plug_not_found("x").status_code(), 404);
        assert_eq!(Error::execution_failed("x").status_code(), 500);
        assert_eq!(Error::syscall_not_found("x").status_code(), 500);
    }
}
