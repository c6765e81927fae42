// ABOUTME: Error types for runtime engine operations
// ABOUTME: Distinguishes fatal setup/identity errors from backend failures

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid backend configuration, fatal during setup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required pod template missing or unparseable, fatal during setup
    #[error("Template error: {0}")]
    Template(String),

    /// A sandbox already exists for this build identifier. Indicates a
    /// build-id reuse bug upstream, never retried.
    #[error("Sandbox already exists for build {build}")]
    SandboxConflict { build: String },

    /// The ordinal/index mapping disagreed with the staged container name.
    /// This is an unrecoverable identity error, not corrected silently.
    #[error("Container identity mismatch: expected {expected}, found {found}")]
    IdentityMismatch { expected: String, found: String },

    /// No live sandbox is registered for this build
    #[error("Unknown build: {0}")]
    UnknownBuild(String),

    /// The container is not part of the tracked sandbox topology
    #[error("Unknown container: {0}")]
    UnknownContainer(String),

    /// Backend API failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Results that return EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
