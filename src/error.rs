//! Error types for kiln
//!
//! All modules use `KilnResult<T>` as their return type. Every error is
//! classified as either a user error (the application's descriptors, hooks or
//! sources are at fault) or an internal error (the pipeline itself failed).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// Who is at fault for a failed build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Dependency descriptors, build hooks or application content
    User,
    /// Registry, cache or composition failure inside kiln
    Internal,
}

/// All errors that can occur in kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // User errors
    #[error("{tool} failed with exit code {code} while {purpose}\n{output}")]
    ToolFailed {
        tool: String,
        purpose: String,
        code: i32,
        output: String,
    },

    #[error("Build hook '{hook}' failed with exit code {code}\n{output}")]
    HookFailed {
        hook: String,
        code: i32,
        output: String,
    },

    #[error("Invalid dependency descriptor {path}: {reason}")]
    DescriptorInvalid { path: String, reason: String },

    #[error("Build context not found: {0}")]
    ContextMissing(PathBuf),

    #[error("Required tool not found: {name}. {hint}")]
    ToolNotFound { name: String, hint: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid image reference '{reference}': {reason}")]
    ImageRefInvalid { reference: String, reason: String },

    // Registry and cache errors
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Malformed cache entry {tag}: {reason}")]
    CacheEntryInvalid { tag: String, reason: String },

    // Pipeline invariants
    #[error("Layer '{0}' has not been built")]
    UnbuiltLayer(String),

    #[error("Layer builder '{0}' has already run")]
    BuilderReused(String),

    #[error("Composition error: {0}")]
    Composition(String),

    #[error("Build timed out after {0}s")]
    Timeout(u64),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error (the process could not be spawned)
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a tool failure error from a finished process
    pub fn tool_failed(
        tool: impl Into<String>,
        purpose: impl Into<String>,
        code: i32,
        output: impl Into<String>,
    ) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            purpose: purpose.into(),
            code,
            output: output.into(),
        }
    }

    /// Classify the error as a user fault or a pipeline fault
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolFailed { .. }
            | Self::HookFailed { .. }
            | Self::DescriptorInvalid { .. }
            | Self::ContextMissing(_)
            | Self::ToolNotFound { .. }
            | Self::ConfigInvalid { .. }
            | Self::ImageRefInvalid { .. }
            | Self::User(_) => ErrorKind::User,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether this is a user error
    pub fn is_user_error(&self) -> bool {
        self.kind() == ErrorKind::User
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Registry(_) | Self::Io { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ToolFailed { .. } => {
                Some("Check your dependency descriptors; the package manager rejected them")
            }
            Self::HookFailed { .. } => Some("Fix the build hook script declared in your descriptor"),
            Self::ImageNotFound(_) => Some("Push the base image to the configured registry first"),
            Self::CacheEntryInvalid { .. } => Some("Run: kiln cache clear --yes"),
            Self::ContextMissing(_) => Some("Pass the application directory: kiln build <path>"),
            Self::Timeout(_) => Some("Raise --timeout or check for a hung build tool"),
            _ => None,
        }
    }
}
