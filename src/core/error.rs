//! TL-007: Error taxonomy - declaration, remote, state, and aggregate run errors.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or validating the dependency graph.
///
/// All of these are fatal and are reported before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeclarationError {
    #[error("dependency cycle detected involving: {}", .ids.join(", "))]
    CyclicDependency { ids: Vec<String> },

    #[error("resource '{0}' is declared more than once")]
    DuplicateResource(String),

    #[error("invalid resource id '{0}' (expected [A-Za-z][A-Za-z0-9_.-]*)")]
    InvalidResourceId(String),

    #[error("resource '{from}' references unknown resource '{to}'")]
    UnknownReference { from: String, to: String },

    #[error("resource '{id}' has unknown kind '{kind}'")]
    UnknownKind { id: String, kind: String },

    #[error("resource '{id}' ({kind}) is missing required input '{field}'")]
    MissingInput {
        id: String,
        kind: String,
        field: String,
    },
}

/// Classification of a non-retryable remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentClass {
    Unauthorized,
    QuotaExceeded,
    Conflict,
    NotFound,
    Other,
}

impl fmt::Display for PermanentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::QuotaExceeded => write!(f, "quota exceeded"),
            Self::Conflict => write!(f, "conflict"),
            Self::NotFound => write!(f, "not found"),
            Self::Other => write!(f, "rejected"),
        }
    }
}

/// Error returned by a [`crate::provider::Provider`] call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network failure, timeout or throttling. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Rejected by the remote platform. Never retried.
    #[error("{class}: {message}")]
    Permanent {
        class: PermanentClass,
        message: String,
    },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn permanent(class: PermanentClass, message: impl Into<String>) -> Self {
        Self::Permanent {
            class,
            message: message.into(),
        }
    }
}

/// Why a single node failed during a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeFailure {
    #[error("remote call failed after {attempts} attempt(s): {error}")]
    Remote { attempts: u32, error: RemoteError },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("remote object is missing output attribute '{0}'")]
    MissingAttribute(String),

    #[error("state store error: {0}")]
    State(String),
}

impl NodeFailure {
    /// True when the failure was a transient error that exhausted the retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote { error, .. } if error.is_transient())
    }
}

/// One entry in an aggregate run failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedNode {
    pub resource_id: String,
    pub kind: String,
    pub cause: String,
}

impl fmt::Display for FailedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.resource_id, self.kind, self.cause)
    }
}

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("declaration error: {0}")]
    Declaration(#[from] DeclarationError),

    #[error("corrupt state record for '{resource_id}': {message}")]
    StateCorruption {
        resource_id: String,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("export '{name}' did not resolve: {reason}")]
    UnresolvedExport { name: String, reason: String },

    #[error("{} resource(s) failed: {}", .failures.len(), format_failures(.failures))]
    RunFailed { failures: Vec<FailedNode> },
}

fn format_failures(failures: &[FailedNode]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
