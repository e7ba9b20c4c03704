//! Error types for the partstress harness.
//!
//! Nearly every failure the harness sees at run time is non-fatal: a worker
//! that cannot get a connection is skipped, an INSERT that fails is counted and
//! dropped, a failed `DROP PARTITION` is recorded and the run moves on. These
//! errors therefore mostly travel as values into logs and reports rather than
//! up the stack. The exceptions are configuration problems and failing to
//! reach the store at all, which abort the run before any phase starts.

use thiserror::Error;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to acquire a dedicated store connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A statement was rejected by the store.
    #[error("Statement failed ({kind}): {message}")]
    Statement { kind: StatementKind, message: String },

    /// Driver-level error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A partition ordinal outside the configured layout.
    #[error("Unknown partition: p{0}")]
    UnknownPartition(u32),

    /// Report or config (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// The kind of statement an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    CreateTable,
    Insert,
    DropPartition,
    Count,
    /// Text the store client does not recognize.
    Unsupported,
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateTable => write!(f, "create table"),
            Self::Insert => write!(f, "insert"),
            Self::DropPartition => write!(f, "drop partition"),
            Self::Count => write!(f, "count"),
            Self::Unsupported => write!(f, "unsupported statement"),
        }
    }
}

impl HarnessError {
    pub fn statement(kind: StatementKind, message: impl Into<String>) -> Self {
        HarnessError::Statement {
            kind,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(e: serde_json::Error) -> Self {
        HarnessError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for HarnessError {
    fn from(e: toml::de::Error) -> Self {
        HarnessError::Serialization(e.to_string())
    }
}
