//! Error types for table reconciliation and record access.

use crate::reconcile::RebuildStep;

/// Errors that can occur while reconciling schemas or touching records.
#[derive(Debug, thiserror::Error)]
pub enum TablesError {
    /// Database error from the SQLite driver.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading configuration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The schema description is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A field name appears twice in one table.
    #[error("Field '{field}' is declared twice in table '{table}'")]
    DuplicateField {
        /// Table name.
        table: String,
        /// Offending field name.
        field: String,
    },

    /// A field uses the name reserved for the surrogate key.
    #[error("Field name '{field}' is reserved (table '{table}')")]
    ReservedField {
        /// Table name.
        table: String,
        /// Offending field name.
        field: String,
    },

    /// The named table does not exist in the database.
    #[error("Table '{0}' does not exist")]
    UnknownTable(String),

    /// An update was requested with no values to set.
    #[error("Update on table '{0}' has no values to set")]
    EmptyUpdate(String),

    /// An update matched no rows and inserting was not allowed.
    #[error("No row of table '{0}' matches")]
    NoMatch(String),

    /// Only many-to-many relations are supported.
    #[error("Unsupported relation kind '{0}'")]
    UnsupportedRelation(String),

    /// A table cannot be related to itself.
    #[error("Table '{0}' cannot be related to itself")]
    SelfRelation(String),

    /// No join table is registered for the pair.
    #[error("No relation between '{first}' and '{second}'")]
    NoJoinTable {
        /// First table.
        first: String,
        /// Second table.
        second: String,
    },

    /// The record to unlink does not exist.
    #[error("Record not found in table '{0}'")]
    RecordNotFound(String),

    /// Every requested link already existed.
    #[error("Records of '{first}' and '{second}' are already linked")]
    AlreadyLinked {
        /// First table.
        first: String,
        /// Second table.
        second: String,
    },

    /// No link existed to remove.
    #[error("Records of '{first}' and '{second}' are not linked")]
    NotLinked {
        /// First table.
        first: String,
        /// Second table.
        second: String,
    },

    /// A table rebuild failed part way through.
    #[error("Rebuilding table '{table}' failed at step {step}: {source}")]
    Rebuild {
        /// Table being rebuilt.
        table: String,
        /// Step that failed.
        step: RebuildStep,
        /// Underlying failure.
        source: Box<TablesError>,
    },

    /// Multiple errors occurred.
    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<TablesError>),
}

/// Result type for table operations.
pub type Result<T> = std::result::Result<T, TablesError>;
