use thiserror::Error;

/// Errors from repository operations (used by trait definitions in ensemble-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from agent registry lookups and updates.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent instance not found: {0}")]
    InstanceNotFound(uuid::Uuid),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}
