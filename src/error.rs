use std::fmt;

/// Errors surfaced by the sync, download and store layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Media API unreachable, timed out, or answered without the success marker.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Network or filesystem failure in the middle of a download.
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Subscription,
    Task,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Subscription => f.write_str("subscription"),
            Entity::Task => f.write_str("task"),
        }
    }
}

impl Error {
    pub fn subscription_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            entity: Entity::Subscription,
            id: id.into(),
        }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            entity: Entity::Task,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transfer(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
