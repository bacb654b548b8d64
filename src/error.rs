//! Classified engine errors.

use thiserror::Error;

/// Errors surfaced by the resource engine.
///
/// Store operations roll back their transaction and return these verbatim;
/// callers decide between retry (`Database`, `Pool`, `Transport`), surfacing
/// to the user (`PinnedThroughConfig`, `NotFound`), or treating as a server
/// bug (`NonOneRowAffected`, `Consistency`).
#[derive(Error, Debug)]
pub enum EngineError {
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,

    /// The pin is owned by the pipeline config and cannot be changed via the API.
    #[error("resource is pinned through config")]
    PinnedThroughConfig,

    /// An exactly-one-row expectation was violated.
    #[error("expected 1 row to be affected, got {0}")]
    NonOneRowAffected(usize),

    /// The operation exists on the store surface but has no implementation.
    #[error("{0} is not implemented")]
    Unsupported(&'static str),

    #[error("database: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool: {0}")]
    Pool(String),

    /// Notification bus transport failure. Retryable at the caller.
    #[error("bus transport: {0}")]
    Transport(String),

    /// Malformed JSON in a notification payload or stored row.
    #[error("decode: {0}")]
    Decode(String),

    /// Referential integrity broken between tables. Log and continue.
    #[error("consistency: {0}")]
    Consistency(String),
}

impl EngineError {
    pub fn pool(err: impl std::fmt::Display) -> Self {
        EngineError::Pool(err.to_string())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        EngineError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Decode(err.to_string())
    }
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(err: tokio_postgres::Error) -> Self {
        EngineError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_one_row_affected_reports_count() {
        let err = EngineError::NonOneRowAffected(3);
        assert_eq!(err.to_string(), "expected 1 row to be affected, got 3");
    }

    #[test]
    fn pinned_through_config_message_is_stable() {
        assert_eq!(
            EngineError::PinnedThroughConfig.to_string(),
            "resource is pinned through config"
        );
    }
}
