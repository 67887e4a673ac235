//! Command and engine error taxonomy

use crate::catalog::CatalogError;
use crate::repository::RepositoryError;

pub type GameResult<T> = Result<T, GameError>;

/// Errors reported to the connection that issued a command.
///
/// Every variant is raised before any state is mutated, so a failed command
/// never leaves a partial effect behind.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    DuplicateAction(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("storage failure: {0}")]
    Repository(#[from] RepositoryError),

    #[error("prompt catalog failure: {0}")]
    Catalog(#[from] CatalogError),
}

impl GameError {
    /// Stable code sent to clients in `ServerMessage::Error`
    pub fn code(&self) -> &'static str {
        match self {
            GameError::NotFound(_) => "NOT_FOUND",
            GameError::InvalidState(_) => "INVALID_STATE",
            GameError::InvalidInput(_) => "INVALID_INPUT",
            GameError::DuplicateAction(_) => "DUPLICATE_ACTION",
            GameError::Unauthorized(_) => "UNAUTHORIZED",
            GameError::Repository(_) | GameError::Catalog(_) => "INTERNAL",
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        GameError::NotFound(what.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        GameError::InvalidState(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        GameError::InvalidInput(msg.into())
    }
}

impl From<GameError> for crate::protocol::ServerMessage {
    fn from(err: GameError) -> Self {
        let msg = match &err {
            // Infrastructure details stay in the logs
            GameError::Repository(_) | GameError::Catalog(_) => {
                tracing::error!("Internal error: {}", err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        crate::protocol::ServerMessage::Error {
            code: err.code().to_string(),
            msg,
        }
    }
}
