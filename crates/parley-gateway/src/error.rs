use parley_db::DbError;
use parley_types::models::UserId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or incomplete command; dropped without touching state
    #[error("validation: {0}")]
    Validation(String),
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    #[error("store: {0}")]
    Store(DbError),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<DbError> for GatewayError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UnknownUser(id) => Self::UnknownUser(id),
            other => Self::Store(other),
        }
    }
}

impl GatewayError {
    /// True for errors caused by what the client sent rather than by the server.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownUser(_))
    }
}
