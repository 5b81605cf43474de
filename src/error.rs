use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error code the remote returns when an agent already holds an active
/// contract. Callers recover by fetching the existing contract.
pub const ERROR_ACTIVE_CONTRACT: i64 = 4511;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Non-2xx remote response after retries, carrying the remote error code
    /// where the body contained one.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("rate limited after retries: {0}")]
    RateLimited(String),

    #[error("no route: {0}")]
    Routing(String),

    #[error("solver produced no solution: {0}")]
    Solver(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Error::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<diesel::ConnectionError> for Error {
    fn from(e: diesel::ConnectionError) -> Self {
        Error::Database(e.to_string())
    }
}
