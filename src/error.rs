use thiserror::Error;

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("not the leader (leader at {leader_endpoint:?})")]
    NotLeader { leader_endpoint: Option<String> },

    #[error("node is already rendering")]
    Busy,

    #[error("node is stopped")]
    Stopped,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("peer unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, FarmError>;
