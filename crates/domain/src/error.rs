use uuid::Uuid;

/// Shared error type used across all TestStudio crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    /// A callback referenced a reply this process does not own.
    #[error("unknown reply: {0}")]
    UnknownReply(Uuid),

    /// The agent subprocess could not be created.
    #[error("failed to spawn agent: {0}")]
    SpawnFailed(String),

    #[error("store: {0}")]
    Store(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
