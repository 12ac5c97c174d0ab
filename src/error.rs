use thiserror::Error;

/// Errors surfaced while configuring or starting a daemon. Runtime faults inside the event loop
/// are logged and handled locally instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid address: {0}")]
    Addr(String),
}

pub type Result<T> = std::result::Result<T, Error>;
