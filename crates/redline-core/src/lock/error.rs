//! Error types for the execution lock.

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock row is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("lock store task failed: {0}")]
    Task(String),

    #[error("lock store poisoned")]
    Poisoned,

    #[error("lock ttl must be greater than zero")]
    ZeroTtl,
}

pub type LockResult<T> = std::result::Result<T, LockError>;
