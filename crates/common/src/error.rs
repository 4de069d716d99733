use thiserror::Error;

/// Common error types used across the delivery pipeline.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Storage hiccups are transient; bad input and missing rows are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Redis(_))
    }
}
