use thiserror::Error;

/// Failure taxonomy for chat operations.
///
/// Validation, authorization and not-found failures are terminal and are
/// reported to the originating connection only. Store and directory
/// failures are transient: the caller may retry, the engine never does.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("listing directory error: {0}")]
    Directory(String),
}

impl ChatError {
    /// Whether the caller may usefully retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(self, ChatError::Store(_) | ChatError::Directory(_))
    }

    /// Stable discriminant used in wire error frames and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::Authorization(_) => "authorization",
            ChatError::NotFound(_) => "not_found",
            ChatError::Store(_) => "store",
            ChatError::Directory(_) => "directory",
        }
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(err: redis::RedisError) -> Self {
        ChatError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Store(format!("corrupt stored document: {}", err))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Directory(err.to_string())
    }
}
