use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Calendar transport error: {0}")]
    Transport(String),
    #[error("Calendar event already exists: {0}")]
    Conflict(String),
    #[error("Notifier error: {0}")]
    Notifier(String),
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl InfraError {
    /// Transient failures are worth another attempt within the same sync run.
    pub fn is_transient(&self) -> bool {
        match self {
            InfraError::Timeout { .. } => true,
            InfraError::Transport(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("network error")
                    || message.contains("timeout")
                    || message.contains("timed out")
                    || message.contains("temporarily unavailable")
                    || message.contains("connection reset")
                    || message.contains("http 503")
                    || message.contains("http 429")
            }
            _ => false,
        }
    }
}
