use thiserror::Error;

/// Errors surfaced by the task store and the Graph transport.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Required settings are missing or still hold `YOUR_...` placeholders.
    #[error("configuration incomplete: set {}", .missing.join(", "))]
    NeedsConfiguration { missing: Vec<String> },

    #[error("authentication failed: {0}")]
    Auth(String),

    /// Non-success HTTP response; status and raw body kept for diagnostics.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("task title cannot be empty")]
    EmptyTitle,
}

impl StoreError {
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}
