//! Error taxonomy shared by the fetcher, pool manager, and client.

use thiserror::Error;

/// Result type alias for Kiln operations.
pub type KilnResult<T> = Result<T, KilnError>;

/// Errors surfaced at every Kiln endpoint.
///
/// Errors are `Clone` because a single specialization failure is delivered
/// to every caller waiting on the same reservation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KilnError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    NameExists(String),

    #[error("checksum verification failed: {0}")]
    Checksum(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("specialization failed: {0}")]
    Specialization(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// HTTP status used when this error is returned from an endpoint.
    pub fn status_code(&self) -> u16 {
        match self {
            KilnError::Validation(_) => 400,
            KilnError::NotFound(_) => 404,
            KilnError::NameExists(_) => 409,
            KilnError::Checksum(_) => 422,
            KilnError::Download(_) | KilnError::Specialization(_) => 502,
            KilnError::PoolExhausted(_) => 503,
            KilnError::Upstream { status, .. } => *status,
            KilnError::Orchestrator(_) | KilnError::Internal(_) => 500,
        }
    }

    /// Whether a fresh container might succeed where this attempt failed.
    ///
    /// Validation and checksum failures are terminal: the same request
    /// against another container fails the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            KilnError::Download(_)
            | KilnError::Specialization(_)
            | KilnError::Orchestrator(_) => true,
            KilnError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Rebuild an error from a peer's non-success response.
    ///
    /// Peers answer with `status` plus the `Display` text of their own
    /// error, so known statuses map back onto the same variant and the
    /// duplicated prefix is stripped.
    pub fn from_status(status: u16, body: &str) -> Self {
        let body = body.trim();
        match status {
            400 => KilnError::Validation(strip(body, "invalid request: ")),
            404 => KilnError::NotFound(strip(body, "not found: ")),
            409 => KilnError::NameExists(strip(body, "already exists: ")),
            422 => KilnError::Checksum(strip(body, "checksum verification failed: ")),
            502 => KilnError::Download(strip(body, "download failed: ")),
            503 => KilnError::PoolExhausted(strip(body, "pool exhausted: ")),
            _ => KilnError::Upstream {
                status,
                message: body.to_string(),
            },
        }
    }
}

fn strip(body: &str, prefix: &str) -> String {
    body.strip_prefix(prefix).unwrap_or(body).to_string()
}
