//! JSON envelope used by the definitions API.

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, KilnResult};

/// Response wrapper for a consistent API format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Unwrap the payload, rebuilding a failed response into a
    /// [`KilnError`] from its HTTP status.
    pub fn into_result(self, status: u16) -> KilnResult<T> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(KilnError::Internal("response carried no data".into())),
            (false, _) => Err(KilnError::from_status(
                status,
                self.error.as_deref().unwrap_or_default(),
            )),
        }
    }
}
