//! Response envelope for whoever mounts the updater behind HTTP routes.
//!
//! Every operation answers `{ "success": true, "data": ... }` or
//! `{ "success": false, "error": { "code": ..., "message": ... } }`.

use serde::Serialize;

use crate::error::UpdateError;

/// Error half of the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    /// Whether the same request may simply be sent again.
    pub retryable: bool,
}

impl From<&UpdateError> for ApiError {
    fn from(e: &UpdateError) -> Self {
        Self {
            code: e.code().to_owned(),
            message: e.message().to_owned(),
            retryable: e.is_retryable(),
        }
    }
}

/// `{success, data|error}` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: &UpdateError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl<T> From<crate::error::Result<T>> for ApiResponse<T> {
    fn from(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(&e),
        }
    }
}
