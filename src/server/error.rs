// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP error payloads.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::SaeError;

/// Error returned by the endpoint handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed or oversized request (400).
    BadRequest(String),
    /// Unknown dictionary source (404).
    NotFound(String),
    /// Model or runtime failure (500).
    Internal(String),
}

impl ApiError {
    /// Status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SaeError> for ApiError {
    fn from(err: SaeError) -> Self {
        let message = err.to_string();
        if err.is_client_error() {
            Self::BadRequest(message)
        } else if matches!(err, SaeError::Configuration(_)) {
            Self::NotFound(message)
        } else {
            tracing::error!(error = %message, "request failed");
            Self::Internal(message)
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (Self::BadRequest(error) | Self::NotFound(error) | Self::Internal(error)) = self;
        (status, axum::Json(ErrorBody { error })).into_response()
    }
}
