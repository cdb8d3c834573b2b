//! Error kinds surfaced to callers of the query and evaluation services.
//!
//! "No data in range" is never an error: services return an empty, successful
//! payload for it. Every variant here means "cannot compute".

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A backing table/collection is missing or the service is misconfigured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A required parameter is missing or malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced parcel or rule does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store could not be reached or failed mid-query.
    #[error("data source unavailable: {0}")]
    DataSourceUnavailable(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Stable machine-readable kind, used in JSON error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::DataSourceUnavailable(_) => "data_source_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DataSourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingRelation(relation) => {
                Self::Configuration(format!("backing table {relation} does not exist"))
            }
            StoreError::GroupingUnavailable => {
                Self::Configuration("grouped aggregation is not configured".to_string())
            }
            StoreError::Unavailable(message) => Self::DataSourceUnavailable(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_relation_maps_to_configuration() {
        let err: CoreError = StoreError::MissingRelation("sensor_readings".into()).into();
        assert_eq!(err.kind(), "configuration_error");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unavailable_maps_to_service_unavailable() {
        let err: CoreError = StoreError::Unavailable("pool timed out".into()).into();
        assert_eq!(err.kind(), "data_source_unavailable");
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn validation_is_a_client_error() {
        assert_eq!(
            CoreError::validation("parameter is required").status(),
            StatusCode::BAD_REQUEST
        );
    }
}
