use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use shopper_lifecycle::LifecycleError;
use shopper_provider::ProviderError;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::CONFLICT, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

fn provider_status(e: &ProviderError) -> StatusCode {
    if e.is_rate_limit() {
        // Safe for clients to retry.
        StatusCode::TOO_MANY_REQUESTS
    } else if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_GATEWAY
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        let status = match &e {
            LifecycleError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::Domain(_) => StatusCode::BAD_REQUEST,
            LifecycleError::NoMatchingOffers => StatusCode::CONFLICT,
            LifecycleError::Provider(p) => provider_status(p),
            LifecycleError::ProvisioningTimeout { .. }
            | LifecycleError::InstanceFailed { .. }
            | LifecycleError::DestroyFailed { .. } => StatusCode::BAD_GATEWAY,
            LifecycleError::Store(_) | LifecycleError::KeyGeneration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError { status, message: e.to_string() }
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        ApiError { status: provider_status(&e), message: e.to_string() }
    }
}

impl From<shopper_store::StoreError> for ApiError {
    fn from(e: shopper_store::StoreError) -> Self {
        match e {
            shopper_store::StoreError::SessionNotFound(id) => {
                ApiError::not_found(format!("session '{}' not found", id))
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}
