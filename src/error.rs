use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::admission::codec::{DecodeError, EncodeError};
use crate::admission::guard::GuardError;
use crate::mutator::InjectError;
use crate::provisioner::ProvisionError;

/// Everything that stops a review from being answered with an envelope.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Inject(#[from] InjectError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl WebhookError {
    /// Resource guard failures answer 500, like provisioning failures, so the
    /// API server's `failurePolicy` decides what happens to the pod.
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::Decode(DecodeError::MethodNotAllowed(_)) => StatusCode::METHOD_NOT_ALLOWED,
            WebhookError::Decode(DecodeError::UnsupportedMediaType(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            WebhookError::Decode(DecodeError::MalformedBody(_)) => StatusCode::BAD_REQUEST,
            WebhookError::Guard(_)
            | WebhookError::Provision(_)
            | WebhookError::Inject(_)
            | WebhookError::Encode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
