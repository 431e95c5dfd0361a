use axum::http::Method;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, SerializePatchError};
use kube::core::DynamicObject;
use thiserror::Error;

pub const JSON_MEDIA_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("method {0} not allowed, expected POST")]
    MethodNotAllowed(Method),
    #[error("unsupported media type '{0}', expected {JSON_MEDIA_TYPE}")]
    UnsupportedMediaType(String),
    #[error("malformed admission review: {0}")]
    MalformedBody(String),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize admission review: {0}")]
    Review(#[from] serde_json::Error),
    #[error("failed to serialize patch: {0}")]
    Patch(#[from] SerializePatchError),
}

/// Reads and writes `admission.k8s.io/v1` review envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionCodec;

impl AdmissionCodec {
    pub fn decode(
        &self,
        method: &Method,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<AdmissionRequest<DynamicObject>, DecodeError> {
        if *method != Method::POST {
            return Err(DecodeError::MethodNotAllowed(method.clone()));
        }

        match content_type {
            Some(JSON_MEDIA_TYPE) => {}
            Some(other) => return Err(DecodeError::UnsupportedMediaType(other.to_string())),
            None => return Err(DecodeError::UnsupportedMediaType("<none>".to_string())),
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::MalformedBody("request body is empty".to_string()));
        }

        let review: AdmissionReview<DynamicObject> = serde_json::from_slice(body)
            .map_err(|e| DecodeError::MalformedBody(e.to_string()))?;

        review
            .try_into()
            .map_err(|e| DecodeError::MalformedBody(format!("{e}")))
    }

    pub fn encode(&self, response: AdmissionResponse) -> Result<Vec<u8>, EncodeError> {
        let review: AdmissionReview<DynamicObject> = response.into_review();
        Ok(serde_json::to_vec(&review)?)
    }

    /// Reads back the response half of an encoded review.
    #[cfg(test)]
    pub fn decode_response(&self, body: &[u8]) -> Result<AdmissionResponse, DecodeError> {
        let review: AdmissionReview<DynamicObject> = serde_json::from_slice(body)
            .map_err(|e| DecodeError::MalformedBody(e.to_string()))?;
        review
            .response
            .ok_or_else(|| DecodeError::MalformedBody("missing response".to_string()))
    }
}
