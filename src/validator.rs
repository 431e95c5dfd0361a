use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use tracing::debug;

use crate::admission::display_name;

/// Allows every pod that made it through the resource guard.
pub fn decide(request: &AdmissionRequest<DynamicObject>, pod: &Pod) -> AdmissionResponse {
    debug!(uid = %request.uid, pod = %display_name(pod), "pod allowed");
    AdmissionResponse::from(request)
}
