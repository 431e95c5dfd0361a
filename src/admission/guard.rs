use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::AdmissionRequest;
use kube::core::DynamicObject;
use thiserror::Error;

const POD_GROUP: &str = "";
const POD_VERSION: &str = "v1";
const POD_RESOURCE: &str = "pods";
const POD_KIND: &str = "Pod";

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("unexpected resource '{0}', only core/v1/pods is supported")]
    UnexpectedResource(String),
    #[error("unexpected object: {0}")]
    UnexpectedKind(String),
}

/// Accepts only `v1` Pods and returns the decoded pod.
///
/// The resource descriptor is checked before the embedded object is touched.
/// Pods without a name (`generateName`) pass.
pub fn check(request: &AdmissionRequest<DynamicObject>) -> Result<Pod, GuardError> {
    let resource = &request.resource;
    if resource.group != POD_GROUP || resource.version != POD_VERSION || resource.resource != POD_RESOURCE
    {
        let group = if resource.group.is_empty() { "core" } else { &resource.group };
        return Err(GuardError::UnexpectedResource(format!(
            "{group}/{}/{}",
            resource.version, resource.resource
        )));
    }

    let object = request
        .object
        .as_ref()
        .ok_or_else(|| GuardError::UnexpectedKind("request carries no object".to_string()))?;

    match &object.types {
        Some(types) if types.api_version == POD_VERSION && types.kind == POD_KIND => {}
        Some(types) => {
            return Err(GuardError::UnexpectedKind(format!(
                "expected {POD_VERSION}/{POD_KIND}, got {}/{}",
                types.api_version, types.kind
            )));
        }
        None => {
            return Err(GuardError::UnexpectedKind(
                "object has no apiVersion/kind".to_string(),
            ));
        }
    }

    serde_json::to_value(object)
        .and_then(serde_json::from_value::<Pod>)
        .map_err(|e| GuardError::UnexpectedKind(format!("object does not decode as a Pod: {e}")))
}
