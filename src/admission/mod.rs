pub mod codec;
pub mod guard;

use k8s_openapi::api::core::v1::Pod;

/// Name used in logs for a pod, falling back to `generateName` for pods the
/// API server has not named yet.
pub fn display_name(pod: &Pod) -> &str {
    match pod.metadata.name.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => pod
            .metadata
            .generate_name
            .as_deref()
            .unwrap_or("<unnamed>"),
    }
}
