use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, Container, Pod, Volume, VolumeMount};
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::admission::codec::EncodeError;
use crate::admission::display_name;
use crate::config::InjectorConfig;
use crate::error::WebhookError;
use crate::provisioner::{ConfigMapProvisioner, TrustBundleRef};

pub const CERTS_DIR: &str = "/etc/ssl/certs";
const CONFIGMAP_DEFAULT_MODE: i32 = 0o644;

/// The pod already uses the bundle's volume name or mount path for
/// something else.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("pod volume '{0}' exists and is not backed by ConfigMap '{0}'")]
    VolumeConflict(String),
    #[error("container '{container}' already mounts volume '{volume}' at {path}")]
    MountConflict {
        container: String,
        volume: String,
        path: String,
    },
}

/// Outcome of a mutation decision.
pub struct Mutation {
    pub patches: Vec<PatchOperation>,
    /// Set when the pod asked for the bundle.
    pub bundle: Option<TrustBundleRef>,
}

impl Mutation {
    fn skipped() -> Self {
        Self {
            patches: Vec::new(),
            bundle: None,
        }
    }

    pub fn into_response(
        self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, EncodeError> {
        let response = AdmissionResponse::from(request);
        if self.patches.is_empty() {
            return Ok(response);
        }
        Ok(response.with_patch(Patch(self.patches))?)
    }
}

pub struct PodMutator {
    annotation: String,
    configmap: String,
    filename: String,
    bundle_url: String,
    own_namespace: String,
    provisioner: ConfigMapProvisioner,
}

impl PodMutator {
    pub fn new(config: &InjectorConfig, provisioner: ConfigMapProvisioner) -> Self {
        Self {
            annotation: config.ca_bundle_annotation.clone(),
            configmap: config.ca_bundle_configmap.clone(),
            filename: config.ca_bundle_filename.clone(),
            bundle_url: config.ca_bundle_url.clone(),
            own_namespace: config.pod_namespace.clone(),
            provisioner,
        }
    }

    pub async fn decide(&self, pod: &Pod, deadline: Instant) -> Result<Mutation, WebhookError> {
        if !self.wants_bundle(pod) {
            debug!(pod = %display_name(pod), "annotation not set, skipping injection");
            return Ok(Mutation::skipped());
        }

        let namespace = self.effective_namespace(pod);
        let bundle = self
            .provisioner
            .ensure(namespace, &self.configmap, &self.bundle_url, &self.filename, deadline)
            .await?;

        let mutated = inject_bundle(pod, &bundle)?;
        let patches = diff_pods(pod, &mutated)?;
        debug!(
            pod = %display_name(pod),
            %namespace,
            operations = patches.len(),
            "computed CA bundle patch"
        );

        Ok(Mutation {
            patches,
            bundle: Some(bundle),
        })
    }

    fn wants_bundle(&self, pod: &Pod) -> bool {
        pod.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&self.annotation))
            .is_some_and(|v| v == "true")
    }

    /// Same-namespace admission requests often omit the namespace.
    fn effective_namespace<'a>(&'a self, pod: &'a Pod) -> &'a str {
        match pod.metadata.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => &self.own_namespace,
        }
    }
}

pub fn mount_path(bundle: &TrustBundleRef) -> String {
    format!("{CERTS_DIR}/{}", bundle.key)
}

/// Returns a copy of `pod` with the bundle volume and a mount in every
/// container and init container.
///
/// A volume already backed by the bundle ConfigMap, or a mount of it already
/// at the bundle path, is left alone so a re-submitted pod is not patched
/// twice. Any other use of that volume name or mount path is an error.
pub fn inject_bundle(pod: &Pod, bundle: &TrustBundleRef) -> Result<Pod, InjectError> {
    let mut mutated = pod.clone();
    let Some(spec) = mutated.spec.as_mut() else {
        return Ok(mutated);
    };

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    let existing = volumes.iter().find(|v| v.name == bundle.name).map(|v| {
        v.config_map
            .as_ref()
            .is_some_and(|cm| cm.name == bundle.name)
    });
    match existing {
        None => volumes.push(bundle_volume(bundle)),
        Some(true) => {}
        Some(false) => return Err(InjectError::VolumeConflict(bundle.name.clone())),
    }

    let mount = bundle_mount(bundle);
    if let Some(init_containers) = spec.init_containers.as_mut() {
        for container in init_containers {
            add_mount(container, &mount)?;
        }
    }
    for container in &mut spec.containers {
        add_mount(container, &mount)?;
    }

    Ok(mutated)
}

fn add_mount(container: &mut Container, mount: &VolumeMount) -> Result<(), InjectError> {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    match mounts.iter().find(|m| m.mount_path == mount.mount_path) {
        None => mounts.push(mount.clone()),
        Some(m) if m.name == mount.name => {}
        Some(m) => {
            return Err(InjectError::MountConflict {
                container: container.name.clone(),
                volume: m.name.clone(),
                path: m.mount_path.clone(),
            });
        }
    }
    Ok(())
}

fn bundle_volume(bundle: &TrustBundleRef) -> Volume {
    Volume {
        name: bundle.name.clone(),
        config_map: Some(ConfigMapVolumeSource {
            name: bundle.name.clone(),
            default_mode: Some(CONFIGMAP_DEFAULT_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn bundle_mount(bundle: &TrustBundleRef) -> VolumeMount {
    VolumeMount {
        name: bundle.name.clone(),
        mount_path: mount_path(bundle),
        sub_path: Some(bundle.key.clone()),
        read_only: Some(true),
        ..Default::default()
    }
}

/// JSON-Patch from `original` to `mutated`, covering the lists injection
/// touches: volumes, then init container mounts, then container mounts.
pub fn diff_pods(original: &Pod, mutated: &Pod) -> Result<Vec<PatchOperation>, EncodeError> {
    let mut ops = Vec::new();
    let (Some(before), Some(after)) = (original.spec.as_ref(), mutated.spec.as_ref()) else {
        return Ok(ops);
    };

    diff_list(&["spec", "volumes"], before.volumes.as_ref(), after.volumes.as_ref(), &mut ops)?;

    let empty = Vec::new();
    let lists = [
        (
            "initContainers",
            before.init_containers.as_ref().unwrap_or(&empty),
            after.init_containers.as_ref().unwrap_or(&empty),
        ),
        ("containers", &before.containers, &after.containers),
    ];
    for (field, original, patched) in lists {
        for (i, (b, a)) in original.iter().zip(patched).enumerate() {
            let idx = i.to_string();
            diff_list(
                &["spec", field, idx.as_str(), "volumeMounts"],
                b.volume_mounts.as_ref(),
                a.volume_mounts.as_ref(),
                &mut ops,
            )?;
        }
    }

    Ok(ops)
}

/// Appended entries become `add <path>/-`; a list the original lacked is added
/// whole; any other change replaces the list.
fn diff_list<T: Serialize + PartialEq>(
    path: &[&str],
    before: Option<&Vec<T>>,
    after: Option<&Vec<T>>,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), EncodeError> {
    let Some(after) = after else {
        return Ok(());
    };

    match before {
        Some(before) if before == after => {}
        None if after.is_empty() => {}
        None => ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(path.iter().copied()),
            value: serde_json::to_value(after)?,
        })),
        Some(before) if after.starts_with(before) => {
            for item in &after[before.len()..] {
                ops.push(PatchOperation::Add(AddOperation {
                    path: PointerBuf::from_tokens(path.iter().copied().chain(["-"])),
                    value: serde_json::to_value(item)?,
                }));
            }
        }
        Some(_) => ops.push(PatchOperation::Replace(ReplaceOperation {
            path: PointerBuf::from_tokens(path.iter().copied()),
            value: serde_json::to_value(after)?,
        })),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::StatusCode;
    use serde_json::{Value, json};

    use super::*;
    use crate::config::test_config;
    use crate::provisioner::ProvisionError;
    use crate::provisioner::fetch::{BundleFetcher, TEST_BUNDLE, serve_bundle};
    use crate::provisioner::store::memory::MemoryStore;

    fn bundle() -> TrustBundleRef {
        TrustBundleRef {
            name: "ca-bundle".to_string(),
            namespace: "ns1".to_string(),
            key: "ca_bundle.pem".to_string(),
            existed: true,
        }
    }

    fn pod_from(value: Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    fn annotated_pod(namespace: Option<&str>, containers: usize) -> Pod {
        pod_from(crate::admission::codec::fixtures::pod(
            namespace,
            json!({ "example.com/ca-injector": "true" }),
            containers,
        ))
    }

    fn paths(ops: &[PatchOperation]) -> Vec<String> {
        ops.iter()
            .map(|op| match op {
                PatchOperation::Add(add) => format!("add {}", add.path),
                PatchOperation::Replace(replace) => format!("replace {}", replace.path),
                other => format!("{other:?}"),
            })
            .collect()
    }

    fn apply(pod: &Pod, ops: &[PatchOperation]) -> Value {
        let mut doc = serde_json::to_value(pod).unwrap();
        json_patch::patch(&mut doc, ops).unwrap();
        doc
    }

    fn mutator(store: Arc<MemoryStore>, bundle_url: &str) -> PodMutator {
        let config = test_config(bundle_url);
        let fetcher = BundleFetcher::new(Duration::from_secs(5)).unwrap();
        PodMutator::new(&config, ConfigMapProvisioner::new(store, fetcher))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_single_container_patch() {
        let pod = annotated_pod(Some("ns1"), 1);
        let mutated = inject_bundle(&pod, &bundle()).unwrap();
        let ops = diff_pods(&pod, &mutated).unwrap();

        assert_eq!(
            paths(&ops),
            ["add /spec/volumes/-", "add /spec/containers/0/volumeMounts/-"]
        );

        let patched = apply(&pod, &ops);
        assert_eq!(patched, serde_json::to_value(&mutated).unwrap());
        assert_eq!(patched["spec"]["volumes"].as_array().unwrap().len(), 1);
        assert_eq!(
            patched["spec"]["volumes"][0],
            json!({ "name": "ca-bundle", "configMap": { "name": "ca-bundle", "defaultMode": 420 } })
        );
        let mounts = patched["spec"]["containers"][0]["volumeMounts"].as_array().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0]["mountPath"], "/etc/ssl/certs/ca_bundle.pem");
        assert_eq!(mounts[0]["subPath"], "ca_bundle.pem");
        assert_eq!(mounts[0]["name"], "ca-bundle");
    }

    #[test]
    fn test_original_pod_untouched() {
        let pod = annotated_pod(Some("ns1"), 2);
        let before = serde_json::to_value(&pod).unwrap();
        inject_bundle(&pod, &bundle()).unwrap();
        assert_eq!(serde_json::to_value(&pod).unwrap(), before);
    }

    #[test]
    fn test_zero_containers_only_adds_volume() {
        let pod = annotated_pod(Some("ns1"), 0);
        let ops = diff_pods(&pod, &inject_bundle(&pod, &bundle()).unwrap()).unwrap();
        assert_eq!(paths(&ops), ["add /spec/volumes/-"]);
    }

    #[test]
    fn test_missing_lists_are_added_whole() {
        let pod = pod_from(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "bare" },
            "spec": {
                "initContainers": [{ "name": "init" }],
                "containers": [{ "name": "app" }, { "name": "sidecar" }],
            },
        }));
        let mutated = inject_bundle(&pod, &bundle()).unwrap();
        let ops = diff_pods(&pod, &mutated).unwrap();

        assert_eq!(
            paths(&ops),
            [
                "add /spec/volumes",
                "add /spec/initContainers/0/volumeMounts",
                "add /spec/containers/0/volumeMounts",
                "add /spec/containers/1/volumeMounts",
            ]
        );
        assert_eq!(apply(&pod, &ops), serde_json::to_value(&mutated).unwrap());
    }

    #[test]
    fn test_existing_volumes_and_mounts_are_kept() {
        let pod = pod_from(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "busy" },
            "spec": {
                "volumes": [{ "name": "data", "emptyDir": {} }],
                "containers": [{
                    "name": "app",
                    "volumeMounts": [{ "name": "data", "mountPath": "/data" }],
                }],
            },
        }));
        let mutated = inject_bundle(&pod, &bundle()).unwrap();
        let ops = diff_pods(&pod, &mutated).unwrap();

        assert_eq!(
            paths(&ops),
            ["add /spec/volumes/-", "add /spec/containers/0/volumeMounts/-"]
        );
        let patched = apply(&pod, &ops);
        assert_eq!(patched["spec"]["volumes"][0]["name"], "data");
        assert_eq!(patched["spec"]["volumes"][1]["name"], "ca-bundle");
    }

    #[test]
    fn test_already_injected_pod_is_not_patched_again() {
        let pod = annotated_pod(Some("ns1"), 2);
        let once = inject_bundle(&pod, &bundle()).unwrap();
        let twice = inject_bundle(&once, &bundle()).unwrap();
        assert!(diff_pods(&once, &twice).unwrap().is_empty());
    }

    #[test]
    fn test_foreign_volume_with_bundle_name_is_rejected() {
        let pod = pod_from(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "clash" },
            "spec": {
                "volumes": [{ "name": "ca-bundle", "emptyDir": {} }],
                "containers": [{ "name": "app" }],
            },
        }));
        let err = inject_bundle(&pod, &bundle()).unwrap_err();
        assert!(matches!(err, InjectError::VolumeConflict(name) if name == "ca-bundle"));
    }

    #[test]
    fn test_foreign_mount_at_bundle_path_is_rejected() {
        let pod = pod_from(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "clash" },
            "spec": {
                "volumes": [{ "name": "certs", "secret": { "secretName": "certs" } }],
                "containers": [{
                    "name": "app",
                    "volumeMounts": [{ "name": "certs", "mountPath": "/etc/ssl/certs/ca_bundle.pem" }],
                }],
            },
        }));
        let err = inject_bundle(&pod, &bundle()).unwrap_err();
        assert!(matches!(err, InjectError::MountConflict { ref volume, .. } if volume == "certs"));
    }

    #[test]
    fn test_reordered_list_is_replaced() {
        let before: Vec<String> = vec!["a".into(), "b".into()];
        let after: Vec<String> = vec!["b".into(), "a".into()];
        let mut ops = Vec::new();
        diff_list(&["spec", "volumes"], Some(&before), Some(&after), &mut ops).unwrap();
        assert_eq!(paths(&ops), ["replace /spec/volumes"]);
    }

    #[tokio::test]
    async fn test_unannotated_pod_makes_no_calls() {
        let store = Arc::new(MemoryStore::default());
        let pod = pod_from(crate::admission::codec::fixtures::pod(
            Some("ns1"),
            json!({ "example.com/ca-injector": "false" }),
            1,
        ));

        let mutation = mutator(store.clone(), "http://127.0.0.1:1/ca.pem")
            .decide(&pod, deadline())
            .await
            .unwrap();
        assert!(mutation.patches.is_empty());
        assert!(mutation.bundle.is_none());
        assert_eq!(store.gets(), 0);
        assert_eq!(store.creates(), 0);
    }

    #[tokio::test]
    async fn test_namespace_falls_back_to_own() {
        let url = serve_bundle(StatusCode::OK, TEST_BUNDLE).await;
        let store = Arc::new(MemoryStore::default());

        let mutation = mutator(store.clone(), &url)
            .decide(&annotated_pod(None, 1), deadline())
            .await
            .unwrap();
        let bundle = mutation.bundle.unwrap();
        assert_eq!(bundle.namespace, "example");
        assert!(store.object("example", "ca-bundle").is_some());
        assert_eq!(mutation.patches.len(), 2);
    }

    #[tokio::test]
    async fn test_provision_failure_is_fatal() {
        let url = serve_bundle(StatusCode::OK, "not a certificate").await;
        let store = Arc::new(MemoryStore::default());

        let err = mutator(store, &url)
            .decide(&annotated_pod(Some("ns1"), 1), deadline())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            WebhookError::Provision(ProvisionError::InvalidBundle { .. })
        ));
    }
}
