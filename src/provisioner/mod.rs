pub mod fetch;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use self::fetch::{BundleFetcher, FetchError};
use self::store::{ConfigMapStore, StoreError};

/// Cheap sanity check on fetched content; the bundle is not parsed.
pub const PEM_CERTIFICATE_MARKER: &str = "-----BEGIN CERTIFICATE-----";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "ca-injector";

/// A ConfigMap holding the trust bundle under `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundleRef {
    pub name: String,
    pub namespace: String,
    pub key: String,
    /// False when this call created the ConfigMap.
    pub existed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lookup,
    Fetch,
    Create,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Lookup => "ConfigMap lookup",
            Stage::Fetch => "CA bundle fetch",
            Stage::Create => "ConfigMap create",
        })
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to look up ConfigMap {namespace}/{name}: {source}")]
    LookupFailed {
        namespace: String,
        name: String,
        source: StoreError,
    },
    #[error("failed to fetch CA bundle from {url}: {source}")]
    FetchFailed { url: String, source: FetchError },
    #[error("content served at {url} is not a PEM certificate bundle")]
    InvalidBundle { url: String },
    #[error("failed to create ConfigMap {namespace}/{name}: {source}")]
    CreateFailed {
        namespace: String,
        name: String,
        source: StoreError,
    },
    #[error("{0} did not finish before the request deadline")]
    TimedOut(Stage),
}

impl ProvisionError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ProvisionError::LookupFailed { .. } => "lookup_failed",
            ProvisionError::FetchFailed { .. } => "fetch_failed",
            ProvisionError::InvalidBundle { .. } => "invalid_bundle",
            ProvisionError::CreateFailed { .. } => "create_failed",
            ProvisionError::TimedOut(_) => "timed_out",
        }
    }
}

/// Makes sure the bundle ConfigMap exists in a namespace.
///
/// Holds no state of its own: the cluster is the source of truth. Two callers
/// racing on a fresh namespace both attempt the create; the store lets one
/// through and the other gets `CreateFailed`.
#[derive(Clone)]
pub struct ConfigMapProvisioner {
    store: Arc<dyn ConfigMapStore>,
    fetcher: BundleFetcher,
}

impl ConfigMapProvisioner {
    pub fn new(store: Arc<dyn ConfigMapStore>, fetcher: BundleFetcher) -> Self {
        Self { store, fetcher }
    }

    pub async fn ensure(
        &self,
        namespace: &str,
        name: &str,
        bundle_url: &str,
        data_key: &str,
        deadline: Instant,
    ) -> Result<TrustBundleRef, ProvisionError> {
        let reference = |existed| TrustBundleRef {
            name: name.to_string(),
            namespace: namespace.to_string(),
            key: data_key.to_string(),
            existed,
        };

        let existing = bounded(deadline, Stage::Lookup, self.store.get(namespace, name))
            .await?
            .map_err(|source| ProvisionError::LookupFailed {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })?;

        // Some backends answer a miss with an empty object instead of a 404.
        if existing.is_some_and(|cm| cm.metadata.name.is_some_and(|n| !n.is_empty())) {
            debug!(%namespace, configmap = %name, "CA bundle ConfigMap already present");
            return Ok(reference(true));
        }

        let bundle = bounded(deadline, Stage::Fetch, self.fetcher.fetch(bundle_url))
            .await?
            .map_err(|source| ProvisionError::FetchFailed {
                url: bundle_url.to_string(),
                source,
            })?;

        if !bundle.contains(PEM_CERTIFICATE_MARKER) {
            warn!(url = %bundle_url, "fetched CA bundle has no PEM certificate");
            return Err(ProvisionError::InvalidBundle {
                url: bundle_url.to_string(),
            });
        }

        let config_map = bundle_config_map(name, namespace, data_key, bundle);
        bounded(deadline, Stage::Create, self.store.create(namespace, &config_map))
            .await?
            .map_err(|source| ProvisionError::CreateFailed {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })?;

        info!(%namespace, configmap = %name, key = %data_key, "created CA bundle ConfigMap");
        Ok(reference(false))
    }
}

async fn bounded<F: Future>(deadline: Instant, stage: Stage, fut: F) -> Result<F::Output, ProvisionError> {
    timeout_at(deadline, fut)
        .await
        .map_err(|_| ProvisionError::TimedOut(stage))
}

fn bundle_config_map(name: &str, namespace: &str, data_key: &str, bundle: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(data_key.to_string(), bundle)])),
        ..Default::default()
    }
}
