use std::error::Error as StdError;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(Box<dyn StdError + Send + Sync>);

impl StoreError {
    pub fn new(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        Self(Box::new(e))
    }
}

/// Namespaced ConfigMap reads and creates against the cluster.
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    /// `Ok(None)` when the ConfigMap does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError>;

    async fn create(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;
}

pub struct KubeConfigMapStore {
    client: Client,
}

impl KubeConfigMapStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigMapStore for KubeConfigMapStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),
    #[error("failed to infer cluster config: {0}")]
    Infer(#[from] InferConfigError),
    #[error("failed to build kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// Builds a client from an explicit kubeconfig path list, or from the
/// in-cluster service account / `$HOME/.kube/config` when none is given.
pub async fn connect(kubeconfig: Option<&str>) -> Result<Client, ClientError> {
    let config = match kubeconfig.map(read_kubeconfigs).transpose()?.flatten() {
        Some(kubeconfig) => {
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

/// Reads a `KUBECONFIG`-style path list, merging files in order the way
/// kubectl does. Empty entries are skipped.
fn read_kubeconfigs(paths: &str) -> Result<Option<Kubeconfig>, KubeconfigError> {
    let mut merged: Option<Kubeconfig> = None;
    for path in std::env::split_paths(paths).filter(|p| !p.as_os_str().is_empty()) {
        let next = Kubeconfig::read_from(&path)?;
        merged = Some(match merged {
            Some(current) => current.merge(next)?,
            None => next,
        });
    }
    Ok(merged)
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// ConfigMap store kept in process memory, counting calls.
    #[derive(Default)]
    pub struct MemoryStore {
        pub objects: Mutex<HashMap<(String, String), ConfigMap>>,
        pub gets: AtomicUsize,
        pub creates: AtomicUsize,
        /// Answer lookups with an empty object instead of `None`.
        pub empty_sentinel: bool,
        pub fail_lookups: bool,
        /// Lookups miss even when the object exists, as when another replica
        /// creates it between our lookup and create.
        pub blind_lookups: bool,
        /// Lookups never complete.
        pub stall_lookups: bool,
    }

    impl MemoryStore {
        pub fn insert(&self, namespace: &str, config_map: ConfigMap) {
            let name = config_map.metadata.name.clone().unwrap_or_default();
            self.objects
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name), config_map);
        }

        pub fn object(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
            self.objects
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        pub fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }

        pub fn creates(&self) -> usize {
            self.creates.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConfigMapStore for MemoryStore {
        async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.stall_lookups {
                std::future::pending::<()>().await;
            }
            if self.fail_lookups {
                return Err(StoreError::new("connection refused"));
            }
            if self.blind_lookups {
                return Ok(None);
            }
            match self.object(namespace, name) {
                Some(cm) => Ok(Some(cm)),
                None if self.empty_sentinel => Ok(Some(ConfigMap::default())),
                None => Ok(None),
            }
        }

        async fn create(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let name = config_map.metadata.name.clone().unwrap_or_default();
            let mut objects = self.objects.lock().unwrap();
            let key = (namespace.to_string(), name.clone());
            if objects.contains_key(&key) {
                return Err(StoreError::new(format!(
                    "configmaps \"{name}\" already exists"
                )));
            }
            objects.insert(key, config_map.clone());
            Ok(config_map.clone())
        }
    }
}
