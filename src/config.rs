use std::time::Duration;

use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Deserializer, Serialize, de};
use thiserror::Error;

/// Environment variables read without the `INJECTOR_` prefix, as set by the
/// deployment manifests.
const BARE_ENV_KEYS: [&str; 7] = [
    "CA_BUNDLE_URL",
    "CA_BUNDLE_CONFIGMAP",
    "CA_BUNDLE_FILENAME",
    "CA_BUNDLE_ANNOTATION",
    "POD_NAMESPACE",
    "DEBUG",
    "KUBECONFIG",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] Box<figment::Error>),
    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_tls_cert_path() -> String {
    "/certs/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/certs/tls.key".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_configmap() -> String {
    "ca-bundle".to_string()
}

fn default_filename() -> String {
    "ca-bundle.pem".to_string()
}

fn default_pod_namespace() -> String {
    "default".to_string()
}

/// Accepts `true`/`false`, `1`/`0`, `yes`/`no` and `on`/`off`, since
/// deployment manifests set `DEBUG` every which way.
fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(i) => Ok(i != 0),
        Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "" | "0" | "false" | "no" | "off" => Ok(false),
            other => Err(de::Error::custom(format!("'{other}' is not a boolean"))),
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectorConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub debug: bool,
    /// Path to a kubeconfig; in-cluster configuration is used when unset.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Upper bound for the external calls made while answering one review.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    pub ca_bundle_url: String,
    #[serde(default = "default_configmap")]
    pub ca_bundle_configmap: String,
    #[serde(default = "default_filename")]
    pub ca_bundle_filename: String,
    pub ca_bundle_annotation: String,
    /// Namespace the webhook runs in, used for pods submitted without one.
    #[serde(default = "default_pod_namespace")]
    pub pod_namespace: String,
}

impl InjectorConfig {
    /// Resolves the configuration once: defaults, then the optional YAML file,
    /// then `INJECTOR_*` variables, then the bare deployment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }

        let config: Self = figment
            .merge(Env::prefixed("INJECTOR_"))
            .merge(Env::raw().only(&BARE_ENV_KEYS))
            .extract()
            .map_err(Box::new)?;

        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        match reqwest::Url::parse(&self.ca_bundle_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ConfigError::Invalid {
                    field: "ca_bundle_url",
                    reason: format!("unsupported scheme '{}'", url.scheme()),
                });
            }
            Err(e) => {
                return Err(ConfigError::Invalid {
                    field: "ca_bundle_url",
                    reason: e.to_string(),
                });
            }
        }

        for (field, value) in [
            ("ca_bundle_configmap", &self.ca_bundle_configmap),
            ("ca_bundle_filename", &self.ca_bundle_filename),
            ("ca_bundle_annotation", &self.ca_bundle_annotation),
            ("pod_namespace", &self.pod_namespace),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }

        if self.ca_bundle_filename.contains('/') {
            return Err(ConfigError::Invalid {
                field: "ca_bundle_filename",
                reason: format!("'{}' must be a plain file name", self.ca_bundle_filename),
            });
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Default tracing filter when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &str {
        if self.debug { "debug" } else { &self.log_level }
    }
}

#[cfg(test)]
pub(crate) fn test_config(bundle_url: &str) -> InjectorConfig {
    InjectorConfig {
        listen_addr: default_listen_addr(),
        metrics_addr: default_metrics_addr(),
        tls_cert_path: default_tls_cert_path(),
        tls_key_path: default_tls_key_path(),
        log_level: default_log_level(),
        debug: false,
        kubeconfig: None,
        request_timeout_secs: 5,
        ca_bundle_url: bundle_url.to_string(),
        ca_bundle_configmap: "ca-bundle".to_string(),
        ca_bundle_filename: "ca_bundle.pem".to_string(),
        ca_bundle_annotation: "example.com/ca-injector".to_string(),
        pod_namespace: "example".to_string(),
    }
}
