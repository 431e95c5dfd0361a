use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("bundle exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("bundle is not valid UTF-8")]
    NotUtf8,
}

/// ConfigMaps cannot hold more than 1 MiB.
pub const MAX_BUNDLE_BYTES: usize = 1024 * 1024;

/// Downloads the trust bundle served at the configured URL.
#[derive(Clone)]
pub struct BundleFetcher {
    client: reqwest::Client,
}

impl BundleFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ca-injector/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        debug!(%url, "fetching CA bundle");
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let limit = MAX_BUNDLE_BYTES;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(FetchError::TooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        String::from_utf8(body).map_err(|_| FetchError::NotUtf8)
    }
}

/// Serves `body` with `status` on an ephemeral local port and returns its URL.
#[cfg(test)]
pub(crate) async fn serve_bundle(status: StatusCode, body: &'static str) -> String {
    use axum::Router;
    use axum::routing::get;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new().route("/ca.pem", get(move || async move { (status, body) }));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/ca.pem")
}

#[cfg(test)]
pub(crate) const TEST_BUNDLE: &str = "-----BEGIN CERTIFICATE-----\n\
MIIBszCCAVmgAwIBAgIUUw3f\n\
-----END CERTIFICATE-----\n";
