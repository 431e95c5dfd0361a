mod admission;
mod config;
mod error;
mod handlers;
mod health;
mod metrics;
mod mutator;
mod provisioner;
mod tls;
mod validator;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use crate::admission::codec::AdmissionCodec;
use crate::provisioner::ConfigMapProvisioner;
use crate::provisioner::fetch::BundleFetcher;
use crate::provisioner::store::{self, KubeConfigMapStore};

#[derive(Parser)]
#[command(name = "ca-injector", about = "Injects a CA trust bundle into annotated pods")]
struct Cli {
    /// Optional YAML file layered under the environment
    #[arg(long, env = "INJECTOR_CONFIG")]
    config: Option<String>,
}

fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    error!("{context}: {err}");
    eprintln!("{context}: {err}");
    std::process::exit(1);
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received CTRL+C, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
        info!("received CTRL+C, shutting down");
    }

    let _ = shutdown_tx.send(());
}

async fn serve_webhooks(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept failed: {e}");
                    continue;
                }
            },
            _ = shutdown_rx.changed() => {
                info!("webhook listener stopped");
                break;
            }
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%peer, "TLS handshake failed: {e}");
                    return;
                }
            };

            let service = TowerToHyperService::new(router.into_service());
            if let Err(e) = HttpBuilder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                error!(%peer, "connection error: {e}");
            }
        });
    }
}

async fn serve_probes(listener: TcpListener, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("probe listener stopped");
        })
        .await;
    if let Err(e) = result {
        error!("probe server error: {e}");
    }
}

async fn bind(addr: &str) -> TcpListener {
    let addr: SocketAddr = addr
        .parse()
        .unwrap_or_else(|e| fail(&format!("invalid listen address '{addr}'"), e));
    TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| fail(&format!("failed to bind {addr}"), e))
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    let cli = Cli::parse();

    let config = config::InjectorConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter())),
        )
        .init();

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = %config.metrics_addr,
        ca_bundle_url = %config.ca_bundle_url,
        configmap = %config.ca_bundle_configmap,
        filename = %config.ca_bundle_filename,
        annotation = %config.ca_bundle_annotation,
        pod_namespace = %config.pod_namespace,
        "ca-injector starting"
    );

    let tls_config = tls::load_tls_config(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| fail("failed to load TLS config", e));

    let client = store::connect(config.kubeconfig.as_deref())
        .await
        .unwrap_or_else(|e| fail("failed to build Kubernetes client", e));
    let fetcher = BundleFetcher::new(config.request_timeout())
        .unwrap_or_else(|e| fail("failed to build HTTP client", e));
    let provisioner = ConfigMapProvisioner::new(Arc::new(KubeConfigMapStore::new(client)), fetcher);

    let mut registry = Registry::default();
    let injector_metrics = metrics::InjectorMetrics::new(&mut registry);

    let state = Arc::new(handlers::AppState {
        codec: AdmissionCodec,
        mutator: mutator::PodMutator::new(&config, provisioner),
        metrics: injector_metrics,
        request_timeout: config.request_timeout(),
    });

    let ready = Arc::new(AtomicBool::new(false));
    let probe_router = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics_handler))
        .with_state(Arc::new(health::HealthState {
            registry: Arc::new(registry),
            ready: ready.clone(),
        }));

    let webhook_listener = bind(&config.listen_addr).await;
    let probe_listener = bind(&config.metrics_addr).await;
    info!(addr = %config.listen_addr, "HTTPS webhook server listening");
    info!(addr = %config.metrics_addr, "HTTP probe server listening");
    ready.store(true, Ordering::Relaxed);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(shutdown_signal(shutdown_tx));

    tokio::join!(
        serve_webhooks(
            webhook_listener,
            TlsAcceptor::from(tls_config),
            handlers::webhook_router(state),
            shutdown_rx.clone(),
        ),
        serve_probes(probe_listener, probe_router, shutdown_rx),
    );

    info!("ca-injector shut down");
}
