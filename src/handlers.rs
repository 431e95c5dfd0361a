use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::admission::codec::{AdmissionCodec, JSON_MEDIA_TYPE};
use crate::admission::{display_name, guard};
use crate::error::WebhookError;
use crate::health;
use crate::metrics::{InjectorMetrics, ProvisionLabels, RequestLabels, ResponseLabels, WebhookLabels};
use crate::mutator::{Mutation, PodMutator};
use crate::validator;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub struct AppState {
    pub codec: AdmissionCodec,
    pub mutator: PodMutator,
    pub metrics: InjectorMetrics,
    /// Ceiling for the time spent on external calls per review.
    pub request_timeout: Duration,
}

pub type SharedState = Arc<AppState>;

#[derive(Clone, Copy)]
enum WebhookType {
    Validate,
    Mutate,
}

impl WebhookType {
    fn as_str(self) -> &'static str {
        match self {
            WebhookType::Validate => "validate",
            WebhookType::Mutate => "mutate",
        }
    }
}

/// Query string the API server appends to webhook calls, e.g. `?timeout=10s`.
#[derive(Debug, Default, Deserialize)]
pub struct ReviewParams {
    timeout: Option<String>,
}

/// Routes served on the TLS listener. Webhook routes accept every method so
/// the codec answers 405 itself.
pub fn webhook_router(state: SharedState) -> Router {
    Router::new()
        .route("/mutate", any(handle_mutate))
        .route("/validate", any(handle_validate))
        .route("/health", get(health::health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn handle_mutate(
    state: State<SharedState>,
    params: Query<ReviewParams>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(state, params, method, headers, body, WebhookType::Mutate).await
}

pub async fn handle_validate(
    state: State<SharedState>,
    params: Query<ReviewParams>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(state, params, method, headers, body, WebhookType::Validate).await
}

async fn handle_webhook(
    State(state): State<SharedState>,
    Query(params): Query<ReviewParams>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    webhook_type: WebhookType,
) -> Response {
    let start = Instant::now();
    let wh = webhook_type.as_str();
    let deadline = start + request_budget(params.timeout.as_deref(), state.request_timeout);

    let response = match answer_review(&state, webhook_type, &method, &headers, &body, deadline).await {
        Ok(encoded) => ([(header::CONTENT_TYPE, JSON_MEDIA_TYPE)], encoded).into_response(),
        Err(e) => {
            if e.is_client_error() {
                warn!(webhook = wh, %method, "rejected admission request: {e}");
            } else {
                error!(webhook = wh, "admission request failed: {e}");
            }
            e.into_response()
        }
    };

    record_response_metrics(&state, wh, response.status());
    observe_request_duration(&state, wh, start);
    response
}

async fn answer_review(
    state: &AppState,
    webhook_type: WebhookType,
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
    deadline: Instant,
) -> Result<Vec<u8>, WebhookError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let request = state.codec.decode(method, content_type, body)?;
    record_request_metrics(state, &request, webhook_type.as_str());

    let pod = guard::check(&request).inspect_err(|e| {
        warn!(uid = %request.uid, "resource guard rejected object: {e}");
    })?;

    let response = match webhook_type {
        WebhookType::Validate => validator::decide(&request, &pod),
        WebhookType::Mutate => {
            let mutation = state.mutator.decide(&pod, deadline).await;
            record_mutation_metrics(state, &mutation);
            let mutation = mutation.inspect_err(|e| {
                error!(uid = %request.uid, pod = %display_name(&pod), "CA bundle injection failed: {e}");
            })?;
            mutation_response(&request, mutation)?
        }
    };

    Ok(state.codec.encode(response)?)
}

fn mutation_response(
    request: &AdmissionRequest<DynamicObject>,
    mutation: Mutation,
) -> Result<AdmissionResponse, WebhookError> {
    if let Some(bundle) = &mutation.bundle {
        info!(
            uid = %request.uid,
            namespace = %bundle.namespace,
            configmap = %bundle.name,
            operations = mutation.patches.len(),
            "injecting CA bundle"
        );
    } else {
        debug!(uid = %request.uid, "no CA bundle requested");
    }
    Ok(mutation.into_response(request)?)
}

/// Time allowed for external calls: the API server's own timeout when it
/// sent one, never more than the configured ceiling.
fn request_budget(timeout: Option<&str>, ceiling: Duration) -> Duration {
    timeout
        .and_then(parse_timeout)
        .map_or(ceiling, |requested| requested.min(ceiling))
}

fn parse_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(s) = value.strip_suffix('s') {
        s.parse::<f64>().ok().and_then(|s| Duration::try_from_secs_f64(s).ok())
    } else if let Some(m) = value.strip_suffix('m') {
        m.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        None
    }
}

fn record_request_metrics(
    state: &AppState,
    req: &AdmissionRequest<DynamicObject>,
    webhook: &'static str,
) {
    let operation = format!("{:?}", req.operation).to_uppercase();
    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels { operation, webhook })
        .inc();
}

fn record_mutation_metrics(state: &AppState, mutation: &Result<Mutation, WebhookError>) {
    let outcome = match mutation {
        Ok(Mutation { bundle: None, .. }) => return,
        Ok(Mutation { bundle: Some(b), patches }) => {
            if !patches.is_empty() {
                state.metrics.pods_injected_total.inc();
            }
            if b.existed { "existing" } else { "created" }
        }
        Err(WebhookError::Provision(e)) => e.as_label(),
        Err(_) => return,
    };
    state
        .metrics
        .bundle_provisioning_total
        .get_or_create(&ProvisionLabels { outcome })
        .inc();
}

fn record_response_metrics(state: &AppState, webhook: &'static str, status: StatusCode) {
    state
        .metrics
        .admission_responses_total
        .get_or_create(&ResponseLabels {
            code: status.as_str().to_string(),
            webhook,
        })
        .inc();
}

fn observe_request_duration(state: &AppState, webhook: &'static str, start: Instant) {
    state
        .metrics
        .admission_request_duration_seconds
        .get_or_create(&WebhookLabels { webhook })
        .observe(start.elapsed().as_secs_f64());
}
