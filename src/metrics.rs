use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: String,
    pub webhook: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub code: String,
    pub webhook: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProvisionLabels {
    pub outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub webhook: &'static str,
}

pub struct InjectorMetrics {
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub admission_responses_total: Family<ResponseLabels, Counter>,
    pub bundle_provisioning_total: Family<ProvisionLabels, Counter>,
    pub pods_injected_total: Counter,
    pub admission_request_duration_seconds: Family<WebhookLabels, Histogram>,
}

const DURATION_BUCKETS: [f64; 14] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn new_duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

impl InjectorMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "ca_injector_admission_requests",
            "Admission reviews decoded, by operation and webhook",
            admission_requests_total.clone(),
        );

        let admission_responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "ca_injector_admission_responses",
            "HTTP responses sent by the webhook routes, by status code",
            admission_responses_total.clone(),
        );

        let bundle_provisioning_total = Family::<ProvisionLabels, Counter>::default();
        registry.register(
            "ca_injector_bundle_provisioning",
            "CA bundle ConfigMap resolutions, by outcome",
            bundle_provisioning_total.clone(),
        );

        let pods_injected_total = Counter::default();
        registry.register(
            "ca_injector_pods_injected",
            "Pods answered with a non-empty CA bundle patch",
            pods_injected_total.clone(),
        );

        let admission_request_duration_seconds =
            Family::<WebhookLabels, Histogram>::new_with_constructor(new_duration_histogram);
        registry.register(
            "ca_injector_admission_request_duration_seconds",
            "Time spent answering an admission request in seconds",
            admission_request_duration_seconds.clone(),
        );

        Self {
            admission_requests_total,
            admission_responses_total,
            bundle_provisioning_total,
            pods_injected_total,
            admission_request_duration_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use prometheus_client::encoding::text::encode;

    use super::*;

    #[test]
    fn test_registered_families_are_exposed() {
        let mut registry = Registry::default();
        let metrics = InjectorMetrics::new(&mut registry);
        metrics
            .bundle_provisioning_total
            .get_or_create(&ProvisionLabels { outcome: "created" })
            .inc();
        metrics
            .admission_responses_total
            .get_or_create(&ResponseLabels { code: "200".to_string(), webhook: "mutate" })
            .inc();

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains(r#"ca_injector_bundle_provisioning_total{outcome="created"} 1"#));
        assert!(buffer.contains(r#"ca_injector_admission_responses_total{code="200",webhook="mutate"} 1"#));
    }
}
