//! Federated round metrics on the global OpenTelemetry meter.
//!
//! Instruments are no-ops until the host process installs a meter provider.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

pub struct FederatedLearningMetrics {
    pub rounds_total: Counter<u64>,
    pub empty_rounds_total: Counter<u64>,
    pub client_invocations_total: Counter<u64>,
    pub client_failures_total: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub round_latency_ms: Histogram<f64>,
}

static FL_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedsim"));

pub static FL_METRICS: Lazy<FederatedLearningMetrics> = Lazy::new(|| FederatedLearningMetrics {
    rounds_total: FL_METER
        .u64_counter("fedsim_rounds_total")
        .with_description("Federated rounds completed")
        .build(),
    empty_rounds_total: FL_METER
        .u64_counter("fedsim_empty_rounds_total")
        .with_description("Rounds without a single successful client")
        .build(),
    client_invocations_total: FL_METER
        .u64_counter("fedsim_client_invocations_total")
        .with_description("Client fit/evaluate invocations dispatched")
        .build(),
    client_failures_total: FL_METER
        .u64_counter("fedsim_client_failures_total")
        .with_description("Client invocations excluded from aggregation")
        .build(),
    aggregation_latency_ms: FL_METER
        .f64_histogram("fedsim_aggregation_latency_ms")
        .with_description("Aggregation latency ms")
        .with_unit("ms")
        .build(),
    round_latency_ms: FL_METER
        .f64_histogram("fedsim_round_latency_ms")
        .with_description("Wall time of one round including client work (ms)")
        .with_unit("ms")
        .build(),
});

pub(crate) fn record_invocations(kind: &'static str, n: usize) {
    FL_METRICS.client_invocations_total.add(n as u64, &[KeyValue::new("kind", kind)]);
}

pub(crate) fn record_failure(kind: &'static str, reason: &'static str) {
    FL_METRICS
        .client_failures_total
        .add(1, &[KeyValue::new("kind", kind), KeyValue::new("reason", reason)]);
}
