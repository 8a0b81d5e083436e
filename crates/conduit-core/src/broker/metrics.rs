use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// OTel instruments for queue and saga activity. Created once per scheduler /
/// engine and used to record counters and gauges on each transition.
#[derive(Clone)]
pub struct Metrics {
    pub messages_sent: Counter<u64>,
    pub messages_received: Counter<u64>,
    pub messages_completed: Counter<u64>,
    pub messages_retried: Counter<u64>,
    pub messages_dead_lettered: Counter<u64>,
    pub messages_expired: Counter<u64>,
    pub queue_depth: Gauge<u64>,
    pub sagas_started: Counter<u64>,
    pub sagas_completed: Counter<u64>,
    pub sagas_compensated: Counter<u64>,
    pub sagas_failed: Counter<u64>,
    pub compensations_failed: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn queue_attr(queue: &str) -> [KeyValue; 1] {
    [KeyValue::new("queue", queue.to_string())]
}

fn saga_attr(saga: &str) -> [KeyValue; 1] {
    [KeyValue::new("saga", saga.to_string())]
}

impl Metrics {
    /// Create metrics from the global meter provider. If no meter provider
    /// is configured, the instruments are no-op.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("conduit");
        Self::from_meter(&meter)
    }

    /// Create metrics from a specific meter (used in tests with in-memory exporter).
    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            messages_sent: meter
                .u64_counter("conduit.messages.sent")
                .with_description("Messages accepted by SendMessage")
                .build(),
            messages_received: meter
                .u64_counter("conduit.messages.received")
                .with_description("Messages handed to consumers")
                .build(),
            messages_completed: meter
                .u64_counter("conduit.messages.completed")
                .with_description("Messages completed by consumers")
                .build(),
            messages_retried: meter
                .u64_counter("conduit.messages.retried")
                .with_description("Failed messages scheduled for retry")
                .build(),
            messages_dead_lettered: meter
                .u64_counter("conduit.messages.dead_lettered")
                .with_description("Messages that exhausted their retry budget")
                .build(),
            messages_expired: meter
                .u64_counter("conduit.messages.expired")
                .with_description("Messages dropped because their expiry passed")
                .build(),
            queue_depth: meter
                .u64_gauge("conduit.queue.depth")
                .with_description("Current pending messages per queue")
                .build(),
            sagas_started: meter
                .u64_counter("conduit.sagas.started")
                .with_description("Saga executions started")
                .build(),
            sagas_completed: meter
                .u64_counter("conduit.sagas.completed")
                .with_description("Saga executions that completed every step")
                .build(),
            sagas_compensated: meter
                .u64_counter("conduit.sagas.compensated")
                .with_description("Saga executions rolled back by compensation")
                .build(),
            sagas_failed: meter
                .u64_counter("conduit.sagas.failed")
                .with_description("Saga executions that ended failed")
                .build(),
            compensations_failed: meter
                .u64_counter("conduit.saga.compensations.failed")
                .with_description("Compensation actions that failed and were skipped")
                .build(),
        }
    }

    pub fn record_sent(&self, queue: &str) {
        self.messages_sent.add(1, &queue_attr(queue));
    }

    pub fn record_received(&self, queue: &str) {
        self.messages_received.add(1, &queue_attr(queue));
    }

    pub fn record_completed(&self, queue: &str) {
        self.messages_completed.add(1, &queue_attr(queue));
    }

    pub fn record_retried(&self, queue: &str) {
        self.messages_retried.add(1, &queue_attr(queue));
    }

    pub fn record_dead_lettered(&self, queue: &str) {
        self.messages_dead_lettered.add(1, &queue_attr(queue));
    }

    pub fn record_expired(&self, queue: &str) {
        self.messages_expired.add(1, &queue_attr(queue));
    }

    pub fn set_queue_depth(&self, queue: &str, depth: u64) {
        self.queue_depth.record(depth, &queue_attr(queue));
    }

    pub fn record_saga_started(&self, saga: &str) {
        self.sagas_started.add(1, &saga_attr(saga));
    }

    pub fn record_saga_completed(&self, saga: &str) {
        self.sagas_completed.add(1, &saga_attr(saga));
    }

    pub fn record_saga_compensated(&self, saga: &str) {
        self.sagas_compensated.add(1, &saga_attr(saga));
    }

    pub fn record_saga_failed(&self, saga: &str) {
        self.sagas_failed.add(1, &saga_attr(saga));
    }

    pub fn record_compensation_failed(&self, saga: &str) {
        self.compensations_failed.add(1, &saga_attr(saga));
    }
}

/// Test harness for asserting OTel metrics using an in-memory exporter.
#[cfg(test)]
pub mod test_harness {
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
    use opentelemetry_sdk::metrics::in_memory_exporter::InMemoryMetricExporter;
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    use super::Metrics;

    /// Wires an in-memory exporter to a meter provider, creating `Metrics`
    /// instruments bound to it.
    pub struct MetricTestHarness {
        pub metrics: Metrics,
        pub exporter: InMemoryMetricExporter,
        pub meter_provider: SdkMeterProvider,
    }

    impl MetricTestHarness {
        pub fn new() -> Self {
            let exporter = InMemoryMetricExporter::default();
            let reader = PeriodicReader::builder(exporter.clone()).build();
            let meter_provider = SdkMeterProvider::builder().with_reader(reader).build();
            let meter = meter_provider.meter("conduit-test");
            let metrics = Metrics::from_meter(&meter);
            Self {
                metrics,
                exporter,
                meter_provider,
            }
        }

        /// Read a u64 counter for one `attr_key=attr_value` label after a flush.
        pub fn counter(&self, metric_name: &str, attr_key: &str, attr_value: &str) -> Option<u64> {
            self.meter_provider.force_flush().expect("flush failed");
            let metrics = self
                .exporter
                .get_finished_metrics()
                .expect("failed to get finished metrics");
            counter_value_u64(
                &metrics,
                metric_name,
                &KeyValue::new(attr_key.to_string(), attr_value.to_string()),
            )
        }
    }

    fn counter_value_u64(
        resource_metrics: &[ResourceMetrics],
        name: &str,
        expected_attr: &KeyValue,
    ) -> Option<u64> {
        // Exporter keeps every flush; the last matching point is the newest.
        let mut found = None;
        for rm in resource_metrics {
            for sm in rm.scope_metrics() {
                for metric in sm.metrics() {
                    if metric.name() != name {
                        continue;
                    }
                    if let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() {
                        for dp in sum.data_points() {
                            if dp.attributes().any(|a| a == expected_attr) {
                                found = Some(dp.value());
                            }
                        }
                    }
                }
            }
        }
        found
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn queue_counters_are_labelled_by_queue() {
            let h = MetricTestHarness::new();
            h.metrics.record_sent("orders");
            h.metrics.record_sent("orders");
            h.metrics.record_sent("billing");
            h.metrics.record_dead_lettered("orders");

            assert_eq!(h.counter("conduit.messages.sent", "queue", "orders"), Some(2));
            assert_eq!(h.counter("conduit.messages.sent", "queue", "billing"), Some(1));
            assert_eq!(
                h.counter("conduit.messages.dead_lettered", "queue", "orders"),
                Some(1)
            );
            assert_eq!(h.counter("conduit.messages.completed", "queue", "orders"), None);
        }

        #[test]
        fn saga_counters_are_labelled_by_saga() {
            let h = MetricTestHarness::new();
            h.metrics.record_saga_started("checkout");
            h.metrics.record_saga_compensated("checkout");
            h.metrics.record_compensation_failed("checkout");

            assert_eq!(h.counter("conduit.sagas.started", "saga", "checkout"), Some(1));
            assert_eq!(
                h.counter("conduit.sagas.compensated", "saga", "checkout"),
                Some(1)
            );
            assert_eq!(
                h.counter("conduit.saga.compensations.failed", "saga", "checkout"),
                Some(1)
            );
        }
    }
}
