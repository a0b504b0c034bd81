use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub sessions_connected: IntGaugeVec,
    pub sessions_dropped_total: IntCounter,
    pub location_updates_total: IntCounterVec,
    pub status_transitions_total: IntCounterVec,
    pub persistence_errors_total: IntCounterVec,
    pub inbound_decode_errors_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_connected = IntGaugeVec::new(
            Opts::new("sessions_connected", "Currently registered sessions by role"),
            &["role"],
        )
        .expect("valid sessions_connected metric");

        let sessions_dropped_total = IntCounter::new(
            "sessions_dropped_total",
            "Sessions disconnected because their outbound queue was full",
        )
        .expect("valid sessions_dropped_total metric");

        let location_updates_total = IntCounterVec::new(
            Opts::new("location_updates_total", "Driver location reports by outcome"),
            &["outcome"],
        )
        .expect("valid location_updates_total metric");

        let status_transitions_total = IntCounterVec::new(
            Opts::new("status_transitions_total", "Delivery status transitions by new status"),
            &["status"],
        )
        .expect("valid status_transitions_total metric");

        let persistence_errors_total = IntCounterVec::new(
            Opts::new("persistence_errors_total", "Failed storage writes by operation"),
            &["operation"],
        )
        .expect("valid persistence_errors_total metric");

        let inbound_decode_errors_total = IntCounter::new(
            "inbound_decode_errors_total",
            "Inbound frames dropped because they could not be decoded",
        )
        .expect("valid inbound_decode_errors_total metric");

        registry
            .register(Box::new(sessions_connected.clone()))
            .expect("register sessions_connected");
        registry
            .register(Box::new(sessions_dropped_total.clone()))
            .expect("register sessions_dropped_total");
        registry
            .register(Box::new(location_updates_total.clone()))
            .expect("register location_updates_total");
        registry
            .register(Box::new(status_transitions_total.clone()))
            .expect("register status_transitions_total");
        registry
            .register(Box::new(persistence_errors_total.clone()))
            .expect("register persistence_errors_total");
        registry
            .register(Box::new(inbound_decode_errors_total.clone()))
            .expect("register inbound_decode_errors_total");

        Self {
            registry,
            sessions_connected,
            sessions_dropped_total,
            location_updates_total,
            status_transitions_total,
            persistence_errors_total,
            inbound_decode_errors_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
