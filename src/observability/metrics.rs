use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub trip_operations_total: IntCounterVec,
    pub fixes_total: IntCounterVec,
    pub reroutes_total: IntCounterVec,
    pub reroute_latency_seconds: HistogramVec,
    pub active_sessions: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let trip_operations_total = IntCounterVec::new(
            Opts::new(
                "trip_operations_total",
                "Trip state machine operations by operation and outcome",
            ),
            &["operation", "outcome"],
        )
        .expect("valid trip_operations_total metric");

        let fixes_total = IntCounterVec::new(
            Opts::new("fixes_total", "Raw location fixes by publisher decision"),
            &["decision"],
        )
        .expect("valid fixes_total metric");

        let reroutes_total = IntCounterVec::new(
            Opts::new("reroutes_total", "Route recalculations by outcome"),
            &["outcome"],
        )
        .expect("valid reroutes_total metric");

        let reroute_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "reroute_latency_seconds",
                "Latency of route recalculation in seconds",
            ),
            &["outcome"],
        )
        .expect("valid reroute_latency_seconds metric");

        let active_sessions = IntGauge::new("active_sessions", "Currently running trip sessions")
            .expect("valid active_sessions metric");

        registry
            .register(Box::new(trip_operations_total.clone()))
            .expect("register trip_operations_total");
        registry
            .register(Box::new(fixes_total.clone()))
            .expect("register fixes_total");
        registry
            .register(Box::new(reroutes_total.clone()))
            .expect("register reroutes_total");
        registry
            .register(Box::new(reroute_latency_seconds.clone()))
            .expect("register reroute_latency_seconds");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");

        Self {
            registry,
            trip_operations_total,
            fixes_total,
            reroutes_total,
            reroute_latency_seconds,
            active_sessions,
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
