use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Accumulators for the signaling surface. Constructed once at startup and
/// handed to the HTTP and WebSocket layers; all counters are monotonic except
/// the active-connection gauge.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub connections_total: IntCounter,
    pub active_connections: IntGauge,
    pub messages_total: IntCounter,
    pub auth_failures_total: IntCounter,
    pub rate_limited_total: IntCounter,
    pub relay_usage_total: IntCounter,
    pub ice_state_total: IntCounterVec,
    pub failure_reason_total: IntCounterVec,
    pub region_carrier_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "bs_ws_connections_total",
            "Signaling connections accepted since start",
        ))
        .unwrap();
        let active_connections = IntGauge::with_opts(Opts::new(
            "bs_ws_active_connections",
            "Currently live signaling sessions",
        ))
        .unwrap();
        let messages_total = IntCounter::with_opts(Opts::new(
            "bs_ws_messages_total",
            "Signaling frames received",
        ))
        .unwrap();
        let auth_failures_total = IntCounter::with_opts(Opts::new(
            "bs_ws_auth_failures_total",
            "Rejected credentials at handshake or register",
        ))
        .unwrap();
        let rate_limited_total = IntCounter::with_opts(Opts::new(
            "bs_ws_rate_limited_total",
            "Connections or messages rejected by rate limits",
        ))
        .unwrap();
        let relay_usage_total = IntCounter::with_opts(Opts::new(
            "bs_relay_usage_total",
            "Telemetry reports indicating TURN relay usage",
        ))
        .unwrap();
        let ice_state_total = IntCounterVec::new(
            Opts::new("bs_ice_state_total", "Reported ICE connection states"),
            &["ice_state"],
        )
        .unwrap();
        let failure_reason_total = IntCounterVec::new(
            Opts::new("bs_failure_reason_total", "Reported connection failure reasons"),
            &["reason"],
        )
        .unwrap();
        let region_carrier_total = IntCounterVec::new(
            Opts::new("bs_region_carrier_total", "Telemetry by region and carrier"),
            &["region", "carrier"],
        )
        .unwrap();

        registry.register(Box::new(connections_total.clone())).ok();
        registry.register(Box::new(active_connections.clone())).ok();
        registry.register(Box::new(messages_total.clone())).ok();
        registry.register(Box::new(auth_failures_total.clone())).ok();
        registry.register(Box::new(rate_limited_total.clone())).ok();
        registry.register(Box::new(relay_usage_total.clone())).ok();
        registry.register(Box::new(ice_state_total.clone())).ok();
        registry.register(Box::new(failure_reason_total.clone())).ok();
        registry.register(Box::new(region_carrier_total.clone())).ok();

        Self {
            registry,
            connections_total,
            active_connections,
            messages_total,
            auth_failures_total,
            rate_limited_total,
            relay_usage_total,
            ice_state_total,
            failure_reason_total,
            region_carrier_total,
        }
    }

    /// Gauge decrement saturating at zero; teardown runs exactly once per
    /// session so the gauge tracks live sessions.
    pub fn connection_closed(&self) {
        if self.active_connections.get() > 0 {
            self.active_connections.dec();
        }
    }

    /// Prometheus text exposition (`# HELP` / `# TYPE` per family).
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&families, &mut buffer) {
            tracing::error!(error = %err, "metrics encode failed");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
