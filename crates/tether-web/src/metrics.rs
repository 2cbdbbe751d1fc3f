//! Bridge metrics.
//!
//! An explicit registry object owned by the orchestrator and shared by
//! `Arc`; nothing registers into a process-global registry.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Counters, gauges, and histograms for the bridge.
pub struct Metrics {
    registry: Registry,
    /// Events consumed from the stream, by event type.
    pub events_total: IntCounterVec,
    /// Stream reconnect attempts, by agent.
    pub reconnects_total: IntCounterVec,
    /// Outbound deliveries that ultimately failed, by agent.
    pub delivery_failures_total: IntCounterVec,
    /// Outbound items dropped on queue overflow.
    pub outbound_dropped_total: IntCounter,
    /// Live channel-to-session mappings.
    pub active_sessions: IntGauge,
    /// Live sub-agent sessions.
    pub active_sub_agents: IntGauge,
    /// End-to-end dispatch latency per event.
    pub dispatch_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_total = IntCounterVec::new(
            Opts::new("tether_events_total", "Events consumed from the stream"),
            &["type"],
        )?;
        let reconnects_total = IntCounterVec::new(
            Opts::new("tether_reconnects_total", "Stream reconnect attempts"),
            &["agent"],
        )?;
        let delivery_failures_total = IntCounterVec::new(
            Opts::new(
                "tether_delivery_failures_total",
                "Outbound deliveries that exhausted retries or were rejected",
            ),
            &["agent"],
        )?;
        let outbound_dropped_total = IntCounter::new(
            "tether_outbound_dropped_total",
            "Outbound items dropped on queue overflow",
        )?;
        let active_sessions = IntGauge::new(
            "tether_active_sessions",
            "Live channel-to-session mappings",
        )?;
        let active_sub_agents =
            IntGauge::new("tether_active_sub_agents", "Live sub-agent sessions")?;
        let dispatch_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "tether_dispatch_seconds",
                "Latency from event receipt to dispatch completion",
            )
            .buckets(vec![0.005, 0.025, 0.1, 0.25, 1.0, 5.0, 30.0]),
        )?;

        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;
        registry.register(Box::new(delivery_failures_total.clone()))?;
        registry.register(Box::new(outbound_dropped_total.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(active_sub_agents.clone()))?;
        registry.register(Box::new(dispatch_seconds.clone()))?;

        Ok(Self {
            registry,
            events_total,
            reconnects_total,
            delivery_failures_total,
            outbound_dropped_total,
            active_sessions,
            active_sub_agents,
            dispatch_seconds,
        })
    }

    /// Render the standard text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
