use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub rides_total: IntCounterVec,
    pub offers_total: IntCounterVec,
    pub offer_resolution_seconds: HistogramVec,
    pub drivers_tracked: IntGauge,
    pub broadcasts_total: IntCounterVec,
    pub subscriptions_active: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let rides_total = IntCounterVec::new(
            Opts::new("rides_total", "Rides reaching a terminal state, by outcome"),
            &["outcome"],
        )
        .expect("valid rides_total metric");

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Resolved ride offers by outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let offer_resolution_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "offer_resolution_seconds",
                "Time from offer creation to its resolution in seconds",
            ),
            &["outcome"],
        )
        .expect("valid offer_resolution_seconds metric");

        let drivers_tracked =
            IntGauge::new("drivers_tracked", "Drivers currently held in the geo index")
                .expect("valid drivers_tracked metric");

        let broadcasts_total = IntCounterVec::new(
            Opts::new(
                "broadcasts_total",
                "Location broadcast decisions by result",
            ),
            &["result"],
        )
        .expect("valid broadcasts_total metric");

        let subscriptions_active =
            IntGauge::new("subscriptions_active", "Active passenger subscriptions")
                .expect("valid subscriptions_active metric");

        registry
            .register(Box::new(rides_total.clone()))
            .expect("register rides_total");
        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(offer_resolution_seconds.clone()))
            .expect("register offer_resolution_seconds");
        registry
            .register(Box::new(drivers_tracked.clone()))
            .expect("register drivers_tracked");
        registry
            .register(Box::new(broadcasts_total.clone()))
            .expect("register broadcasts_total");
        registry
            .register(Box::new(subscriptions_active.clone()))
            .expect("register subscriptions_active");

        Self {
            registry,
            rides_total,
            offers_total,
            offer_resolution_seconds,
            drivers_tracked,
            broadcasts_total,
            subscriptions_active,
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
