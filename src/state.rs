use std::sync::Arc;

use chrono::Duration;

use crate::broadcast::BroadcastRouter;
use crate::config::Config;
use crate::engine::dispatch::DispatchCoordinator;
use crate::gateway::Gateway;
use crate::index::GeoIndex;
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub config: Config,
    pub index: Arc<GeoIndex>,
    pub dispatch: Arc<DispatchCoordinator>,
    pub router: Arc<BroadcastRouter>,
    pub gateway: Gateway,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let metrics = Metrics::new();
        let gateway = Gateway::new(config.event_buffer_size);
        let index = Arc::new(GeoIndex::new(
            Duration::seconds(config.location_ttl_secs as i64),
            config.geohash_precision,
            config.min_broadcast_distance_m,
        ));
        let dispatch = DispatchCoordinator::new(
            index.clone(),
            gateway.clone(),
            metrics.clone(),
            &config,
        );
        let router = Arc::new(BroadcastRouter::new(
            index.clone(),
            metrics.clone(),
            &config,
        ));

        Self {
            config,
            index,
            dispatch,
            router,
            gateway,
            metrics,
        }
    }
}
