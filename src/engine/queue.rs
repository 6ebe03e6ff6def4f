use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::index::GeoIndex;

/// Deterministic candidate list for a ride: available drivers within
/// `radius_m` of the pickup, minus any driver already holding a pending
/// offer, ordered by ascending distance (driver_id breaks ties), capped
/// at `max_len`. An empty result is valid and means `no_drivers`.
pub fn build(
    index: &GeoIndex,
    pickup: &GeoPoint,
    radius_m: f64,
    max_len: usize,
    holding_pending_offer: impl Fn(&Uuid) -> bool,
) -> Vec<Uuid> {
    index
        .query_nearby(pickup, radius_m)
        .into_iter()
        .map(|nearby| nearby.driver.driver_id)
        .filter(|driver_id| !holding_pending_offer(driver_id))
        .take(max_len)
        .collect()
}
