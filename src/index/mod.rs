use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::tiles::tile_for;
use crate::geo::{GeoPoint, haversine_m};
use crate::models::driver::{DriverLocation, DriverStatus};

/// Outcome of a location ping, with the movement signals the broadcast
/// router needs for rate limiting.
#[derive(Debug, Clone)]
pub struct LocationUpdate {
    pub entry: DriverLocation,
    pub moved_significantly: bool,
    pub tile_changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyDriver {
    #[serde(flatten)]
    pub driver: DriverLocation,
    pub distance_m: f64,
}

/// Concurrent driver position/status store. Entries are partitioned by
/// driver_id; each update takes the exclusive entry for that key only,
/// so pings for different drivers never contend.
pub struct GeoIndex {
    entries: DashMap<Uuid, DriverLocation>,
    ttl: Duration,
    precision: usize,
    min_move_m: f64,
}

impl GeoIndex {
    pub fn new(ttl: Duration, precision: usize, min_move_m: f64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            precision,
            min_move_m,
        }
    }

    /// Creates or refreshes the driver's entry. `status` of None keeps
    /// the current status (Available for a first ping).
    pub fn update_location(
        &self,
        driver_id: Uuid,
        position: GeoPoint,
        status: Option<DriverStatus>,
    ) -> Result<LocationUpdate, AppError> {
        position.validate()?;
        let tile = tile_for(&position, self.precision)?;
        let now = Utc::now();

        match self.entries.entry(driver_id) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get().clone();
                let entry = occupied.get_mut();
                entry.position = position;
                entry.tile = tile;
                if let Some(status) = status {
                    entry.status = status;
                }
                entry.updated_at = now;

                Ok(LocationUpdate {
                    moved_significantly: haversine_m(&previous.position, &position)
                        >= self.min_move_m,
                    tile_changed: previous.tile != entry.tile,
                    entry: entry.clone(),
                })
            }
            Entry::Vacant(vacant) => {
                let entry = DriverLocation {
                    driver_id,
                    position,
                    tile,
                    status: status.unwrap_or(DriverStatus::Available),
                    updated_at: now,
                };
                vacant.insert(entry.clone());

                Ok(LocationUpdate {
                    entry,
                    moved_significantly: true,
                    tile_changed: true,
                })
            }
        }
    }

    /// Available, non-expired drivers within `radius_m` of `center`,
    /// ordered by ascending distance with driver_id as the tie-break.
    pub fn query_nearby(&self, center: &GeoPoint, radius_m: f64) -> Vec<NearbyDriver> {
        let now = Utc::now();

        let mut nearby: Vec<NearbyDriver> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let driver = entry.value();
                if driver.status != DriverStatus::Available || self.is_expired(driver, now) {
                    return None;
                }

                let distance_m = haversine_m(&driver.position, center);
                if distance_m <= radius_m {
                    Some(NearbyDriver {
                        driver: driver.clone(),
                        distance_m,
                    })
                } else {
                    None
                }
            })
            .collect();

        nearby.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.driver.driver_id.cmp(&b.driver.driver_id))
        });

        nearby
    }

    /// Sets the status without touching the position; refreshes the TTL.
    pub fn set_status(
        &self,
        driver_id: Uuid,
        status: DriverStatus,
    ) -> Result<DriverLocation, AppError> {
        let mut entry = self
            .entries
            .get_mut(&driver_id)
            .ok_or_else(|| AppError::NotFound(format!("driver {} not found", driver_id)))?;

        entry.status = status;
        entry.updated_at = Utc::now();

        Ok(entry.clone())
    }

    pub fn get(&self, driver_id: &Uuid) -> Option<DriverLocation> {
        self.entries.get(driver_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, driver_id: &Uuid) -> bool {
        self.entries.remove(driver_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts entries whose TTL has lapsed. Returns how many were dropped.
    pub fn expire_sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !self.is_expired(entry, now));
        before - self.entries.len()
    }

    fn is_expired(&self, entry: &DriverLocation, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.updated_at) > self.ttl
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::GeoIndex;
    use crate::geo::GeoPoint;
    use crate::models::driver::DriverStatus;

    fn index() -> GeoIndex {
        GeoIndex::new(Duration::seconds(60), 6, 25.0)
    }

    fn point(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint { lat, lng }
    }

    #[test]
    fn first_ping_counts_as_significant_movement() {
        let index = index();
        let update = index
            .update_location(Uuid::from_u128(1), point(52.52, 13.405), None)
            .unwrap();

        assert!(update.moved_significantly);
        assert!(update.tile_changed);
        assert_eq!(update.entry.status, DriverStatus::Available);
    }

    #[test]
    fn small_movement_is_not_significant() {
        let index = index();
        let id = Uuid::from_u128(1);
        index.update_location(id, point(52.52, 13.405), None).unwrap();

        // ~1 m north, same tile.
        let update = index
            .update_location(id, point(52.52001, 13.405), None)
            .unwrap();
        assert!(!update.moved_significantly);
        assert!(!update.tile_changed);
    }

    #[test]
    fn query_orders_by_distance_and_filters_unavailable() {
        let index = index();
        let near = Uuid::from_u128(1);
        let far = Uuid::from_u128(2);
        let busy = Uuid::from_u128(3);

        index.update_location(near, point(0.0, 0.001), None).unwrap();
        index.update_location(far, point(0.0, 0.01), None).unwrap();
        index
            .update_location(busy, point(0.0, 0.0), Some(DriverStatus::Busy))
            .unwrap();

        let nearby = index.query_nearby(&point(0.0, 0.0), 5_000.0);
        let ids: Vec<_> = nearby.iter().map(|n| n.driver.driver_id).collect();
        assert_eq!(ids, vec![near, far]);
        assert!(nearby[0].distance_m < nearby[1].distance_m);
    }

    #[test]
    fn equidistant_drivers_tie_break_on_driver_id() {
        let index = index();
        let high = Uuid::from_u128(9);
        let low = Uuid::from_u128(1);

        index.update_location(high, point(0.0, 0.001), None).unwrap();
        index.update_location(low, point(0.0, 0.001), None).unwrap();

        let nearby = index.query_nearby(&point(0.0, 0.0), 5_000.0);
        let ids: Vec<_> = nearby.iter().map(|n| n.driver.driver_id).collect();
        assert_eq!(ids, vec![low, high]);
    }

    #[test]
    fn expired_entries_are_invisible_and_swept() {
        let index = GeoIndex::new(Duration::zero(), 6, 25.0);
        index
            .update_location(Uuid::from_u128(1), point(0.0, 0.0), None)
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(index.query_nearby(&point(0.0, 0.0), 5_000.0).is_empty());
        assert_eq!(index.expire_sweep(), 1);
        assert!(index.is_empty());
    }

    #[test]
    fn set_status_on_unknown_driver_is_not_found() {
        let index = index();
        let result = index.set_status(Uuid::from_u128(7), DriverStatus::Offline);
        assert!(result.is_err());
    }
}
