use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{lifecycle, queue};
use crate::error::AppError;
use crate::gateway::{Gateway, NotifyEvent};
use crate::geo::GeoPoint;
use crate::index::GeoIndex;
use crate::models::driver::DriverStatus;
use crate::models::offer::{Offer, OfferQueue, OfferState};
use crate::models::ride::{CancelParty, RideRequest, RideStatus};
use crate::observability::metrics::Metrics;

pub struct NewRide {
    pub passenger_id: Uuid,
    pub pickup: GeoPoint,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub passenger_count: u8,
}

/// Snapshot of a ride plus its most recent offer, for API reads.
#[derive(Debug, Clone, Serialize)]
pub struct RideView {
    pub ride: RideRequest,
    pub offer: Option<Offer>,
}

/// Per-ride dispatch state. Guarded by one mutex per ride; every
/// transition re-checks its precondition under that lock, so a losing
/// accept/reject/timeout observes a failed precondition and becomes a
/// no-op instead of a double resolution.
struct RideRecord {
    ride: RideRequest,
    queue: OfferQueue,
    offer: Option<Offer>,
    next_sequence: u32,
}

impl RideRecord {
    fn transition(&mut self, to: RideStatus) -> Result<(), AppError> {
        if !lifecycle::can_transition(self.ride.status, to) {
            return Err(AppError::Conflict(format!(
                "ride {} cannot move from {} to {}",
                self.ride.id,
                self.ride.status.as_str(),
                to.as_str()
            )));
        }
        self.ride.status = to;
        Ok(())
    }

    fn has_pending_offer_for(&self, driver_id: Uuid) -> bool {
        self.ride.status == RideStatus::Offered
            && self
                .offer
                .as_ref()
                .is_some_and(|offer| {
                    offer.state == OfferState::Pending && offer.driver_id == driver_id
                })
    }
}

/// The daisy-chain dispatcher: one offer at a time per ride, advancing
/// through a queue snapshot taken at ride creation until a driver
/// accepts or the queue runs out.
pub struct DispatchCoordinator {
    // Handle to ourselves for the expiry timer tasks.
    self_ref: Weak<DispatchCoordinator>,
    rides: DashMap<Uuid, Arc<Mutex<RideRecord>>>,
    /// driver -> ride currently holding that driver's pending offer.
    offered_drivers: DashMap<Uuid, Uuid>,
    /// driver -> ride the driver has accepted and not yet completed.
    active_rides: DashMap<Uuid, Uuid>,
    index: Arc<GeoIndex>,
    gateway: Gateway,
    metrics: Metrics,
    offer_timeout: StdDuration,
    offer_ttl: Duration,
    max_queue_len: usize,
    default_radius_m: f64,
}

impl DispatchCoordinator {
    pub fn new(
        index: Arc<GeoIndex>,
        gateway: Gateway,
        metrics: Metrics,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            rides: DashMap::new(),
            offered_drivers: DashMap::new(),
            active_rides: DashMap::new(),
            index,
            gateway,
            metrics,
            offer_timeout: config.offer_timeout(),
            offer_ttl: Duration::seconds(config.offer_timeout_secs as i64),
            max_queue_len: config.max_queue_len,
            default_radius_m: config.default_search_radius_m,
        })
    }

    /// Creates the ride, builds the candidate queue once, and opens the
    /// first offer. An empty queue resolves to `no_drivers` immediately.
    pub fn create_ride(&self, new: NewRide) -> Result<RideRequest, AppError> {
        new.pickup.validate()?;
        if new.passenger_count == 0 {
            return Err(AppError::BadRequest(
                "passenger_count must be at least 1".to_string(),
            ));
        }
        if new.pickup_address.trim().is_empty() || new.dropoff_address.trim().is_empty() {
            return Err(AppError::BadRequest(
                "pickup and dropoff addresses cannot be empty".to_string(),
            ));
        }

        let candidates = queue::build(
            &self.index,
            &new.pickup,
            self.default_radius_m,
            self.max_queue_len,
            |driver_id| self.offered_drivers.contains_key(driver_id),
        );

        let ride = RideRequest {
            id: Uuid::new_v4(),
            passenger_id: new.passenger_id,
            pickup: new.pickup,
            pickup_address: new.pickup_address,
            dropoff_address: new.dropoff_address,
            passenger_count: new.passenger_count,
            status: RideStatus::Pending,
            driver_id: None,
            created_at: Utc::now(),
        };

        info!(ride_id = %ride.id, candidates = candidates.len(), "ride created");

        let mut record = RideRecord {
            ride,
            queue: OfferQueue::new(candidates),
            offer: None,
            next_sequence: 0,
        };

        let mut events = Vec::new();
        let opened = self.open_next_offer(&mut record, &mut events)?;
        let snapshot = record.ride.clone();

        self.rides
            .insert(snapshot.id, Arc::new(Mutex::new(record)));
        if let Some((_, sequence)) = opened {
            self.spawn_offer_timer(snapshot.id, sequence);
        }
        self.publish_all(events);

        Ok(snapshot)
    }

    /// Driver accepts the pending offer. Exactly-once: a replay or a
    /// race lost against reject/timeout returns a conflict and leaves
    /// state and emitted events untouched.
    pub fn accept(&self, ride_id: Uuid, driver_id: Uuid) -> Result<RideRequest, AppError> {
        let record = self.record(&ride_id)?;
        let (snapshot, events) = {
            let mut rec = lock(&record);
            if !rec.has_pending_offer_for(driver_id) {
                return Err(offer_conflict(&rec, driver_id));
            }

            rec.transition(RideStatus::Accepted)?;
            rec.ride.driver_id = Some(driver_id);
            if let Some(offer) = rec.offer.as_mut() {
                offer.state = OfferState::Accepted;
                self.observe_offer(offer, "accepted");
            }
            self.metrics
                .rides_total
                .with_label_values(&["accepted"])
                .inc();

            let events = vec![NotifyEvent::RideAccepted {
                ride_id,
                passenger_id: rec.ride.passenger_id,
                driver_id,
            }];
            (rec.ride.clone(), events)
        };

        self.release_claim(driver_id, ride_id);
        self.active_rides.insert(driver_id, ride_id);
        if let Err(err) = self.index.set_status(driver_id, DriverStatus::Busy) {
            warn!(%driver_id, error = %err, "accepting driver missing from geo index");
        }

        info!(%ride_id, %driver_id, "ride accepted");
        self.publish_all(events);
        Ok(snapshot)
    }

    /// Driver declines the pending offer; the chain advances.
    pub fn reject(&self, ride_id: Uuid, driver_id: Uuid) -> Result<RideRequest, AppError> {
        let record = self.record(&ride_id)?;
        let (snapshot, events, opened) = {
            let mut rec = lock(&record);
            if !rec.has_pending_offer_for(driver_id) {
                return Err(offer_conflict(&rec, driver_id));
            }

            if let Some(offer) = rec.offer.as_mut() {
                offer.state = OfferState::Rejected;
                self.observe_offer(offer, "rejected");
            }
            self.release_claim(driver_id, ride_id);

            let mut events = Vec::new();
            let opened = self.open_next_offer(&mut rec, &mut events)?;
            (rec.ride.clone(), events, opened)
        };

        info!(%ride_id, %driver_id, "offer rejected");
        if let Some((_, sequence)) = opened {
            self.spawn_offer_timer(ride_id, sequence);
        }
        self.publish_all(events);
        Ok(snapshot)
    }

    /// Expiry path for offer `sequence` of `ride_id`. Safe to call any
    /// number of times and from stale timers: if the offer already
    /// resolved, this is a no-op. Returns whether it expired the offer.
    pub fn handle_offer_timeout(&self, ride_id: Uuid, sequence: u32) -> bool {
        let Some(record) = self.rides.get(&ride_id).map(|entry| entry.value().clone()) else {
            return false;
        };

        let resolved = {
            let mut rec = lock(&record);
            let matches = rec.ride.status == RideStatus::Offered
                && rec.offer.as_ref().is_some_and(|offer| {
                    offer.state == OfferState::Pending && offer.sequence == sequence
                });
            if !matches {
                debug!(%ride_id, sequence, "offer timer misfire ignored");
                return false;
            }

            let mut events = Vec::new();
            let mut expired_driver = None;
            if let Some(offer) = rec.offer.as_mut() {
                offer.state = OfferState::Expired;
                expired_driver = Some(offer.driver_id);
                events.push(NotifyEvent::RideExpired {
                    ride_id,
                    driver_id: offer.driver_id,
                });
            }
            if let Some(driver_id) = expired_driver {
                if let Some(offer) = rec.offer.as_ref() {
                    self.observe_offer(offer, "expired");
                }
                self.release_claim(driver_id, ride_id);
            }

            match self.open_next_offer(&mut rec, &mut events) {
                Ok(opened) => Some((events, opened)),
                Err(err) => {
                    warn!(%ride_id, error = %err, "failed to advance after offer expiry");
                    None
                }
            }
        };

        if let Some((events, opened)) = resolved {
            info!(%ride_id, sequence, "offer expired");
            if let Some((_, next_sequence)) = opened {
                self.spawn_offer_timer(ride_id, next_sequence);
            }
            self.publish_all(events);
        }
        true
    }

    /// Terminal cancellation by either party. Voids any pending offer;
    /// a driver may only cancel a ride they have accepted. No automatic
    /// re-dispatch happens after a driver cancellation: the passenger is
    /// notified and submits a fresh request.
    pub fn cancel(
        &self,
        ride_id: Uuid,
        party: CancelParty,
        party_id: Uuid,
    ) -> Result<RideRequest, AppError> {
        let record = self.record(&ride_id)?;
        let (snapshot, events, released_driver) = {
            let mut rec = lock(&record);

            match party {
                CancelParty::Passenger if rec.ride.passenger_id != party_id => {
                    return Err(AppError::Conflict(format!(
                        "passenger {} does not own ride {}",
                        party_id, ride_id
                    )));
                }
                CancelParty::Driver if rec.ride.driver_id != Some(party_id) => {
                    return Err(AppError::Conflict(format!(
                        "driver {} is not assigned to ride {}",
                        party_id, ride_id
                    )));
                }
                _ => {}
            }

            let to = match party {
                CancelParty::Passenger => RideStatus::CancelledUser,
                CancelParty::Driver => RideStatus::CancelledDriver,
            };
            rec.transition(to)?;

            // Void the in-flight offer so its timer misfires harmlessly.
            if let Some(offer) = rec.offer.as_mut() {
                if offer.state == OfferState::Pending {
                    offer.state = OfferState::Expired;
                    self.release_claim(offer.driver_id, ride_id);
                }
            }

            self.metrics.rides_total.with_label_values(&[to.as_str()]).inc();
            let events = vec![NotifyEvent::RideCancelled {
                ride_id,
                passenger_id: rec.ride.passenger_id,
                driver_id: rec.ride.driver_id,
                by: party,
            }];
            (rec.ride.clone(), events, rec.ride.driver_id)
        };

        if let Some(driver_id) = released_driver {
            self.active_rides.remove(&driver_id);
            if let Err(err) = self.index.set_status(driver_id, DriverStatus::Available) {
                debug!(%driver_id, error = %err, "cancelled driver missing from geo index");
            }
        }

        info!(%ride_id, ?party, "ride cancelled");
        self.publish_all(events);
        Ok(snapshot)
    }

    /// Assigned driver marks the ride complete.
    pub fn complete(&self, ride_id: Uuid, driver_id: Uuid) -> Result<RideRequest, AppError> {
        let record = self.record(&ride_id)?;
        let (snapshot, events) = {
            let mut rec = lock(&record);
            if rec.ride.status != RideStatus::Accepted || rec.ride.driver_id != Some(driver_id) {
                return Err(AppError::Conflict(format!(
                    "ride {} is not an active ride of driver {}",
                    ride_id, driver_id
                )));
            }

            rec.transition(RideStatus::Completed)?;
            self.metrics
                .rides_total
                .with_label_values(&["completed"])
                .inc();

            let events = vec![NotifyEvent::RideCompleted {
                ride_id,
                passenger_id: rec.ride.passenger_id,
                driver_id,
            }];
            (rec.ride.clone(), events)
        };

        self.active_rides.remove(&driver_id);
        if let Err(err) = self.index.set_status(driver_id, DriverStatus::Available) {
            debug!(%driver_id, error = %err, "completing driver missing from geo index");
        }

        info!(%ride_id, %driver_id, "ride completed");
        self.publish_all(events);
        Ok(snapshot)
    }

    pub fn ride_view(&self, ride_id: Uuid) -> Result<RideView, AppError> {
        let record = self.record(&ride_id)?;
        let rec = lock(&record);
        Ok(RideView {
            ride: rec.ride.clone(),
            offer: rec.offer.clone(),
        })
    }

    /// Ride the driver is currently serving, if any. Feeds tracking
    /// updates on location pings.
    pub fn active_ride_for(&self, driver_id: &Uuid) -> Option<Uuid> {
        self.active_rides.get(driver_id).map(|entry| *entry.value())
    }

    pub fn ride_count(&self) -> usize {
        self.rides.len()
    }

    /// Recovery sweep: resolves any offered ride whose `expires_at` has
    /// passed, independent of timer continuity. Returns how many offers
    /// it expired.
    pub fn sweep_expired_offers(&self) -> usize {
        let now = Utc::now();
        let records: Vec<(Uuid, Arc<Mutex<RideRecord>>)> = self
            .rides
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut expired = 0;
        for (ride_id, record) in records {
            let overdue = {
                let rec = lock(&record);
                match (&rec.ride.status, &rec.offer) {
                    (RideStatus::Offered, Some(offer))
                        if offer.state == OfferState::Pending && offer.expires_at <= now =>
                    {
                        Some(offer.sequence)
                    }
                    _ => None,
                }
            };
            // The re-check under the ride lock may lose to a concurrent
            // accept/reject; only count offers actually expired.
            if let Some(sequence) = overdue {
                if self.handle_offer_timeout(ride_id, sequence) {
                    expired += 1;
                }
            }
        }
        expired
    }

    /// Advances the cursor to the next eligible candidate and opens an
    /// offer to them, or resolves the ride to `no_drivers`. Candidates
    /// who went busy/offline or took another pending offer since the
    /// queue snapshot are skipped, never revisited.
    fn open_next_offer(
        &self,
        rec: &mut RideRecord,
        events: &mut Vec<NotifyEvent>,
    ) -> Result<Option<(Uuid, u32)>, AppError> {
        while let Some(driver_id) = rec.queue.advance() {
            if !self.try_claim_driver(driver_id, rec.ride.id) {
                debug!(ride_id = %rec.ride.id, %driver_id, "skipping ineligible candidate");
                continue;
            }

            if let Err(err) = rec.transition(RideStatus::Offered) {
                self.release_claim(driver_id, rec.ride.id);
                return Err(err);
            }

            let sequence = rec.next_sequence;
            rec.next_sequence += 1;
            let now = Utc::now();
            let offer = Offer {
                ride_id: rec.ride.id,
                driver_id,
                sequence,
                state: OfferState::Pending,
                created_at: now,
                expires_at: now + self.offer_ttl,
            };

            events.push(NotifyEvent::RideOffer {
                ride_id: rec.ride.id,
                driver_id,
                pickup: rec.ride.pickup,
                pickup_address: rec.ride.pickup_address.clone(),
                dropoff_address: rec.ride.dropoff_address.clone(),
                expires_at: offer.expires_at,
            });
            rec.offer = Some(offer);

            return Ok(Some((driver_id, sequence)));
        }

        rec.transition(RideStatus::NoDrivers)?;
        self.metrics
            .rides_total
            .with_label_values(&["no_drivers"])
            .inc();
        events.push(NotifyEvent::NoDriversAvailable {
            ride_id: rec.ride.id,
            passenger_id: rec.ride.passenger_id,
        });
        Ok(None)
    }

    /// Claims the driver for this ride's pending offer. The entry API
    /// makes check-and-insert one atomic step, so two rides dispatching
    /// concurrently can never both claim the same driver.
    fn try_claim_driver(&self, driver_id: Uuid, ride_id: Uuid) -> bool {
        let available = self
            .index
            .get(&driver_id)
            .is_some_and(|entry| entry.status == DriverStatus::Available);
        if !available {
            return false;
        }

        match self.offered_drivers.entry(driver_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(ride_id);
                true
            }
        }
    }

    /// Releases the driver's claim, but only if this ride still owns it.
    /// A claim already resolved and re-taken by another ride stays put.
    fn release_claim(&self, driver_id: Uuid, ride_id: Uuid) {
        self.offered_drivers
            .remove_if(&driver_id, |_, owner| *owner == ride_id);
    }

    fn spawn_offer_timer(&self, ride_id: Uuid, sequence: u32) {
        let Some(coordinator) = self.self_ref.upgrade() else {
            return;
        };
        let timeout = self.offer_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            coordinator.handle_offer_timeout(ride_id, sequence);
        });
    }

    fn observe_offer(&self, offer: &Offer, outcome: &str) {
        self.metrics.offers_total.with_label_values(&[outcome]).inc();
        let elapsed = Utc::now()
            .signed_duration_since(offer.created_at)
            .num_milliseconds()
            .max(0) as f64
            / 1_000.0;
        self.metrics
            .offer_resolution_seconds
            .with_label_values(&[outcome])
            .observe(elapsed);
    }

    fn publish_all(&self, events: Vec<NotifyEvent>) {
        for event in events {
            self.gateway.publish(event);
        }
    }

    fn record(&self, ride_id: &Uuid) -> Result<Arc<Mutex<RideRecord>>, AppError> {
        self.rides
            .get(ride_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("ride {} not found", ride_id)))
    }
}

fn lock(record: &Arc<Mutex<RideRecord>>) -> MutexGuard<'_, RideRecord> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn offer_conflict(rec: &RideRecord, driver_id: Uuid) -> AppError {
    if rec.ride.status.is_terminal() || rec.ride.status == RideStatus::Accepted {
        AppError::Conflict(format!(
            "ride {} already resolved to {}",
            rec.ride.id,
            rec.ride.status.as_str()
        ))
    } else {
        AppError::Conflict(format!(
            "ride {} has no pending offer for driver {}",
            rec.ride.id, driver_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use uuid::Uuid;

    use super::{DispatchCoordinator, NewRide};
    use crate::config::Config;
    use crate::gateway::Gateway;
    use crate::geo::GeoPoint;
    use crate::index::GeoIndex;
    use crate::models::offer::OfferState;
    use crate::models::ride::{CancelParty, RideStatus};
    use crate::observability::metrics::Metrics;

    fn config() -> Config {
        Config {
            http_port: 0,
            log_level: "info".to_string(),
            offer_timeout_secs: 20,
            location_ttl_secs: 60,
            geohash_precision: 6,
            min_broadcast_distance_m: 25.0,
            broadcast_interval_ms: 1000,
            max_queue_len: 10,
            default_search_radius_m: 10_000.0,
            sweep_interval_secs: 5,
            event_buffer_size: 64,
            subscription_buffer_size: 16,
        }
    }

    fn setup() -> (Arc<DispatchCoordinator>, Arc<GeoIndex>, Gateway) {
        let index = Arc::new(GeoIndex::new(Duration::seconds(60), 6, 25.0));
        let gateway = Gateway::new(64);
        let coordinator = DispatchCoordinator::new(
            index.clone(),
            gateway.clone(),
            Metrics::new(),
            &config(),
        );
        (coordinator, index, gateway)
    }

    fn seed_three_drivers(index: &GeoIndex) -> (Uuid, Uuid, Uuid) {
        let d1 = Uuid::from_u128(1);
        let d2 = Uuid::from_u128(2);
        let d3 = Uuid::from_u128(3);
        index
            .update_location(d1, GeoPoint { lat: 0.0, lng: 0.0 }, None)
            .unwrap();
        index
            .update_location(d2, GeoPoint { lat: 0.0, lng: 0.01 }, None)
            .unwrap();
        index
            .update_location(d3, GeoPoint { lat: 0.0, lng: 0.05 }, None)
            .unwrap();
        (d1, d2, d3)
    }

    fn new_ride() -> NewRide {
        NewRide {
            passenger_id: Uuid::from_u128(99),
            pickup: GeoPoint { lat: 0.0, lng: 0.0 },
            pickup_address: "Main St 1".to_string(),
            dropoff_address: "Harbor Rd 2".to_string(),
            passenger_count: 1,
        }
    }

    #[tokio::test]
    async fn empty_queue_resolves_to_no_drivers_immediately() {
        let (coordinator, _index, gateway) = setup();
        let mut rx = gateway.subscribe();

        let ride = coordinator.create_ride(new_ride()).unwrap();
        assert_eq!(ride.status, RideStatus::NoDrivers);

        let event = rx.try_recv().unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "no_drivers_available");
    }

    #[tokio::test]
    async fn first_offer_goes_to_the_nearest_driver() {
        let (coordinator, index, _gateway) = setup();
        let (d1, _, _) = seed_three_drivers(&index);

        let ride = coordinator.create_ride(new_ride()).unwrap();
        assert_eq!(ride.status, RideStatus::Offered);

        let view = coordinator.ride_view(ride.id).unwrap();
        let offer = view.offer.unwrap();
        assert_eq!(offer.driver_id, d1);
        assert_eq!(offer.sequence, 0);
        assert_eq!(offer.state, OfferState::Pending);
    }

    #[tokio::test]
    async fn accept_is_idempotent_conflict_on_replay() {
        let (coordinator, index, gateway) = setup();
        let (d1, _, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        let mut rx = gateway.subscribe();
        let accepted = coordinator.accept(ride.id, d1).unwrap();
        assert_eq!(accepted.status, RideStatus::Accepted);
        assert_eq!(accepted.driver_id, Some(d1));
        assert!(rx.try_recv().is_ok());

        // Replay: conflict, no state change, no new event.
        let replay = coordinator.accept(ride.id, d1);
        assert!(replay.is_err());
        assert_eq!(
            coordinator.ride_view(ride.id).unwrap().ride.status,
            RideStatus::Accepted
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn accept_by_the_wrong_driver_is_a_conflict() {
        let (coordinator, index, _gateway) = setup();
        let (_, d2, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        assert!(coordinator.accept(ride.id, d2).is_err());
        assert_eq!(
            coordinator.ride_view(ride.id).unwrap().ride.status,
            RideStatus::Offered
        );
    }

    #[tokio::test]
    async fn rejections_walk_the_queue_to_exhaustion_exactly_once() {
        let (coordinator, index, _gateway) = setup();
        let (d1, d2, d3) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        coordinator.reject(ride.id, d1).unwrap();
        let view = coordinator.ride_view(ride.id).unwrap();
        assert_eq!(view.offer.as_ref().unwrap().driver_id, d2);

        coordinator.reject(ride.id, d2).unwrap();
        let view = coordinator.ride_view(ride.id).unwrap();
        assert_eq!(view.offer.as_ref().unwrap().driver_id, d3);

        let exhausted = coordinator.reject(ride.id, d3).unwrap();
        assert_eq!(exhausted.status, RideStatus::NoDrivers);

        // Nothing left to reject; the ride resolved exactly once.
        assert!(coordinator.reject(ride.id, d1).is_err());
        assert!(coordinator.reject(ride.id, d3).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn offer_expiry_advances_the_chain() {
        let (coordinator, index, _gateway) = setup();
        let (d1, d2, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        // Let the 20s offer timer fire.
        tokio::time::sleep(std::time::Duration::from_secs(21)).await;

        let view = coordinator.ride_view(ride.id).unwrap();
        assert_eq!(view.ride.status, RideStatus::Offered);
        assert_eq!(view.offer.as_ref().unwrap().driver_id, d2);
        assert_eq!(view.offer.as_ref().unwrap().sequence, 1);

        // The expired driver can no longer accept.
        assert!(coordinator.accept(ride.id, d1).is_err());
    }

    #[tokio::test]
    async fn stale_timeout_after_accept_is_a_no_op() {
        let (coordinator, index, _gateway) = setup();
        let (d1, _, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        coordinator.accept(ride.id, d1).unwrap();
        coordinator.handle_offer_timeout(ride.id, 0);

        let view = coordinator.ride_view(ride.id).unwrap();
        assert_eq!(view.ride.status, RideStatus::Accepted);
        assert_eq!(view.offer.unwrap().state, OfferState::Accepted);
    }

    #[tokio::test]
    async fn accept_after_timeout_loses_the_race() {
        let (coordinator, index, _gateway) = setup();
        let (d1, d2, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        coordinator.handle_offer_timeout(ride.id, 0);
        assert!(coordinator.accept(ride.id, d1).is_err());

        let view = coordinator.ride_view(ride.id).unwrap();
        assert_eq!(view.offer.unwrap().driver_id, d2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_accept_and_timeout_resolve_exactly_once() {
        let (coordinator, index, _gateway) = setup();
        let (d1, d2, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        let c1 = coordinator.clone();
        let c2 = coordinator.clone();
        let accept = tokio::spawn(async move { c1.accept(ride.id, d1) });
        let timeout = tokio::spawn(async move { c2.handle_offer_timeout(ride.id, 0) });
        let (accept_result, _) = tokio::join!(accept, timeout);

        let view = coordinator.ride_view(ride.id).unwrap();
        match accept_result.unwrap() {
            Ok(_) => assert_eq!(view.ride.status, RideStatus::Accepted),
            Err(_) => {
                // Timeout won: the chain advanced to the next driver.
                assert_eq!(view.ride.status, RideStatus::Offered);
                assert_eq!(view.offer.unwrap().driver_id, d2);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_rides_never_share_a_drivers_pending_offer() {
        let (coordinator, index, _gateway) = setup();
        let driver = Uuid::from_u128(1);
        index
            .update_location(driver, GeoPoint { lat: 0.0, lng: 0.0 }, None)
            .unwrap();

        for _ in 0..200 {
            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let first = {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    coordinator.create_ride(new_ride())
                })
            };
            let second = {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    coordinator.create_ride(new_ride())
                })
            };
            let (first, second) = tokio::join!(first, second);
            let first = first.unwrap().unwrap();
            let second = second.unwrap().unwrap();

            // Exactly one ride claims the driver; the loser sees an
            // empty queue and resolves immediately.
            let (winner, loser) = if first.status == RideStatus::Offered {
                (first, second)
            } else {
                (second, first)
            };
            assert_eq!(winner.status, RideStatus::Offered);
            assert_eq!(loser.status, RideStatus::NoDrivers);
            assert_eq!(
                coordinator
                    .ride_view(winner.id)
                    .unwrap()
                    .offer
                    .unwrap()
                    .driver_id,
                driver
            );

            // Release the claim so the next round starts clean.
            coordinator.reject(winner.id, driver).unwrap();
        }
    }

    #[tokio::test]
    async fn passenger_cancel_voids_the_pending_offer() {
        let (coordinator, index, _gateway) = setup();
        let (d1, _, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        let cancelled = coordinator
            .cancel(ride.id, CancelParty::Passenger, ride.passenger_id)
            .unwrap();
        assert_eq!(cancelled.status, RideStatus::CancelledUser);

        assert!(coordinator.accept(ride.id, d1).is_err());
        // Stale timer against the voided offer is harmless.
        coordinator.handle_offer_timeout(ride.id, 0);
        assert_eq!(
            coordinator.ride_view(ride.id).unwrap().ride.status,
            RideStatus::CancelledUser
        );
    }

    #[tokio::test]
    async fn driver_cancel_requires_the_assigned_driver() {
        let (coordinator, index, _gateway) = setup();
        let (d1, d2, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        // Not assigned yet: an offered driver declines via reject.
        assert!(coordinator.cancel(ride.id, CancelParty::Driver, d1).is_err());

        coordinator.accept(ride.id, d1).unwrap();
        assert!(coordinator.cancel(ride.id, CancelParty::Driver, d2).is_err());

        let cancelled = coordinator
            .cancel(ride.id, CancelParty::Driver, d1)
            .unwrap();
        assert_eq!(cancelled.status, RideStatus::CancelledDriver);
        assert!(coordinator.active_ride_for(&d1).is_none());
    }

    #[tokio::test]
    async fn complete_requires_an_accepted_ride() {
        let (coordinator, index, _gateway) = setup();
        let (d1, _, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();

        assert!(coordinator.complete(ride.id, d1).is_err());

        coordinator.accept(ride.id, d1).unwrap();
        assert_eq!(coordinator.active_ride_for(&d1), Some(ride.id));

        let completed = coordinator.complete(ride.id, d1).unwrap();
        assert_eq!(completed.status, RideStatus::Completed);
        assert!(coordinator.active_ride_for(&d1).is_none());
        assert!(coordinator.complete(ride.id, d1).is_err());
    }

    #[tokio::test]
    async fn recovery_sweep_expires_overdue_offers() {
        let (_coordinator, index, _gateway) = setup();
        let (_, d2, _) = seed_three_drivers(&index);

        // Zero-length offers: expires_at is already in the past.
        let mut cfg = config();
        cfg.offer_timeout_secs = 0;
        let short = DispatchCoordinator::new(
            index.clone(),
            Gateway::new(64),
            Metrics::new(),
            &cfg,
        );

        let ride = short.create_ride(new_ride()).unwrap();
        assert_eq!(ride.status, RideStatus::Offered);

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(short.sweep_expired_offers() >= 1);

        let view = short.ride_view(ride.id).unwrap();
        assert_eq!(view.offer.as_ref().unwrap().driver_id, d2);
    }

    #[tokio::test]
    async fn resolved_offers_do_not_count_as_expired() {
        let (coordinator, index, _gateway) = setup();
        let (d1, _, _) = seed_three_drivers(&index);
        let ride = coordinator.create_ride(new_ride()).unwrap();
        coordinator.accept(ride.id, d1).unwrap();

        assert!(!coordinator.handle_offer_timeout(ride.id, 0));
        assert!(!coordinator.handle_offer_timeout(Uuid::from_u128(77), 0));
        assert_eq!(coordinator.sweep_expired_offers(), 0);
    }

    #[tokio::test]
    async fn validation_rejects_malformed_requests() {
        let (coordinator, _index, _gateway) = setup();

        let mut bad_coords = new_ride();
        bad_coords.pickup = GeoPoint {
            lat: 95.0,
            lng: 0.0,
        };
        assert!(coordinator.create_ride(bad_coords).is_err());

        let mut no_passengers = new_ride();
        no_passengers.passenger_count = 0;
        assert!(coordinator.create_ride(no_passengers).is_err());

        let mut blank_address = new_ride();
        blank_address.pickup_address = "  ".to_string();
        assert!(coordinator.create_ride(blank_address).is_err());
    }
}
