use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::geo::tiles::cover_disk;
use crate::index::{GeoIndex, LocationUpdate, NearbyDriver};
use crate::models::driver::{DriverLocation, DriverStatus};
use crate::observability::metrics::Metrics;

/// Events delivered on a passenger's subscription channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PassengerEvent {
    DriverLocationUpdated {
        driver_id: Uuid,
        position: GeoPoint,
        status: DriverStatus,
    },
    DriverStatusChanged {
        driver_id: Uuid,
        status: DriverStatus,
    },
}

/// One passenger's area of interest: the tile set covering the disk
/// around their center point, plus the delivery channel. Replaced as a
/// whole on re-subscribe.
pub struct Subscription {
    pub passenger_id: Uuid,
    pub center: GeoPoint,
    pub radius_m: f64,
    pub tiles: HashSet<String>,
    pub created_at: DateTime<Utc>,
    sender: mpsc::Sender<PassengerEvent>,
    // Receiver parked here until the passenger's stream connects.
    pending_rx: Mutex<Option<mpsc::Receiver<PassengerEvent>>>,
}

/// Tile-partitioned fan-out of driver location/status changes. Delivery
/// is best-effort, at-most-once: each subscriber gets an independent
/// bounded channel and a full or closed channel drops the event for
/// that subscriber only.
pub struct BroadcastRouter {
    subscriptions: DashMap<Uuid, Subscription>,
    last_broadcast: DashMap<Uuid, DateTime<Utc>>,
    index: Arc<GeoIndex>,
    metrics: Metrics,
    interval: Duration,
    precision: usize,
    buffer: usize,
}

impl BroadcastRouter {
    pub fn new(index: Arc<GeoIndex>, metrics: Metrics, config: &Config) -> Self {
        Self {
            subscriptions: DashMap::new(),
            last_broadcast: DashMap::new(),
            index,
            metrics,
            interval: Duration::milliseconds(config.broadcast_interval_ms as i64),
            precision: config.geohash_precision,
            buffer: config.subscription_buffer_size,
        }
    }

    /// Replaces any prior subscription for the passenger and returns the
    /// immediate snapshot of available drivers inside the disk. The
    /// delivery channel is parked until `claim_stream` picks it up.
    pub fn subscribe(
        &self,
        passenger_id: Uuid,
        center: GeoPoint,
        radius_m: f64,
    ) -> Result<Vec<NearbyDriver>, AppError> {
        center.validate()?;
        if !radius_m.is_finite() || radius_m <= 0.0 {
            return Err(AppError::BadRequest(format!(
                "radius_m must be a positive number, got {radius_m}"
            )));
        }

        let tiles = cover_disk(&center, radius_m, self.precision)?;
        let (sender, receiver) = mpsc::channel(self.buffer);

        debug!(%passenger_id, tiles = tiles.len(), "passenger subscribed");
        self.subscriptions.insert(
            passenger_id,
            Subscription {
                passenger_id,
                center,
                radius_m,
                tiles,
                created_at: Utc::now(),
                sender,
                pending_rx: Mutex::new(Some(receiver)),
            },
        );
        self.metrics
            .subscriptions_active
            .set(self.subscriptions.len() as i64);

        Ok(self.index.query_nearby(&center, radius_m))
    }

    /// Hands out the subscription's receiver, once. A second claim for
    /// the same subscription is a conflict.
    pub fn claim_stream(
        &self,
        passenger_id: &Uuid,
    ) -> Result<mpsc::Receiver<PassengerEvent>, AppError> {
        let subscription = self.subscriptions.get(passenger_id).ok_or_else(|| {
            AppError::NotFound(format!("no subscription for passenger {passenger_id}"))
        })?;

        let mut parked = subscription
            .pending_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        parked.take().ok_or_else(|| {
            AppError::Conflict(format!(
                "stream for passenger {passenger_id} already claimed"
            ))
        })
    }

    pub fn unsubscribe(&self, passenger_id: &Uuid) -> bool {
        let removed = self.subscriptions.remove(passenger_id).is_some();
        self.metrics
            .subscriptions_active
            .set(self.subscriptions.len() as i64);
        removed
    }

    /// Fan-out for a location ping. Suppressed when the tile is
    /// unchanged, movement stayed below the index minimum and the last
    /// broadcast for this driver is more recent than the rate-limit
    /// interval.
    pub fn on_location_update(&self, update: &LocationUpdate) {
        let driver_id = update.entry.driver_id;

        if !update.tile_changed && !update.moved_significantly {
            let recently_sent = self
                .last_broadcast
                .get(&driver_id)
                .is_some_and(|sent_at| Utc::now().signed_duration_since(*sent_at) < self.interval);
            if recently_sent {
                self.metrics
                    .broadcasts_total
                    .with_label_values(&["suppressed"])
                    .inc();
                return;
            }
        }

        self.last_broadcast.insert(driver_id, Utc::now());
        self.fan_out(
            &update.entry.tile,
            PassengerEvent::DriverLocationUpdated {
                driver_id,
                position: update.entry.position,
                status: update.entry.status,
            },
        );
    }

    /// Status flips are never rate limited.
    pub fn on_status_change(&self, entry: &DriverLocation) {
        self.fan_out(
            &entry.tile,
            PassengerEvent::DriverStatusChanged {
                driver_id: entry.driver_id,
                status: entry.status,
            },
        );
    }

    /// Drops the per-driver rate-limit mark when a driver leaves.
    pub fn forget_driver(&self, driver_id: &Uuid) {
        self.last_broadcast.remove(driver_id);
    }

    fn fan_out(&self, tile: &str, event: PassengerEvent) {
        for subscription in self.subscriptions.iter() {
            if !subscription.tiles.contains(tile) {
                continue;
            }

            match subscription.sender.try_send(event.clone()) {
                Ok(()) => {
                    self.metrics
                        .broadcasts_total
                        .with_label_values(&["delivered"])
                        .inc();
                }
                Err(TrySendError::Full(_)) => {
                    debug!(
                        passenger_id = %subscription.passenger_id,
                        "subscriber channel full, event dropped"
                    );
                    self.metrics
                        .broadcasts_total
                        .with_label_values(&["dropped"])
                        .inc();
                }
                Err(TrySendError::Closed(_)) => {
                    self.metrics
                        .broadcasts_total
                        .with_label_values(&["dropped"])
                        .inc();
                }
            }
        }
    }
}
