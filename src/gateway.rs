use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::ride::CancelParty;

/// Events handed to the external push-notification gateway. Delivery
/// mechanics past this bus are out of scope; consumers subscribe and
/// forward over their own transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    RideOffer {
        ride_id: Uuid,
        driver_id: Uuid,
        pickup: GeoPoint,
        pickup_address: String,
        dropoff_address: String,
        expires_at: DateTime<Utc>,
    },
    RideAccepted {
        ride_id: Uuid,
        passenger_id: Uuid,
        driver_id: Uuid,
    },
    RideCancelled {
        ride_id: Uuid,
        passenger_id: Uuid,
        driver_id: Option<Uuid>,
        by: CancelParty,
    },
    RideCompleted {
        ride_id: Uuid,
        passenger_id: Uuid,
        driver_id: Uuid,
    },
    RideExpired {
        ride_id: Uuid,
        driver_id: Uuid,
    },
    NoDriversAvailable {
        ride_id: Uuid,
        passenger_id: Uuid,
    },
    /// Periodic position of the assigned driver during an accepted ride.
    TrackingUpdate {
        ride_id: Uuid,
        driver_id: Uuid,
        position: GeoPoint,
    },
}

/// Fan-out bus for gateway events. Best-effort: publishing with no
/// subscribers is fine, lagging subscribers lose old events.
#[derive(Clone)]
pub struct Gateway {
    tx: broadcast::Sender<NotifyEvent>,
}

impl Gateway {
    pub fn new(buffer: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(buffer);
        Self { tx }
    }

    pub fn publish(&self, event: NotifyEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotifyEvent> {
        self.tx.subscribe()
    }
}
