use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Offered,
    Accepted,
    Completed,
    CancelledUser,
    CancelledDriver,
    NoDrivers,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Pending => "pending",
            RideStatus::Offered => "offered",
            RideStatus::Accepted => "accepted",
            RideStatus::Completed => "completed",
            RideStatus::CancelledUser => "cancelled_user",
            RideStatus::CancelledDriver => "cancelled_driver",
            RideStatus::NoDrivers => "no_drivers",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RideStatus::Completed
                | RideStatus::CancelledUser
                | RideStatus::CancelledDriver
                | RideStatus::NoDrivers
        )
    }
}

/// Party requesting a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelParty {
    Passenger,
    Driver,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: Uuid,
    pub passenger_id: Uuid,
    pub pickup: GeoPoint,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub passenger_count: u8,
    pub status: RideStatus,
    /// Set once a driver accepts; None before that.
    pub driver_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
