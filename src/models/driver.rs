use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Available,
    Busy,
    Offline,
}

/// Live index entry for one driver. Refreshed on every location ping;
/// considered expired once `updated_at` falls behind the index TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverLocation {
    pub driver_id: Uuid,
    pub position: GeoPoint,
    pub tile: String,
    pub status: DriverStatus,
    pub updated_at: DateTime<Utc>,
}
