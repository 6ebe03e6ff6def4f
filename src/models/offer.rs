use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

/// A time-boxed proposal of one ride to one driver. At most one offer
/// per ride is `Pending` at any instant; `Pending` resolves exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    /// 0-based position in the ride's offer queue.
    pub sequence: u32,
    pub state: OfferState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Ordered candidate list for a ride plus a cursor. Built once at ride
/// creation and never rebuilt mid-dispatch; the cursor only moves forward.
#[derive(Debug, Clone)]
pub struct OfferQueue {
    candidates: Vec<Uuid>,
    cursor: usize,
}

impl OfferQueue {
    pub fn new(candidates: Vec<Uuid>) -> Self {
        Self {
            candidates,
            cursor: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Next candidate, advancing the cursor. None once exhausted.
    pub fn advance(&mut self) -> Option<Uuid> {
        let next = self.candidates.get(self.cursor).copied();
        if next.is_some() {
            self.cursor += 1;
        }
        next
    }
}
