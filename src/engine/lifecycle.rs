use crate::models::ride::RideStatus;

/// Legal ride status edges. Every mutation goes through this table under
/// the ride's lock; anything else fails closed. Terminal states have no
/// outgoing edges.
pub fn can_transition(from: RideStatus, to: RideStatus) -> bool {
    use RideStatus::*;

    match (from, to) {
        (Pending, Offered) => true,
        (Pending, NoDrivers) => true,
        // Offered → Offered is the daisy-chain advancing to the next
        // candidate after a rejection or expiry.
        (Offered, Offered) => true,
        (Offered, Accepted) => true,
        (Offered, NoDrivers) => true,
        (Accepted, Completed) => true,
        (Pending | Offered | Accepted, CancelledUser) => true,
        (Pending | Offered | Accepted, CancelledDriver) => true,
        _ => false,
    }
}
