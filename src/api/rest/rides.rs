use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::dispatch::{NewRide, RideView};
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::ride::{CancelParty, RideRequest};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rides", post(create_ride))
        .route("/rides/:id", get(get_ride))
        .route("/rides/:id/accept", post(accept_ride))
        .route("/rides/:id/reject", post(reject_ride))
        .route("/rides/:id/complete", post(complete_ride))
        .route("/rides/:id/cancel", post(cancel_ride))
}

#[derive(Deserialize)]
pub struct CreateRideRequest {
    pub passenger_id: Uuid,
    pub pickup: GeoPoint,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub passenger_count: u8,
}

#[derive(Deserialize)]
pub struct DriverAction {
    pub driver_id: Uuid,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub party: CancelParty,
    pub party_id: Uuid,
}

async fn create_ride(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRideRequest>,
) -> Result<Json<RideRequest>, AppError> {
    let ride = state.dispatch.create_ride(NewRide {
        passenger_id: payload.passenger_id,
        pickup: payload.pickup,
        pickup_address: payload.pickup_address,
        dropoff_address: payload.dropoff_address,
        passenger_count: payload.passenger_count,
    })?;

    Ok(Json(ride))
}

async fn get_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RideView>, AppError> {
    Ok(Json(state.dispatch.ride_view(id)?))
}

async fn accept_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverAction>,
) -> Result<Json<RideRequest>, AppError> {
    Ok(Json(state.dispatch.accept(id, payload.driver_id)?))
}

async fn reject_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverAction>,
) -> Result<Json<RideRequest>, AppError> {
    Ok(Json(state.dispatch.reject(id, payload.driver_id)?))
}

async fn complete_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverAction>,
) -> Result<Json<RideRequest>, AppError> {
    Ok(Json(state.dispatch.complete(id, payload.driver_id)?))
}

async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<RideRequest>, AppError> {
    Ok(Json(
        state
            .dispatch
            .cancel(id, payload.party, payload.party_id)?,
    ))
}
