use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::gateway::NotifyEvent;
use crate::geo::GeoPoint;
use crate::index::NearbyDriver;
use crate::models::driver::{DriverLocation, DriverStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers/nearby", get(nearby_drivers))
        .route(
            "/drivers/:id/location",
            post(ping_location).delete(remove_driver),
        )
        .route("/drivers/:id/status", patch(update_status))
}

#[derive(Deserialize)]
pub struct LocationPing {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: DriverStatus,
}

#[derive(Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: Option<f64>,
}

/// Location ping: refreshes the geo index, feeds the broadcast router
/// and, during an accepted ride, emits a tracking update toward the
/// passenger.
async fn ping_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationPing>,
) -> Result<Json<DriverLocation>, AppError> {
    let position = GeoPoint {
        lat: payload.lat,
        lng: payload.lng,
    };
    let update = state.index.update_location(id, position, None)?;
    state.metrics.drivers_tracked.set(state.index.len() as i64);

    state.router.on_location_update(&update);

    if let Some(ride_id) = state.dispatch.active_ride_for(&id) {
        state.gateway.publish(NotifyEvent::TrackingUpdate {
            ride_id,
            driver_id: id,
            position,
        });
    }

    Ok(Json(update.entry))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<DriverLocation>, AppError> {
    let entry = state.index.set_status(id, payload.status)?;
    state.router.on_status_change(&entry);
    Ok(Json(entry))
}

async fn remove_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if !state.index.remove(&id) {
        return Err(AppError::NotFound(format!("driver {} not found", id)));
    }
    state.router.forget_driver(&id);
    state.metrics.drivers_tracked.set(state.index.len() as i64);
    Ok(StatusCode::NO_CONTENT)
}

async fn nearby_drivers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyDriver>>, AppError> {
    let center = GeoPoint {
        lat: query.lat,
        lng: query.lng,
    };
    center.validate()?;
    let radius_m = query
        .radius_m
        .unwrap_or(state.config.default_search_radius_m);
    if !radius_m.is_finite() || radius_m <= 0.0 {
        return Err(AppError::BadRequest(format!(
            "radius_m must be a positive number, got {radius_m}"
        )));
    }

    Ok(Json(state.index.query_nearby(&center, radius_m)))
}
