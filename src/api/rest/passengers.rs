use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broadcast::PassengerEvent;
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::index::NearbyDriver;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/passengers/:id/subscription",
            put(subscribe).delete(unsubscribe),
        )
        .route("/passengers/:id/stream", get(stream_handler))
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: f64,
}

#[derive(Serialize)]
pub struct SubscribeResponse {
    pub passenger_id: Uuid,
    pub drivers: Vec<NearbyDriver>,
}

/// Subscribes the passenger to driver updates around a point, replacing
/// any prior subscription, and returns the immediate snapshot. Live
/// events flow over the `/stream` websocket.
async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SubscribeRequest>,
) -> Result<Json<SubscribeResponse>, AppError> {
    let center = GeoPoint {
        lat: payload.lat,
        lng: payload.lng,
    };
    let drivers = state.router.subscribe(id, center, payload.radius_m)?;

    Ok(Json(SubscribeResponse {
        passenger_id: id,
        drivers,
    }))
}

async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if !state.router.unsubscribe(&id) {
        return Err(AppError::NotFound(format!(
            "no subscription for passenger {id}"
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let rx = state.router.claim_stream(&id)?;
    Ok(ws.on_upgrade(move |socket| stream_events(socket, state, id, rx)))
}

async fn stream_events(
    socket: WebSocket,
    state: Arc<AppState>,
    passenger_id: Uuid,
    rx: mpsc::Receiver<PassengerEvent>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = ReceiverStream::new(rx);

    info!(%passenger_id, "passenger stream connected");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, "failed to serialize passenger event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                if !matches!(msg, Some(Ok(_))) {
                    break;
                }
            }
        }
    }

    // Subscriptions do not outlive their delivery channel.
    state.router.unsubscribe(&passenger_id);
    info!(%passenger_id, "passenger stream disconnected");
}
