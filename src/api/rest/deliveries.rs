use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, patch};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::event::StatusChangeEvent;
use crate::models::location::GeoPoint;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/deliveries", get(list_deliveries).post(create_delivery))
        .route("/api/deliveries/:id", get(get_delivery))
        .route("/api/deliveries/:id/status", patch(update_status))
}

#[derive(Deserialize)]
pub struct CreateDeliveryRequest {
    pub id: Option<String>,
    pub driver_id: String,
    pub customer_id: String,
    pub pickup_lat: f64,
    pub pickup_lon: f64,
    pub dropoff_lat: f64,
    pub dropoff_lon: f64,
    pub status: Option<DeliveryStatus>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: DeliveryStatus,
}

async fn list_deliveries(State(state): State<Arc<AppState>>) -> Json<Vec<Delivery>> {
    Json(state.tracker.deliveries().await)
}

async fn get_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Delivery>, AppError> {
    state
        .tracker
        .delivery(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("delivery {id} not found")))
}

/// Records a delivery whose driver has already been chosen elsewhere.
async fn create_delivery(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDeliveryRequest>,
) -> Result<Json<Delivery>, AppError> {
    if payload.driver_id.trim().is_empty() {
        return Err(AppError::BadRequest("driver_id cannot be empty".to_string()));
    }
    if payload.customer_id.trim().is_empty() {
        return Err(AppError::BadRequest("customer_id cannot be empty".to_string()));
    }

    let status = payload.status.unwrap_or(DeliveryStatus::Assigned);
    if status.is_terminal() {
        return Err(AppError::BadRequest(format!(
            "cannot create a delivery in terminal status {status}"
        )));
    }

    let id = payload
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if state.tracker.delivery(&id).await.is_some() {
        return Err(AppError::Conflict(format!("delivery {id} already exists")));
    }

    let now = Utc::now();
    let delivery = Delivery {
        id,
        driver_id: payload.driver_id,
        customer_id: payload.customer_id,
        pickup: GeoPoint {
            lat: payload.pickup_lat,
            lon: payload.pickup_lon,
        },
        dropoff: GeoPoint {
            lat: payload.dropoff_lat,
            lon: payload.dropoff_lon,
        },
        status,
        estimated_arrival: None,
        created_at: now,
        updated_at: now,
    };

    state.storage.insert_delivery(&delivery).await?;
    state.tracker.track_delivery(delivery.clone()).await;

    Ok(Json(delivery))
}

/// Manual status change. Deliveries already `delivered` or `cancelled` are
/// rejected with 409.
async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<StatusChangeEvent>, AppError> {
    state
        .tracker
        .update_delivery_status(&id, payload.status)
        .await
        .map(Json)
}
