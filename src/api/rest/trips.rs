use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post, put};
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::engine::state_machine::NewTrip;
use crate::error::AppError;
use crate::models::position::{GeoPoint, Position};
use crate::models::route::{Route, TravelMode};
use crate::models::trip::{RouteSlot, Trip, TripStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/trips", post(create_trip).get(list_pending))
        .route("/trips/:id", get(get_trip))
        .route("/trips/:id/accept", post(accept_trip))
        .route("/trips/:id/advance", post(advance_trip))
        .route("/trips/:id/routes/:slot", put(attach_route))
        .route("/trips/:id/routes/:slot/compute", post(compute_route))
        .route("/trips/:id/position", patch(publish_position))
        .route("/trips/:id/step", patch(advance_step))
        .route("/trips/:id/rating", post(rate_trip))
}

#[derive(Deserialize)]
pub struct CreateTripRequest {
    pub id: Option<String>,
    pub rider_id: String,
    pub origin: GeoPoint,
    pub destination: Option<GeoPoint>,
}

#[derive(Deserialize)]
pub struct AcceptRequest {
    pub driver_id: String,
    pub expected_version: Option<u64>,
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    pub actor_id: String,
    pub status: TripStatus,
    pub expected_version: Option<u64>,
}

#[derive(Deserialize)]
pub struct AttachRouteRequest {
    pub route: Route,
    pub expected_version: Option<u64>,
}

#[derive(Deserialize)]
pub struct ComputeRouteRequest {
    /// Where the route starts, usually the driver's current position.
    pub origin: GeoPoint,
    #[serde(default)]
    pub mode: TravelMode,
    pub expected_version: Option<u64>,
}

#[derive(Deserialize)]
pub struct PositionRequest {
    pub actor_id: String,
    pub position: Position,
}

#[derive(Deserialize)]
pub struct StepRequest {
    pub actor_id: String,
    pub step_index: usize,
}

#[derive(Deserialize)]
pub struct RatingRequest {
    pub actor_id: String,
    pub rating: u8,
}

async fn create_trip(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateTripRequest>,
) -> Result<Json<Trip>, AppError> {
    let trip = state
        .machine
        .create_trip(NewTrip {
            id: payload.id,
            rider_id: payload.rider_id,
            origin: payload.origin,
            destination: payload.destination,
        })
        .await?;
    Ok(Json(trip))
}

async fn list_pending(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Trip>>, AppError> {
    Ok(Json(state.machine.pending().await?))
}

async fn get_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    Ok(Json(state.machine.snapshot(&id).await?))
}

async fn accept_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<AcceptRequest>,
) -> Result<Json<Trip>, AppError> {
    let trip = state
        .machine
        .accept(&id, &payload.driver_id, payload.expected_version)
        .await?;
    Ok(Json(trip))
}

async fn advance_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<AdvanceRequest>,
) -> Result<Json<Trip>, AppError> {
    let trip = state
        .machine
        .advance(&id, &payload.actor_id, payload.status, payload.expected_version)
        .await?;
    Ok(Json(trip))
}

async fn attach_route(
    State(state): State<Arc<AppState>>,
    Path((id, slot)): Path<(String, String)>,
    Json(payload): Json<AttachRouteRequest>,
) -> Result<Json<Trip>, AppError> {
    let slot = parse_slot(&slot)?;
    let trip = state
        .machine
        .attach_route(&id, slot, payload.route, payload.expected_version)
        .await?;
    Ok(Json(trip))
}

async fn compute_route(
    State(state): State<Arc<AppState>>,
    Path((id, slot)): Path<(String, String)>,
    Json(payload): Json<ComputeRouteRequest>,
) -> Result<Json<Trip>, AppError> {
    let slot = parse_slot(&slot)?;
    let trip = state.machine.snapshot(&id).await?;

    let target = match slot {
        RouteSlot::Pickup => trip.origin,
        RouteSlot::Destination => trip.destination.ok_or_else(|| {
            AppError::InvalidInput(format!("trip {id} has no destination"))
        })?,
    };

    let route = state.router.route(payload.origin, target, payload.mode).await?;
    let expected_version = payload.expected_version.or(Some(trip.version));
    let trip = state
        .machine
        .attach_route(&id, slot, route, expected_version)
        .await?;
    Ok(Json(trip))
}

async fn publish_position(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<PositionRequest>,
) -> Result<Json<Trip>, AppError> {
    let trip = state
        .machine
        .publish_position(&id, &payload.actor_id, payload.position)
        .await?;
    Ok(Json(trip))
}

async fn advance_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<StepRequest>,
) -> Result<Json<Trip>, AppError> {
    let trip = state
        .machine
        .advance_step(&id, &payload.actor_id, payload.step_index)
        .await?;
    Ok(Json(trip))
}

async fn rate_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<RatingRequest>,
) -> Result<Json<Trip>, AppError> {
    let trip = state
        .machine
        .rate(&id, &payload.actor_id, payload.rating)
        .await?;
    Ok(Json(trip))
}

fn parse_slot(raw: &str) -> Result<RouteSlot, AppError> {
    raw.parse::<RouteSlot>().map_err(AppError::InvalidInput)
}
