use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::session::{seed_initial_fix, SessionEvent, TripSession};
use crate::error::AppError;
use crate::models::position::Position;
use crate::models::trip::Role;
use crate::sensor::{ChannelSensor, LocationSensor};
use crate::state::AppState;
use crate::store::TripSubscription;

#[derive(Deserialize)]
pub struct WsParams {
    /// Participant to run a live session for. Without it the socket only
    /// streams trip snapshots.
    pub actor_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<WsParams>,
) -> Result<Response, AppError> {
    match params.actor_id {
        None => {
            let subscription = state.machine.subscribe(&id).await?;
            Ok(ws.on_upgrade(move |socket| stream_snapshots(socket, state, subscription)))
        }
        Some(actor_id) => {
            let sensor = Arc::new(ChannelSensor::default());
            let session = TripSession::start(
                state.session_context(),
                &id,
                &actor_id,
                Some(sensor.clone() as Arc<dyn LocationSensor>),
            )
            .await?;

            let seeding = if session.role() == Role::Driver {
                // Last known driver location, else the pickup point.
                let trip = state.machine.snapshot(&id).await?;
                let fallback = trip
                    .driver_position
                    .as_ref()
                    .map(Position::point)
                    .unwrap_or(trip.origin);
                let timeout = state.session.sensor_timeout;
                let sensor = sensor.clone();
                Some(tokio::spawn(async move {
                    match seed_initial_fix(&sensor, timeout, fallback).await {
                        Ok(initial) => debug!(fallback = initial.fallback, "initial fix acquired"),
                        Err(err) => warn!(error = %err, "no initial fix for session"),
                    }
                }))
            } else {
                None
            };

            Ok(ws.on_upgrade(move |socket| run_session(socket, session, sensor, seeding)))
        }
    }
}

async fn stream_snapshots(socket: WebSocket, state: Arc<AppState>, subscription: TripSubscription) {
    let (mut sender, mut receiver) = socket.split();
    let initial = subscription.current();
    let (handle, mut updates) = subscription.into_stream();

    info!(trip_id = %handle.trip_id, "websocket snapshot client connected");

    let send_task = tokio::spawn(async move {
        let mut next = Some(initial);
        while let Some(trip) = next {
            let terminal = trip.status.is_terminal();
            let json = match serde_json::to_string(&trip) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize trip for ws");
                    next = updates.next().await;
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() || terminal {
                break;
            }
            next = updates.next().await;
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.machine.unsubscribe(&handle);
    info!(trip_id = %handle.trip_id, "websocket snapshot client disconnected");
}

/// Drives a live session over the socket. A driver sends fixes as JSON
/// positions; both roles receive session events. A driver session falls
/// back to its last known location when the client sends no fix within the
/// sensor timeout.
async fn run_session(
    socket: WebSocket,
    mut session: TripSession,
    sensor: Arc<ChannelSensor>,
    seeding: Option<JoinHandle<()>>,
) {
    let (mut sender, mut receiver) = socket.split();

    info!(trip_id = %session.trip_id(), role = ?session.role(), "websocket session connected");

    loop {
        tokio::select! {
            event = session.next_event() => {
                let Some(event) = event else { break };
                let ended = matches!(event, SessionEvent::Ended(_));
                let json = event_message(&event).to_string();
                if sender.send(Message::Text(json.into())).await.is_err() || ended {
                    break;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Position>(&text) {
                    Ok(fix) => {
                        sensor.push(Ok(fix));
                    }
                    Err(err) => warn!(error = %err, "ignoring malformed fix from websocket"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    if let Some(seeding) = seeding {
        seeding.abort();
    }
    session.stop();
    info!(trip_id = %session.trip_id(), "websocket session disconnected");
}

fn event_message(event: &SessionEvent) -> Value {
    match event {
        SessionEvent::Published(position) => json!({ "event": "published", "position": position }),
        SessionEvent::PublishFailed(err) => error_message("publish_failed", err),
        SessionEvent::StepAdvanced(step_index) => {
            json!({ "event": "step_advanced", "step_index": step_index })
        }
        SessionEvent::Deviated(position) => json!({ "event": "deviated", "position": position }),
        SessionEvent::Rerouted(route) => json!({ "event": "rerouted", "route": route }),
        SessionEvent::RouteUnavailable(err) => error_message("route_unavailable", err),
        SessionEvent::Arrived => json!({ "event": "arrived" }),
        SessionEvent::TripUpdated(trip) => json!({ "event": "trip_updated", "trip": trip }),
        SessionEvent::SensorFailed(err) => error_message("sensor_failed", err),
        SessionEvent::Ended(status) => json!({ "event": "ended", "status": status }),
    }
}

fn error_message(event: &str, err: &AppError) -> Value {
    json!({ "event": event, "kind": err.kind(), "error": err.to_string() })
}
