use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::position::{GeoPoint, Position};
use crate::models::route::Route;
use crate::models::trip::{Role, RouteSlot, Trip, TripPatch, TripStatus};
use crate::observability::metrics::Metrics;
use crate::store::{SubscriptionHandle, TripStore, TripSubscription};

const BLIND_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct NewTrip {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    pub rider_id: String,
    pub origin: GeoPoint,
    pub destination: Option<GeoPoint>,
}

/// Canonical owner of trip status. Every mutation goes through the store
/// with the version it was validated against, so a concurrent writer turns
/// into a `Conflict` rather than a lost update.
pub struct TripStateMachine {
    store: Arc<dyn TripStore>,
    metrics: Metrics,
}

impl TripStateMachine {
    pub fn new(store: Arc<dyn TripStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    pub async fn create(&self, rider_id: &str, origin: GeoPoint) -> Result<Trip, AppError> {
        self.create_trip(NewTrip {
            id: None,
            rider_id: rider_id.to_string(),
            origin,
            destination: None,
        })
        .await
    }

    pub async fn create_trip(&self, request: NewTrip) -> Result<Trip, AppError> {
        let result: Result<Trip, AppError> = async move {
            require_id("rider_id", &request.rider_id)?;
            request.origin.validate()?;
            if let Some(destination) = &request.destination {
                destination.validate()?;
            }

            let id = match request.id {
                Some(id) => {
                    require_id("trip id", &id)?;
                    id
                }
                None => Uuid::new_v4().to_string(),
            };

            let trip = self
                .store
                .create(Trip::new(id, request.rider_id, request.origin, request.destination))
                .await?;
            info!(trip_id = %trip.id, rider_id = %trip.rider_id, "trip requested");
            Ok(trip)
        }
        .await;

        self.observe("create", result)
    }

    pub async fn accept(
        &self,
        trip_id: &str,
        driver_id: &str,
        expected_version: Option<u64>,
    ) -> Result<Trip, AppError> {
        let result: Result<Trip, AppError> = async move {
            require_id("driver_id", driver_id)?;
            let trip = self.store.get(trip_id).await?;
            let version = check_version(&trip, expected_version)?;

            if trip.rider_id == driver_id {
                return Err(AppError::Forbidden(
                    "a rider cannot accept their own trip".to_string(),
                ));
            }

            if trip.status != TripStatus::Requested {
                let taken_by_other = !trip.status.is_terminal()
                    && trip
                        .driver_id
                        .as_deref()
                        .is_some_and(|assigned| assigned != driver_id);
                if taken_by_other {
                    return Err(AppError::Conflict(format!(
                        "trip {trip_id} is no longer available"
                    )));
                }
                return Err(AppError::InvalidTransition(format!(
                    "cannot accept trip {trip_id} in status {}",
                    trip.status
                )));
            }

            let patch = TripPatch {
                status: Some(TripStatus::Accepted),
                driver_id: Some(driver_id.to_string()),
                ..TripPatch::default()
            };
            let trip = self.store.update(trip_id, version, patch).await?;
            info!(trip_id, driver_id, version = trip.version, "trip accepted");
            Ok(trip)
        }
        .await;

        self.observe("accept", result)
    }

    pub async fn advance(
        &self,
        trip_id: &str,
        actor_id: &str,
        target: TripStatus,
        expected_version: Option<u64>,
    ) -> Result<Trip, AppError> {
        let result: Result<Trip, AppError> = async move {
            let trip = self.store.get(trip_id).await?;
            let version = check_version(&trip, expected_version)?;

            let required = trip.status.authorized_role(target).ok_or_else(|| {
                AppError::InvalidTransition(format!("{} -> {target} is not allowed", trip.status))
            })?;

            if trip.role_of(actor_id) != Some(required) {
                return Err(AppError::Forbidden(format!(
                    "{actor_id} may not move trip {trip_id} to {target}"
                )));
            }

            let mut patch = TripPatch::status(target);
            if target == TripStatus::InProgress {
                // The active route switches from pickup to destination.
                patch.step_index = Some(0);
            }

            let from = trip.status;
            let trip = self.store.update(trip_id, version, patch).await?;
            info!(trip_id, actor_id, %from, to = %target, "trip status changed");
            Ok(trip)
        }
        .await;

        self.observe("advance", result)
    }

    pub async fn attach_route(
        &self,
        trip_id: &str,
        slot: RouteSlot,
        route: Route,
        expected_version: Option<u64>,
    ) -> Result<Trip, AppError> {
        let result: Result<Trip, AppError> = async move {
            route.validate()?;
            let trip = self.store.get(trip_id).await?;
            let version = check_version(&trip, expected_version)?;

            let allowed = match slot {
                RouteSlot::Pickup => matches!(
                    trip.status,
                    TripStatus::Accepted | TripStatus::EnRouteToPickup | TripStatus::Arrived
                ),
                RouteSlot::Destination => {
                    trip.status.has_driver() && !trip.status.is_terminal()
                }
            };
            if !allowed {
                return Err(AppError::InvalidTransition(format!(
                    "cannot attach {slot:?} route to trip {trip_id} in status {}",
                    trip.status
                )));
            }

            let steps = route.steps.len();
            let mut patch = TripPatch::route(slot, route);
            if trip.status.active_slot() != Some(slot) {
                // Progress belongs to the route being followed; a route
                // prepared for later starts from 0 when it becomes active.
                patch.step_index = None;
            }
            let trip = self.store.update(trip_id, version, patch).await?;
            info!(trip_id, ?slot, steps, "route attached");
            Ok(trip)
        }
        .await;

        self.observe("attach_route", result)
    }

    pub async fn snapshot(&self, trip_id: &str) -> Result<Trip, AppError> {
        self.store.get(trip_id).await
    }

    /// Records the driver's latest published position. Positions are
    /// last-writer-wins, so a version race is retried a few times instead of
    /// surfacing.
    pub async fn publish_position(
        &self,
        trip_id: &str,
        actor_id: &str,
        position: Position,
    ) -> Result<Trip, AppError> {
        let result: Result<Trip, AppError> = async move {
            position.validate()?;
            self.write_with_retry(trip_id, |trip| {
                require_driver(trip, actor_id)?;
                require_live(trip)?;
                Ok(Some(TripPatch {
                    driver_position: Some(position.clone()),
                    ..TripPatch::default()
                }))
            })
            .await
        }
        .await;

        self.observe("publish_position", result)
    }

    /// Moves the active route's step index forward. Lower indices are
    /// ignored.
    pub async fn advance_step(
        &self,
        trip_id: &str,
        actor_id: &str,
        step_index: usize,
    ) -> Result<Trip, AppError> {
        let result = self
            .write_with_retry(trip_id, |trip| {
                require_driver(trip, actor_id)?;
                require_live(trip)?;

                let route = trip.active_route().ok_or_else(|| {
                    AppError::InvalidTransition(format!(
                        "trip {} has no active route in status {}",
                        trip.id, trip.status
                    ))
                })?;
                if step_index > route.last_step_index() {
                    return Err(AppError::InvalidInput(format!(
                        "step {step_index} is past the last step {}",
                        route.last_step_index()
                    )));
                }
                if step_index <= trip.step_index {
                    return Ok(None);
                }

                Ok(Some(TripPatch {
                    step_index: Some(step_index),
                    ..TripPatch::default()
                }))
            })
            .await;

        self.observe("advance_step", result)
    }

    pub async fn rate(&self, trip_id: &str, actor_id: &str, rating: u8) -> Result<Trip, AppError> {
        let result: Result<Trip, AppError> = async move {
            if !(1..=5).contains(&rating) {
                return Err(AppError::InvalidInput(format!(
                    "rating {rating} outside 1..=5"
                )));
            }

            let trip = self.store.get(trip_id).await?;
            if trip.role_of(actor_id) != Some(Role::Rider) {
                return Err(AppError::Forbidden(format!(
                    "only the rider may rate trip {trip_id}"
                )));
            }
            if trip.status != TripStatus::Completed {
                return Err(AppError::InvalidTransition(format!(
                    "cannot rate trip {trip_id} in status {}",
                    trip.status
                )));
            }
            if trip.rating.is_some() {
                return Err(AppError::Conflict(format!("trip {trip_id} is already rated")));
            }

            let patch = TripPatch {
                rating: Some(rating),
                ..TripPatch::default()
            };
            let trip = self.store.update(trip_id, trip.version, patch).await?;
            info!(trip_id, rating, "trip rated");
            Ok(trip)
        }
        .await;

        self.observe("rate", result)
    }

    /// Trips still waiting for a driver, oldest first.
    pub async fn pending(&self) -> Result<Vec<Trip>, AppError> {
        let mut trips: Vec<Trip> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|trip| trip.status == TripStatus::Requested)
            .collect();
        trips.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(trips)
    }

    pub async fn subscribe(&self, trip_id: &str) -> Result<TripSubscription, AppError> {
        self.store.subscribe(trip_id).await
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.store.unsubscribe(handle);
    }

    async fn write_with_retry<F>(&self, trip_id: &str, build: F) -> Result<Trip, AppError>
    where
        F: Fn(&Trip) -> Result<Option<TripPatch>, AppError> + Send + Sync,
    {
        let mut last_conflict = None;

        for attempt in 1..=BLIND_WRITE_ATTEMPTS {
            let trip = self.store.get(trip_id).await?;
            let Some(patch) = build(&trip)? else {
                return Ok(trip);
            };

            match self.store.update(trip_id, trip.version, patch).await {
                Err(AppError::Conflict(msg)) => {
                    debug!(trip_id, attempt, "version moved during write; retrying");
                    last_conflict = Some(msg);
                }
                other => return other,
            }
        }

        Err(AppError::Conflict(last_conflict.unwrap_or_else(|| {
            format!("trip {trip_id} kept changing during write")
        })))
    }

    fn observe(&self, operation: &str, result: Result<Trip, AppError>) -> Result<Trip, AppError> {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => {
                warn!(operation, error = %err, "trip operation rejected");
                err.kind()
            }
        };
        self.metrics
            .trip_operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        result
    }
}

fn require_id(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{field} cannot be empty")));
    }
    Ok(())
}

fn check_version(trip: &Trip, expected: Option<u64>) -> Result<u64, AppError> {
    match expected {
        Some(expected) if expected != trip.version => Err(AppError::Conflict(format!(
            "trip {} is at version {}, expected {expected}",
            trip.id, trip.version
        ))),
        _ => Ok(trip.version),
    }
}

fn require_driver(trip: &Trip, actor_id: &str) -> Result<(), AppError> {
    if trip.role_of(actor_id) != Some(Role::Driver) {
        return Err(AppError::Forbidden(format!(
            "{actor_id} is not the driver of trip {}",
            trip.id
        )));
    }
    Ok(())
}

fn require_live(trip: &Trip) -> Result<(), AppError> {
    if !trip.status.has_driver() || trip.status.is_terminal() {
        return Err(AppError::InvalidTransition(format!(
            "trip {} is {}",
            trip.id, trip.status
        )));
    }
    Ok(())
}
