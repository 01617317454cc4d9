//! Per-actor, per-trip session.
//!
//! One spawned loop owns the publisher and tracker state and serializes the
//! two inputs that touch it: the local sensor stream and the store
//! subscription. A remote route replacement therefore never races a
//! decision taken on a local fix; a route computed against an outdated
//! snapshot is rejected by the store's version check and dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::publisher::{FixDecision, PositionPublisher, PublisherConfig};
use crate::engine::state_machine::TripStateMachine;
use crate::engine::tracker::{RouteTracker, TrackerConfig};
use crate::error::{AppError, SensorError};
use crate::models::position::{GeoPoint, Position};
use crate::models::route::{Route, TravelMode};
use crate::models::trip::{Role, Trip, TripStatus};
use crate::observability::metrics::Metrics;
use crate::routing::RouteProvider;
use crate::sensor::{ChannelSensor, LocationSensor, SensorReading};
use crate::store::{SubscriptionHandle, TripSubscription};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub publisher: PublisherConfig,
    pub tracker: TrackerConfig,
    pub event_buffer_size: usize,
    pub travel_mode: TravelMode,
    /// How long a live driver session waits for its first fix before
    /// publishing a fallback location.
    pub sensor_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            publisher: PublisherConfig::default(),
            tracker: TrackerConfig::default(),
            event_buffer_size: 1024,
            travel_mode: TravelMode::Driving,
            sensor_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Clone)]
pub struct SessionContext {
    pub machine: Arc<TripStateMachine>,
    pub router: Arc<dyn RouteProvider>,
    pub metrics: Metrics,
    pub config: SessionConfig,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A fix passed the publisher and was written to the trip.
    Published(Position),
    /// The publisher accepted a fix but the store rejected it.
    PublishFailed(AppError),
    StepAdvanced(usize),
    Deviated(Position),
    Rerouted(Route),
    /// Routing failed; the previous route stays active.
    RouteUnavailable(AppError),
    /// Final step reached, within proximity of the destination.
    Arrived,
    TripUpdated(Box<Trip>),
    /// The sensor failed and position tracking stopped.
    SensorFailed(AppError),
    Ended(TripStatus),
}

/// Handle on a running session. Dropping it stops the session.
pub struct TripSession {
    trip_id: String,
    role: Role,
    machine: Arc<TripStateMachine>,
    metrics: Metrics,
    watch: Option<(Arc<dyn LocationSensor>, u64)>,
    subscription: Option<SubscriptionHandle>,
    task: Option<JoinHandle<()>>,
    events: mpsc::Receiver<SessionEvent>,
}

impl TripSession {
    /// Starts a session for `actor_id` on `trip_id`. The actor must be the
    /// trip's rider or driver. Only a driver session consumes `sensor`; a
    /// rider session follows the driver's published position instead.
    pub async fn start(
        ctx: SessionContext,
        trip_id: &str,
        actor_id: &str,
        sensor: Option<Arc<dyn LocationSensor>>,
    ) -> Result<Self, AppError> {
        let subscription = ctx.machine.subscribe(trip_id).await?;
        let trip = subscription.current();

        let Some(role) = trip.role_of(actor_id) else {
            ctx.machine.unsubscribe(subscription.handle());
            return Err(AppError::Forbidden(format!(
                "{actor_id} is not a participant of trip {trip_id}"
            )));
        };

        let handle = subscription.handle().clone();
        let (watch, readings) = match (role, sensor) {
            (Role::Driver, Some(sensor)) => {
                let watch = sensor.watch();
                (Some((sensor, watch.id)), Some(watch.readings))
            }
            _ => (None, None),
        };

        let (events_tx, events_rx) = mpsc::channel(ctx.config.event_buffer_size.max(1));

        let session_loop = SessionLoop {
            trip_id: trip_id.to_string(),
            actor_id: actor_id.to_string(),
            role,
            machine: ctx.machine.clone(),
            router: ctx.router.clone(),
            metrics: ctx.metrics.clone(),
            travel_mode: ctx.config.travel_mode,
            publisher: PositionPublisher::new(ctx.config.publisher.clone()),
            tracker: RouteTracker::new(ctx.config.tracker.clone()),
            trip,
            readings,
            subscription,
            events: events_tx,
        };
        let task = tokio::spawn(session_loop.run());
        ctx.metrics.active_sessions.inc();

        Ok(Self {
            trip_id: trip_id.to_string(),
            role,
            machine: ctx.machine,
            metrics: ctx.metrics,
            watch,
            subscription: Some(handle),
            task: Some(task),
            events: events_rx,
        })
    }

    pub fn trip_id(&self) -> &str {
        &self.trip_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_tracking(&self) -> bool {
        self.watch.is_some()
    }

    /// Next event, or `None` once the session has ended and every event has
    /// been drained.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Releases the sensor watch. The session keeps following the trip;
    /// publisher history is cleared before any later fix could be judged.
    pub fn stop_tracking(&mut self) {
        if let Some((sensor, watch_id)) = self.watch.take() {
            sensor.stop(watch_id);
            debug!(trip_id = %self.trip_id, "position tracking stopped");
        }
    }

    /// Releases the sensor watch and the trip subscription and ends the loop.
    /// Safe to call any number of times.
    pub fn stop(&mut self) {
        self.stop_tracking();
        if let Some(handle) = self.subscription.take() {
            self.machine.unsubscribe(&handle);
        }
        if let Some(task) = self.task.take() {
            task.abort();
            self.metrics.active_sessions.dec();
            info!(trip_id = %self.trip_id, role = ?self.role, "trip session stopped");
        }
    }
}

impl Drop for TripSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitialFix {
    pub position: Position,
    /// True when the sensor gave nothing and `position` is the fallback.
    pub fallback: bool,
}

/// Initial fix for a session, falling back to `fallback` when the sensor
/// times out or has nothing to offer. A denied permission is not papered over.
pub async fn acquire_fix(
    sensor: &dyn LocationSensor,
    timeout: Duration,
    fallback: GeoPoint,
) -> Result<InitialFix, AppError> {
    match sensor.get_once(timeout).await {
        Ok(position) => Ok(InitialFix {
            position,
            fallback: false,
        }),
        Err(err @ (AppError::Timeout(_) | AppError::Unavailable(_))) => {
            warn!(error = %err, "no initial fix; using fallback location");
            fallback.validate()?;
            Ok(InitialFix {
                position: Position::new(fallback.lat, fallback.lng, Utc::now()),
                fallback: true,
            })
        }
        Err(err) => Err(err),
    }
}

/// Waits for the first fix on a host-fed sensor. A real fix has already
/// reached every open watch; a fallback is pushed so running sessions
/// publish it like any other reading.
pub async fn seed_initial_fix(
    sensor: &ChannelSensor,
    timeout: Duration,
    fallback: GeoPoint,
) -> Result<InitialFix, AppError> {
    let initial = acquire_fix(sensor, timeout, fallback).await?;
    if initial.fallback {
        let delivered = sensor.push(Ok(initial.position.clone()));
        debug!(delivered, "fallback location pushed to open watches");
    }
    Ok(initial)
}

enum Input {
    Reading(Option<SensorReading>),
    Remote(Option<Trip>),
}

struct SessionLoop {
    trip_id: String,
    actor_id: String,
    role: Role,
    machine: Arc<TripStateMachine>,
    router: Arc<dyn RouteProvider>,
    metrics: Metrics,
    travel_mode: TravelMode,
    publisher: PositionPublisher,
    tracker: RouteTracker,
    trip: Trip,
    readings: Option<mpsc::Receiver<SensorReading>>,
    subscription: TripSubscription,
    events: mpsc::Sender<SessionEvent>,
}

impl SessionLoop {
    async fn run(mut self) {
        info!(trip_id = %self.trip_id, role = ?self.role, "trip session started");

        self.sync_route();
        if self.trip.status.is_terminal() {
            self.emit(SessionEvent::Ended(self.trip.status));
            return;
        }

        loop {
            let input = tokio::select! {
                reading = next_reading(&mut self.readings) => Input::Reading(reading),
                update = self.subscription.next() => Input::Remote(update),
            };

            match input {
                Input::Reading(Some(Ok(fix))) => self.on_fix(fix).await,
                Input::Reading(Some(Err(err))) => self.on_sensor_error(err),
                Input::Reading(None) => {
                    self.readings = None;
                    self.publisher.reset();
                    debug!(trip_id = %self.trip_id, "sensor watch closed; publisher history cleared");
                }
                Input::Remote(Some(trip)) => {
                    if self.on_remote(trip).await {
                        break;
                    }
                }
                Input::Remote(None) => {
                    debug!(trip_id = %self.trip_id, "trip subscription closed");
                    break;
                }
            }
        }

        info!(trip_id = %self.trip_id, status = %self.trip.status, "trip session loop finished");
    }

    async fn on_fix(&mut self, fix: Position) {
        let published = match self.publisher.on_raw_fix(fix) {
            Ok(published) => published,
            Err(err) => {
                warn!(trip_id = %self.trip_id, error = %err, "discarding malformed fix");
                self.metrics.fixes_total.with_label_values(&["rejected"]).inc();
                return;
            }
        };

        let decision = self
            .publisher
            .last_decision()
            .map(FixDecision::as_label)
            .unwrap_or("rejected");
        self.metrics.fixes_total.with_label_values(&[decision]).inc();

        let Some(position) = published else {
            return;
        };

        match self
            .machine
            .publish_position(&self.trip_id, &self.actor_id, position.clone())
            .await
        {
            Ok(trip) => {
                self.adopt(trip);
                self.emit(SessionEvent::Published(position.clone()));
            }
            Err(err) => {
                warn!(trip_id = %self.trip_id, error = %err, "failed to publish position");
                self.emit(SessionEvent::PublishFailed(err));
            }
        }

        self.track(&position).await;
    }

    fn on_sensor_error(&mut self, err: SensorError) {
        let error = self.publisher.on_sensor_error(err);

        // Tracking stays stopped; restarting is the caller's call.
        if let Some(mut readings) = self.readings.take() {
            readings.close();
        }
        self.publisher.reset();
        self.emit(SessionEvent::SensorFailed(error));
    }

    /// Returns true once the trip is over.
    async fn on_remote(&mut self, trip: Trip) -> bool {
        if trip.version <= self.trip.version {
            // Echo of a write this session already adopted.
            return self.trip.status.is_terminal();
        }

        let previous_position = self.trip.driver_position.clone();
        let previous_step = self.tracker.step_index();
        let had_route = self.tracker.route().cloned();

        let finished = self.adopt(trip);
        self.emit(SessionEvent::TripUpdated(Box::new(self.trip.clone())));
        if finished {
            self.emit(SessionEvent::Ended(self.trip.status));
            return true;
        }

        if self.role == Role::Rider {
            let same_route = had_route.as_ref() == self.tracker.route();
            if same_route && self.tracker.step_index() > previous_step {
                self.emit(SessionEvent::StepAdvanced(self.tracker.step_index()));
            }

            if let Some(position) = self.trip.driver_position.clone() {
                if previous_position.as_ref() != Some(&position) {
                    self.track(&position).await;
                }
            }
        }

        false
    }

    /// Takes over a newer snapshot. Returns true when the trip is terminal.
    fn adopt(&mut self, trip: Trip) -> bool {
        if trip.version >= self.trip.version {
            self.trip = trip;
            self.sync_route();
        }
        self.trip.status.is_terminal()
    }

    fn sync_route(&mut self) {
        let Some(route) = self.trip.active_route() else {
            if self.tracker.route().is_some() {
                self.tracker.clear();
            }
            return;
        };

        if self.tracker.route() == Some(route) {
            self.tracker.sync_step_index(self.trip.step_index);
            return;
        }

        let route = route.clone();
        if let Err(err) = self.tracker.set_route(route, self.trip.step_index) {
            warn!(trip_id = %self.trip_id, error = %err, "active route is unusable; tracking paused");
            self.tracker.clear();
        }
    }

    async fn track(&mut self, position: &Position) {
        let update = self.tracker.update(&position.point());

        if update.advanced {
            self.emit(SessionEvent::StepAdvanced(update.step_index));
            if self.role == Role::Driver {
                match self
                    .machine
                    .advance_step(&self.trip_id, &self.actor_id, update.step_index)
                    .await
                {
                    Ok(trip) => {
                        self.adopt(trip);
                    }
                    Err(err) => {
                        warn!(trip_id = %self.trip_id, error = %err, "failed to record step progress");
                    }
                }
            }
        }

        if update.arrived {
            info!(trip_id = %self.trip_id, "final step reached");
            self.emit(SessionEvent::Arrived);
        }

        if update.deviated {
            self.emit(SessionEvent::Deviated(position.clone()));
            if self.role == Role::Driver {
                self.reroute(position).await;
            }
        }
    }

    async fn reroute(&mut self, position: &Position) {
        let Some(slot) = self.trip.status.active_slot() else {
            return;
        };
        let Some(destination) = self.tracker.route().map(|route| route.destination) else {
            return;
        };
        let expected_version = self.trip.version;

        info!(trip_id = %self.trip_id, ?slot, "off route; requesting a new one");
        let started = Instant::now();

        let outcome = match self
            .router
            .route(position.point(), destination, self.travel_mode)
            .await
        {
            Ok(route) => match self
                .machine
                .attach_route(&self.trip_id, slot, route.clone(), Some(expected_version))
                .await
            {
                Ok(trip) => {
                    self.adopt(trip);
                    self.emit(SessionEvent::Rerouted(route));
                    "success"
                }
                Err(AppError::Conflict(_)) => {
                    debug!(trip_id = %self.trip_id, "trip changed while routing; dropping computed route");
                    "stale"
                }
                Err(err) => {
                    warn!(trip_id = %self.trip_id, error = %err, "could not attach new route");
                    self.tracker.suspend_deviation();
                    self.emit(SessionEvent::RouteUnavailable(err));
                    "error"
                }
            },
            Err(err) => {
                warn!(trip_id = %self.trip_id, error = %err, "routing failed; keeping previous route");
                self.tracker.suspend_deviation();
                self.emit(SessionEvent::RouteUnavailable(err));
                "no_route"
            }
        };

        self.metrics
            .reroute_latency_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());
        self.metrics.reroutes_total.with_label_values(&[outcome]).inc();
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(trip_id = %self.trip_id, ?event, "session event buffer full; dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

async fn next_reading(
    readings: &mut Option<mpsc::Receiver<SensorReading>>,
) -> Option<SensorReading> {
    match readings {
        Some(readings) => readings.recv().await,
        None => std::future::pending().await,
    }
}
