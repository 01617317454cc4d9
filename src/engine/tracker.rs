use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::geo::{approx_distance_to_polyline_m, haversine_m};
use crate::models::position::GeoPoint;
use crate::models::route::Route;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Distance to a step's end point at which the step counts as done.
    pub step_proximity_m: f64,
    /// Distance from the route beyond which the position has deviated.
    pub deviation_threshold_m: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            step_proximity_m: 30.0,
            deviation_threshold_m: 40.0,
        }
    }
}

/// Step the position is on, scanning forward from `prior_index`.
///
/// Reaching the end point of any step at or after `prior_index` advances the
/// index by exactly one, capped at the last step. The index never goes back.
pub fn current_step_index(
    route: &Route,
    position: &GeoPoint,
    prior_index: usize,
    proximity_m: f64,
) -> usize {
    if route.steps.is_empty() {
        return 0;
    }

    let last = route.last_step_index();
    let prior = prior_index.min(last);

    let reached = route.steps[prior..]
        .iter()
        .any(|step| haversine_m(position, &step.end) <= proximity_m);

    if reached { (prior + 1).min(last) } else { prior }
}

/// Whether `position` lies farther than `threshold_m` from the route path.
///
/// Distance is measured to segment midpoints (see
/// [`approx_distance_to_polyline_m`]), so long straight segments can hide a
/// real deviation. Re-routing is advisory, which makes that acceptable.
pub fn has_deviated(position: &GeoPoint, path: &[GeoPoint], threshold_m: f64) -> bool {
    approx_distance_to_polyline_m(position, path).is_some_and(|distance| distance > threshold_m)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerPhase {
    NoRoute,
    Tracking,
    Deviated,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerUpdate {
    pub step_index: usize,
    pub advanced: bool,
    pub deviated: bool,
    pub arrived: bool,
}

/// Per-session view of progress along the active route.
#[derive(Debug)]
pub struct RouteTracker {
    config: TrackerConfig,
    route: Option<Route>,
    path: Vec<GeoPoint>,
    step_index: usize,
    phase: TrackerPhase,
    deviation_suspended: bool,
}

impl RouteTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            route: None,
            path: Vec::new(),
            step_index: 0,
            phase: TrackerPhase::NoRoute,
            deviation_suspended: false,
        }
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    pub fn is_deviation_suspended(&self) -> bool {
        self.deviation_suspended
    }

    /// Starts tracking `route` from `step_index`, dropping all progress on the
    /// previous route. Lifts any deviation suspension.
    pub fn set_route(&mut self, route: Route, step_index: usize) -> Result<(), AppError> {
        let path = route.path()?;
        self.step_index = step_index.min(route.last_step_index());
        self.path = path;
        self.route = Some(route);
        self.phase = TrackerPhase::Tracking;
        self.deviation_suspended = false;
        debug!(step_index = self.step_index, "tracking new route");
        Ok(())
    }

    pub fn clear(&mut self) {
        self.route = None;
        self.path.clear();
        self.step_index = 0;
        self.phase = TrackerPhase::NoRoute;
        self.deviation_suspended = false;
    }

    /// Stops reporting deviation until a new route is set. Used after the
    /// routing provider failed, so the old route keeps being tracked without
    /// triggering another request on every fix.
    pub fn suspend_deviation(&mut self) {
        if self.route.is_some() {
            warn!("deviation detection suspended until a new route is available");
            self.deviation_suspended = true;
            if self.phase == TrackerPhase::Deviated {
                self.phase = TrackerPhase::Tracking;
            }
        }
    }

    /// Adopts a step index observed elsewhere (the counterpart's published
    /// progress) without ever moving backwards.
    pub fn sync_step_index(&mut self, step_index: usize) {
        if let Some(route) = &self.route {
            self.step_index = self.step_index.max(step_index.min(route.last_step_index()));
        }
    }

    pub fn has_deviated(&self, position: &GeoPoint) -> bool {
        if self.deviation_suspended || self.route.is_none() {
            return false;
        }
        has_deviated(position, &self.path, self.config.deviation_threshold_m)
    }

    pub fn update(&mut self, position: &GeoPoint) -> TrackerUpdate {
        let Some(route) = &self.route else {
            return TrackerUpdate {
                step_index: 0,
                advanced: false,
                deviated: false,
                arrived: false,
            };
        };

        if self.phase == TrackerPhase::Completed {
            return TrackerUpdate {
                step_index: self.step_index,
                advanced: false,
                deviated: false,
                arrived: false,
            };
        }

        let next_index = current_step_index(
            route,
            position,
            self.step_index,
            self.config.step_proximity_m,
        );
        let advanced = next_index > self.step_index;
        let arrived = next_index == route.last_step_index()
            && haversine_m(position, &route.destination) <= self.config.step_proximity_m;
        self.step_index = next_index;

        if arrived {
            self.phase = TrackerPhase::Completed;
            return TrackerUpdate {
                step_index: next_index,
                advanced,
                deviated: false,
                arrived: true,
            };
        }

        let deviated = self.has_deviated(position);
        self.phase = if deviated {
            TrackerPhase::Deviated
        } else {
            TrackerPhase::Tracking
        };

        TrackerUpdate {
            step_index: next_index,
            advanced,
            deviated,
            arrived: false,
        }
    }
}
