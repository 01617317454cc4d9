use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::geo::polyline;
use crate::models::position::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Maneuver {
    Depart,
    TurnLeft,
    TurnRight,
    Straight,
    Merge,
    Roundabout,
    UTurn,
    Arrive,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub start: GeoPoint,
    pub end: GeoPoint,
    pub distance_m: f64,
    pub duration_s: f64,
    pub maneuver: Maneuver,
    pub instruction: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    #[default]
    Driving,
    Walking,
    Cycling,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    /// Encoded polyline, precision 1e-5.
    pub polyline: String,
    pub steps: Vec<Step>,
    pub distance_m: f64,
    pub duration_s: f64,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
}

impl Route {
    pub fn last_step_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    /// Vertices the tracker measures deviation against. Falls back to the
    /// step endpoints when the route carries no polyline.
    pub fn path(&self) -> Result<Vec<GeoPoint>, AppError> {
        if !self.polyline.is_empty() {
            return polyline::decode(&self.polyline);
        }

        let mut points = Vec::with_capacity(self.steps.len() + 1);
        if let Some(first) = self.steps.first() {
            points.push(first.start);
        }
        points.extend(self.steps.iter().map(|step| step.end));
        Ok(points)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.steps.is_empty() {
            return Err(AppError::InvalidInput(
                "route must contain at least one step".to_string(),
            ));
        }

        self.origin.validate()?;
        self.destination.validate()?;
        for step in &self.steps {
            step.start.validate()?;
            step.end.validate()?;
        }

        let path = self.path()?;
        for point in &path {
            point.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Maneuver, Route, Step};
    use crate::error::AppError;
    use crate::models::position::GeoPoint;

    fn step(start: GeoPoint, end: GeoPoint) -> Step {
        Step {
            start,
            end,
            distance_m: 100.0,
            duration_s: 10.0,
            maneuver: Maneuver::Straight,
            instruction: "Continue".to_string(),
        }
    }

    #[test]
    fn path_falls_back_to_step_endpoints() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 0.001);
        let c = GeoPoint::new(0.0, 0.002);
        let route = Route {
            polyline: String::new(),
            steps: vec![step(a, b), step(b, c)],
            distance_m: 200.0,
            duration_s: 20.0,
            origin: a,
            destination: c,
        };

        assert_eq!(route.path().unwrap(), vec![a, b, c]);
        assert_eq!(route.last_step_index(), 1);
    }

    #[test]
    fn route_without_steps_is_rejected() {
        let route = Route {
            polyline: String::new(),
            steps: Vec::new(),
            distance_m: 0.0,
            duration_s: 0.0,
            origin: GeoPoint::new(0.0, 0.0),
            destination: GeoPoint::new(0.0, 0.0),
        };

        assert!(matches!(route.validate(), Err(AppError::InvalidInput(_))));
    }
}
