//! Routing collaborator.

use async_trait::async_trait;

use crate::error::AppError;
use crate::geo::{great_circle_path, haversine_m, polyline};
use crate::models::position::GeoPoint;
use crate::models::route::{Maneuver, Route, Step, TravelMode};

#[async_trait]
pub trait RouteProvider: Send + Sync {
    /// Plans a route; fails with `NoRoute` when the provider cannot.
    async fn route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
        mode: TravelMode,
    ) -> Result<Route, AppError>;
}

/// Spacing of the generated geometry. Deviation is measured to segment
/// midpoints, so this bounds how far an on-route position can read.
const VERTEX_SPACING_M: f64 = 10.0;
/// Past this, long legs get sparser geometry rather than huge polylines.
const MAX_SEGMENTS: usize = 10_000;

/// Great-circle route with a single step, used when no routing provider is
/// configured. Durations assume a constant speed.
#[derive(Debug, Clone)]
pub struct StraightLineRouter {
    speed_mps: f64,
}

impl StraightLineRouter {
    pub fn new(speed_kmh: f64) -> Self {
        Self {
            speed_mps: speed_kmh / 3.6,
        }
    }

    fn speed_for(&self, mode: TravelMode) -> f64 {
        match mode {
            TravelMode::Driving => self.speed_mps,
            TravelMode::Cycling => self.speed_mps.min(15.0 / 3.6),
            TravelMode::Walking => self.speed_mps.min(5.0 / 3.6),
        }
    }
}

impl Default for StraightLineRouter {
    fn default() -> Self {
        Self::new(30.0)
    }
}

#[async_trait]
impl RouteProvider for StraightLineRouter {
    async fn route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
        mode: TravelMode,
    ) -> Result<Route, AppError> {
        origin
            .validate()
            .and_then(|()| destination.validate())
            .map_err(|err| AppError::NoRoute(err.to_string()))?;

        let speed = self.speed_for(mode);
        if speed <= 0.0 {
            return Err(AppError::NoRoute(format!("no usable speed for {mode:?}")));
        }

        let distance_m = haversine_m(&origin, &destination);
        let duration_s = distance_m / speed;

        Ok(Route {
            polyline: polyline::encode(&great_circle_path(
                &origin,
                &destination,
                VERTEX_SPACING_M,
                MAX_SEGMENTS,
            )),
            steps: vec![Step {
                start: origin,
                end: destination,
                distance_m,
                duration_s,
                maneuver: Maneuver::Arrive,
                instruction: "Head to destination".to_string(),
            }],
            distance_m,
            duration_s,
            origin,
            destination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{RouteProvider, StraightLineRouter};
    use crate::engine::tracker::has_deviated;
    use crate::error::AppError;
    use crate::models::position::GeoPoint;
    use crate::models::route::TravelMode;

    #[tokio::test]
    async fn straight_line_route_is_a_single_step() {
        let router = StraightLineRouter::new(36.0);
        let origin = GeoPoint::new(0.0, 0.0);
        let destination = GeoPoint::new(0.0, 0.01);

        let route = router
            .route(origin, destination, TravelMode::Driving)
            .await
            .unwrap();

        assert_eq!(route.steps.len(), 1);
        assert!((route.distance_m - 1_112.0).abs() < 5.0);
        // 36 km/h is 10 m/s.
        assert!((route.duration_s - route.distance_m / 10.0).abs() < 1e-6);
        assert!(route.validate().is_ok());
    }

    #[tokio::test]
    async fn positions_on_the_line_do_not_read_as_deviated() {
        let router = StraightLineRouter::default();
        let origin = GeoPoint::new(0.0, 0.0);
        let destination = GeoPoint::new(0.0, 0.01);

        let route = router
            .route(origin, destination, TravelMode::Driving)
            .await
            .unwrap();
        let path = route.path().unwrap();
        assert!(path.len() > 100);

        // Every 20 m along the 1.1 km leg.
        for i in 0..=55 {
            let on_line = GeoPoint::new(0.0, i as f64 * 20.0 / 111_195.0);
            assert!(
                !has_deviated(&on_line, &path, 40.0),
                "{on_line:?} read as off route"
            );
        }
        assert!(has_deviated(&GeoPoint::new(0.001, 0.005), &path, 40.0));
    }

    #[tokio::test]
    async fn invalid_endpoints_yield_no_route() {
        let router = StraightLineRouter::default();
        let err = router
            .route(
                GeoPoint::new(95.0, 0.0),
                GeoPoint::new(0.0, 0.0),
                TravelMode::Walking,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NoRoute(_)));
    }
}
