use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{AppError, SensorError};
use crate::geo::{bearing_deg, haversine_m, heading_delta_deg};
use crate::models::position::Position;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Minimum spacing between two published fixes.
    pub throttle: Duration,
    /// Movement, in meters, that makes a fix worth publishing.
    pub movement_threshold_m: f64,
    /// Heading change, in degrees, that makes a fix worth publishing.
    pub heading_threshold_deg: f64,
    /// Raw fixes closer than this are too noisy to estimate a heading from.
    pub heading_noise_floor_m: f64,
    /// Raw fixes kept for heading estimation.
    pub history_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(1500),
            movement_threshold_m: 8.0,
            heading_threshold_deg: 5.0,
            heading_noise_floor_m: 10.0,
            history_capacity: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixDecision {
    Published,
    Throttled,
    Stale,
    Stationary,
}

impl FixDecision {
    pub fn as_label(self) -> &'static str {
        match self {
            FixDecision::Published => "published",
            FixDecision::Throttled => "throttled",
            FixDecision::Stale => "stale",
            FixDecision::Stationary => "stationary",
        }
    }
}

/// Reduces a dense, noisy fix stream to the fixes that materially change
/// what the counterpart sees.
///
/// The decision is a pure function of the publisher's own state: it never
/// transmits anything, the caller publishes whatever `on_raw_fix` returns.
#[derive(Debug)]
pub struct PositionPublisher {
    config: PublisherConfig,
    last_published: Option<Position>,
    history: VecDeque<Position>,
    last_decision: Option<FixDecision>,
}

impl PositionPublisher {
    pub fn new(config: PublisherConfig) -> Self {
        let capacity = config.history_capacity.max(2);
        Self {
            config,
            last_published: None,
            history: VecDeque::with_capacity(capacity),
            last_decision: None,
        }
    }

    pub fn last_published(&self) -> Option<&Position> {
        self.last_published.as_ref()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn last_decision(&self) -> Option<FixDecision> {
        self.last_decision
    }

    /// Returns the position to publish, or `None` to suppress the fix.
    pub fn on_raw_fix(&mut self, fix: Position) -> Result<Option<Position>, AppError> {
        fix.validate()?;

        let Some((last_at, last_point, last_heading)) = self
            .last_published
            .as_ref()
            .map(|last| (last.timestamp, last.point(), last.heading))
        else {
            self.remember(fix.clone());
            return Ok(self.publish(fix));
        };

        if fix.timestamp < last_at {
            debug!(
                fix_at = %fix.timestamp,
                last_at = %last_at,
                "fix older than last publication; ignoring"
            );
            self.last_decision = Some(FixDecision::Stale);
            return Ok(None);
        }

        self.remember(fix.clone());

        let elapsed = (fix.timestamp - last_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.config.throttle {
            self.last_decision = Some(FixDecision::Throttled);
            return Ok(None);
        }

        let moved_m = haversine_m(&last_point, &fix.point());
        let heading = fix.heading.or_else(|| self.estimated_heading());
        let turned = match (heading, last_heading) {
            (Some(current), Some(previous)) => {
                heading_delta_deg(current, previous) > self.config.heading_threshold_deg
            }
            _ => false,
        };

        if moved_m > self.config.movement_threshold_m || turned {
            let mut position = fix;
            position.heading = heading;
            return Ok(self.publish(position));
        }

        self.last_decision = Some(FixDecision::Stationary);
        Ok(None)
    }

    /// Converts a sensor failure for the caller. History is left untouched;
    /// whether to keep watching is the caller's decision.
    pub fn on_sensor_error(&self, err: SensorError) -> AppError {
        warn!(error = %err, "location sensor reported an error");
        err.into()
    }

    /// Forgets everything, as if no fix had ever been seen.
    pub fn reset(&mut self) {
        self.last_published = None;
        self.history.clear();
        self.last_decision = None;
    }

    fn publish(&mut self, position: Position) -> Option<Position> {
        self.last_published = Some(position.clone());
        self.last_decision = Some(FixDecision::Published);
        Some(position)
    }

    fn remember(&mut self, fix: Position) {
        let capacity = self.config.history_capacity.max(2);
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(fix);
    }

    /// Bearing between the two most recent raw fixes, if they are far enough
    /// apart to rise above sensor noise.
    fn estimated_heading(&self) -> Option<f64> {
        let mut recent = self.history.iter().rev();
        let newest = recent.next()?;
        let previous = recent.next()?;

        let (from, to) = (previous.point(), newest.point());
        if haversine_m(&from, &to) < self.config.heading_noise_floor_m {
            return None;
        }
        Some(bearing_deg(&from, &to))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    use super::{FixDecision, PositionPublisher, PublisherConfig};
    use crate::error::{AppError, SensorError};
    use crate::models::position::Position;

    // Roughly 1e-5 degrees of latitude per 1.11 m.
    const DEG_PER_M: f64 = 1.0 / 111_195.0;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn fix(north_m: f64, east_m: f64, at_ms: i64) -> Position {
        Position::new(
            52.0 + north_m * DEG_PER_M,
            13.0 + east_m * DEG_PER_M / 52.0_f64.to_radians().cos(),
            t0() + ChronoDuration::milliseconds(at_ms),
        )
    }

    fn publisher() -> PositionPublisher {
        PositionPublisher::new(PublisherConfig::default())
    }

    #[test]
    fn first_fix_is_always_published() {
        let mut publisher = publisher();
        let published = publisher.on_raw_fix(fix(0.0, 0.0, 0)).unwrap();

        assert!(published.is_some());
        assert_eq!(publisher.last_decision(), Some(FixDecision::Published));
    }

    #[test]
    fn close_fix_within_throttle_is_suppressed() {
        let mut publisher = publisher();
        assert!(publisher.on_raw_fix(fix(0.0, 0.0, 0)).unwrap().is_some());

        let second = publisher.on_raw_fix(fix(5.0, 0.0, 1_000)).unwrap();
        assert!(second.is_none());
        assert_eq!(publisher.last_decision(), Some(FixDecision::Throttled));
    }

    #[test]
    fn distant_fix_after_throttle_is_published() {
        let mut publisher = publisher();
        assert!(publisher.on_raw_fix(fix(0.0, 0.0, 0)).unwrap().is_some());

        let second = publisher.on_raw_fix(fix(50.0, 0.0, 2_000)).unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn throttle_applies_even_to_large_moves() {
        let mut publisher = publisher();
        publisher.on_raw_fix(fix(0.0, 0.0, 0)).unwrap();

        assert!(publisher.on_raw_fix(fix(500.0, 0.0, 1_499)).unwrap().is_none());
        assert!(publisher.on_raw_fix(fix(500.0, 0.0, 1_500)).unwrap().is_some());
    }

    #[test]
    fn small_move_without_turn_is_stationary() {
        let mut publisher = publisher();
        publisher
            .on_raw_fix(fix(0.0, 0.0, 0).with_heading(0.0))
            .unwrap();

        let second = publisher
            .on_raw_fix(fix(3.0, 0.0, 2_000).with_heading(2.0))
            .unwrap();
        assert!(second.is_none());
        assert_eq!(publisher.last_decision(), Some(FixDecision::Stationary));
    }

    #[test]
    fn heading_change_alone_triggers_publication() {
        let mut publisher = publisher();
        publisher
            .on_raw_fix(fix(0.0, 0.0, 0).with_heading(350.0))
            .unwrap();

        let turned = publisher
            .on_raw_fix(fix(2.0, 0.0, 2_000).with_heading(10.0))
            .unwrap();
        assert!(turned.is_some());
    }

    #[test]
    fn heading_is_estimated_from_history_when_missing() {
        let mut publisher = publisher();
        publisher
            .on_raw_fix(fix(0.0, 0.0, 0).with_heading(0.0))
            .unwrap();
        // Suppressed by the throttle, but remembered.
        assert!(publisher.on_raw_fix(fix(0.0, -20.0, 500)).unwrap().is_none());

        // Two fixes 20 m apart heading due east; the move from the last
        // published position is under 8 m but the heading swung by ~90 degrees.
        let published = publisher
            .on_raw_fix(fix(0.0, 0.0, 2_000))
            .unwrap()
            .expect("heading change publishes");
        let heading = published.heading.unwrap();
        assert!((heading - 90.0).abs() < 1.0, "heading {heading}");
    }

    #[test]
    fn noisy_history_does_not_produce_a_heading() {
        let mut publisher = publisher();
        publisher
            .on_raw_fix(fix(0.0, 0.0, 0).with_heading(0.0))
            .unwrap();
        publisher.on_raw_fix(fix(0.0, -3.0, 500)).unwrap();

        let next = publisher.on_raw_fix(fix(0.0, 0.0, 2_000)).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn never_publishes_an_older_fix() {
        let mut publisher = publisher();
        publisher.on_raw_fix(fix(0.0, 0.0, 10_000)).unwrap();

        let older = publisher.on_raw_fix(fix(500.0, 0.0, 5_000)).unwrap();
        assert!(older.is_none());
        assert_eq!(publisher.last_decision(), Some(FixDecision::Stale));
        assert_eq!(publisher.history_len(), 1);

        let mut last_at = publisher.last_published().unwrap().timestamp;
        for (i, offset) in [12_000, 11_000, 20_000, 15_000, 30_000].into_iter().enumerate() {
            let candidate = fix(100.0 * (i as f64 + 1.0), 0.0, offset);
            if let Some(published) = publisher.on_raw_fix(candidate).unwrap() {
                assert!(published.timestamp >= last_at);
                last_at = published.timestamp;
            }
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut publisher = PositionPublisher::new(PublisherConfig {
            history_capacity: 3,
            ..PublisherConfig::default()
        });
        for i in 0..10 {
            publisher.on_raw_fix(fix(0.0, i as f64, i * 100)).unwrap();
        }
        assert_eq!(publisher.history_len(), 3);
    }

    #[test]
    fn invalid_fix_is_rejected_without_state_change() {
        let mut publisher = publisher();
        let mut bad = fix(0.0, 0.0, 0);
        bad.lat = 123.0;

        assert!(matches!(
            publisher.on_raw_fix(bad),
            Err(AppError::InvalidInput(_))
        ));
        assert_eq!(publisher.history_len(), 0);
        assert!(publisher.last_published().is_none());
    }

    #[test]
    fn sensor_errors_leave_history_alone_and_reset_clears_it() {
        let mut publisher = publisher();
        publisher.on_raw_fix(fix(0.0, 0.0, 0)).unwrap();

        let err = publisher.on_sensor_error(SensorError::Unavailable);
        assert!(matches!(err, AppError::Unavailable(_)));
        assert_eq!(publisher.history_len(), 1);

        publisher.reset();
        assert_eq!(publisher.history_len(), 0);
        assert!(publisher.on_raw_fix(fix(0.0, 0.0, 100)).unwrap().is_some());
    }
}
