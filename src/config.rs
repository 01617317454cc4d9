use std::env;
use std::time::Duration;

use crate::engine::publisher::PublisherConfig;
use crate::engine::session::SessionConfig;
use crate::engine::tracker::TrackerConfig;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub publish_throttle_ms: u64,
    pub movement_threshold_m: f64,
    pub heading_threshold_deg: f64,
    pub heading_noise_floor_m: f64,
    pub fix_history_capacity: usize,
    pub step_proximity_m: f64,
    pub deviation_threshold_m: f64,
    pub sensor_timeout_ms: u64,
    pub route_speed_kmh: f64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            publish_throttle_ms: parse_or_default("PUBLISH_THROTTLE_MS", 1500)?,
            movement_threshold_m: parse_or_default("MOVEMENT_THRESHOLD_M", 8.0)?,
            heading_threshold_deg: parse_or_default("HEADING_THRESHOLD_DEG", 5.0)?,
            heading_noise_floor_m: parse_or_default("HEADING_NOISE_FLOOR_M", 10.0)?,
            fix_history_capacity: parse_or_default("FIX_HISTORY_CAPACITY", 5)?,
            step_proximity_m: parse_or_default("STEP_PROXIMITY_M", 30.0)?,
            deviation_threshold_m: parse_or_default("DEVIATION_THRESHOLD_M", 40.0)?,
            sensor_timeout_ms: parse_or_default("SENSOR_TIMEOUT_MS", 8000)?,
            route_speed_kmh: parse_or_default("ROUTE_SPEED_KMH", 30.0)?,
        };

        if config.fix_history_capacity < 2 {
            return Err(AppError::Internal(
                "invalid FIX_HISTORY_CAPACITY: heading estimation needs at least 2".to_string(),
            ));
        }
        if config.route_speed_kmh <= 0.0 {
            return Err(AppError::Internal(
                "invalid ROUTE_SPEED_KMH: must be > 0".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn publisher(&self) -> PublisherConfig {
        PublisherConfig {
            throttle: Duration::from_millis(self.publish_throttle_ms),
            movement_threshold_m: self.movement_threshold_m,
            heading_threshold_deg: self.heading_threshold_deg,
            heading_noise_floor_m: self.heading_noise_floor_m,
            history_capacity: self.fix_history_capacity,
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            step_proximity_m: self.step_proximity_m,
            deviation_threshold_m: self.deviation_threshold_m,
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            publisher: self.publisher(),
            tracker: self.tracker(),
            event_buffer_size: self.event_buffer_size,
            sensor_timeout: self.sensor_timeout(),
            ..SessionConfig::default()
        }
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_timeout_ms)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
