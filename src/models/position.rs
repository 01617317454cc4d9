use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::InvalidInput(format!(
                "latitude {} outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::InvalidInput(format!(
                "longitude {} outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }
}

/// A located sample, either a raw sensor fix or a published position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    /// Degrees clockwise from north.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Meters per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Accuracy radius in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    pub fn new(lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            lat,
            lng,
            heading: None,
            speed: None,
            accuracy: None,
            timestamp,
        }
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.point().validate()?;

        if let Some(heading) = self.heading {
            if !heading.is_finite() || !(0.0..=360.0).contains(&heading) {
                return Err(AppError::InvalidInput(format!(
                    "heading {heading} outside [0, 360]"
                )));
            }
        }
        if let Some(speed) = self.speed {
            if !speed.is_finite() || speed < 0.0 {
                return Err(AppError::InvalidInput(format!("speed {speed} is negative")));
            }
        }
        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(AppError::InvalidInput(format!(
                    "accuracy {accuracy} is negative"
                )));
            }
        }
        Ok(())
    }
}
