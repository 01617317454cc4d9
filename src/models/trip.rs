use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::position::{GeoPoint, Position};
use crate::models::route::Route;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Requested,
    Accepted,
    EnRouteToPickup,
    Arrived,
    InProgress,
    Completed,
    CanceledByRider,
    CanceledByDriver,
}

impl TripStatus {
    pub const ALL: [TripStatus; 8] = [
        TripStatus::Requested,
        TripStatus::Accepted,
        TripStatus::EnRouteToPickup,
        TripStatus::Arrived,
        TripStatus::InProgress,
        TripStatus::Completed,
        TripStatus::CanceledByRider,
        TripStatus::CanceledByDriver,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TripStatus::Completed | TripStatus::CanceledByRider | TripStatus::CanceledByDriver
        )
    }

    /// True once a driver has been assigned and the trip is still live.
    pub fn has_driver(self) -> bool {
        matches!(
            self,
            TripStatus::Accepted
                | TripStatus::EnRouteToPickup
                | TripStatus::Arrived
                | TripStatus::InProgress
                | TripStatus::Completed
        )
    }

    /// The role allowed to move a trip from `self` to `target`, or `None`
    /// when the edge is not in the table. `Requested -> Accepted` is only
    /// reachable through `accept` and is therefore absent here.
    pub fn authorized_role(self, target: TripStatus) -> Option<Role> {
        if self.is_terminal() {
            return None;
        }

        match (self, target) {
            (_, TripStatus::CanceledByRider) => Some(Role::Rider),
            (_, TripStatus::CanceledByDriver) => Some(Role::Driver),
            (TripStatus::Accepted, TripStatus::EnRouteToPickup)
            | (TripStatus::EnRouteToPickup, TripStatus::Arrived)
            | (TripStatus::Arrived, TripStatus::InProgress)
            | (TripStatus::InProgress, TripStatus::Completed) => Some(Role::Driver),
            _ => None,
        }
    }

    /// Which route the trip is currently following.
    pub fn active_slot(self) -> Option<RouteSlot> {
        match self {
            TripStatus::Accepted | TripStatus::EnRouteToPickup | TripStatus::Arrived => {
                Some(RouteSlot::Pickup)
            }
            TripStatus::InProgress => Some(RouteSlot::Destination),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TripStatus::Requested => "requested",
            TripStatus::Accepted => "accepted",
            TripStatus::EnRouteToPickup => "en_route_to_pickup",
            TripStatus::Arrived => "arrived",
            TripStatus::InProgress => "in_progress",
            TripStatus::Completed => "completed",
            TripStatus::CanceledByRider => "canceled_by_rider",
            TripStatus::CanceledByDriver => "canceled_by_driver",
        }
    }
}

impl std::fmt::Display for TripStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Rider,
    Driver,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteSlot {
    Pickup,
    Destination,
}

impl std::str::FromStr for RouteSlot {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pickup" => Ok(RouteSlot::Pickup),
            "destination" => Ok(RouteSlot::Destination),
            other => Err(format!(
                "unknown route slot: {other}, expected pickup/destination"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trip {
    pub id: String,
    pub status: TripStatus,
    pub rider_id: String,
    pub driver_id: Option<String>,
    pub origin: GeoPoint,
    pub destination: Option<GeoPoint>,
    pub pickup_route: Option<Route>,
    pub destination_route: Option<Route>,
    pub step_index: usize,
    pub driver_position: Option<Position>,
    pub rating: Option<u8>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    pub fn new(
        id: String,
        rider_id: String,
        origin: GeoPoint,
        destination: Option<GeoPoint>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TripStatus::Requested,
            rider_id,
            driver_id: None,
            origin,
            destination,
            pickup_route: None,
            destination_route: None,
            step_index: 0,
            driver_position: None,
            rating: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn role_of(&self, actor_id: &str) -> Option<Role> {
        if self.rider_id == actor_id {
            Some(Role::Rider)
        } else if self.driver_id.as_deref() == Some(actor_id) {
            Some(Role::Driver)
        } else {
            None
        }
    }

    pub fn route(&self, slot: RouteSlot) -> Option<&Route> {
        match slot {
            RouteSlot::Pickup => self.pickup_route.as_ref(),
            RouteSlot::Destination => self.destination_route.as_ref(),
        }
    }

    pub fn active_route(&self) -> Option<&Route> {
        self.status.active_slot().and_then(|slot| self.route(slot))
    }
}

/// Partial update of a trip. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripPatch {
    pub status: Option<TripStatus>,
    pub driver_id: Option<String>,
    pub pickup_route: Option<Route>,
    pub destination_route: Option<Route>,
    pub step_index: Option<usize>,
    pub driver_position: Option<Position>,
    pub rating: Option<u8>,
}

impl TripPatch {
    pub fn status(status: TripStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn route(slot: RouteSlot, route: Route) -> Self {
        let mut patch = Self {
            step_index: Some(0),
            ..Self::default()
        };
        match slot {
            RouteSlot::Pickup => patch.pickup_route = Some(route),
            RouteSlot::Destination => patch.destination_route = Some(route),
        }
        patch
    }

    pub fn apply(self, trip: &mut Trip) {
        if let Some(status) = self.status {
            trip.status = status;
        }
        if let Some(driver_id) = self.driver_id {
            trip.driver_id = Some(driver_id);
        }
        if let Some(route) = self.pickup_route {
            trip.pickup_route = Some(route);
        }
        if let Some(route) = self.destination_route {
            trip.destination_route = Some(route);
        }
        if let Some(step_index) = self.step_index {
            trip.step_index = step_index;
        }
        if let Some(position) = self.driver_position {
            trip.driver_position = Some(position);
        }
        if let Some(rating) = self.rating {
            trip.rating = Some(rating);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Role, RouteSlot, Trip, TripPatch, TripStatus};
    use crate::models::position::GeoPoint;

    fn trip() -> Trip {
        Trip::new(
            "trip-1".to_string(),
            "rider-1".to_string(),
            GeoPoint::new(52.52, 13.405),
            None,
        )
    }

    #[test]
    fn new_trip_starts_requested_at_version_one() {
        let trip = trip();
        assert_eq!(trip.status, TripStatus::Requested);
        assert_eq!(trip.version, 1);
        assert!(trip.driver_id.is_none());
        assert_eq!(trip.step_index, 0);
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in TripStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TripStatus::ALL {
                assert_eq!(from.authorized_role(to), None, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn forward_edges_belong_to_the_driver() {
        assert_eq!(
            TripStatus::Accepted.authorized_role(TripStatus::EnRouteToPickup),
            Some(Role::Driver)
        );
        assert_eq!(
            TripStatus::Requested.authorized_role(TripStatus::CanceledByRider),
            Some(Role::Rider)
        );
        assert_eq!(
            TripStatus::Requested.authorized_role(TripStatus::Accepted),
            None
        );
        assert_eq!(
            TripStatus::Accepted.authorized_role(TripStatus::Arrived),
            None
        );
    }

    #[test]
    fn patch_only_writes_present_fields() {
        let mut trip = trip();
        trip.step_index = 3;

        TripPatch::status(TripStatus::Accepted).apply(&mut trip);
        assert_eq!(trip.status, TripStatus::Accepted);
        assert_eq!(trip.step_index, 3);
        assert_eq!(trip.rider_id, "rider-1");
    }

    #[test]
    fn roles_resolve_from_ids() {
        let mut trip = trip();
        trip.driver_id = Some("driver-1".to_string());

        assert_eq!(trip.role_of("rider-1"), Some(Role::Rider));
        assert_eq!(trip.role_of("driver-1"), Some(Role::Driver));
        assert_eq!(trip.role_of("stranger"), None);
    }

    #[test]
    fn route_slot_parses_from_path_segment() {
        assert_eq!("pickup".parse::<RouteSlot>(), Ok(RouteSlot::Pickup));
        assert!("elsewhere".parse::<RouteSlot>().is_err());
    }
}
