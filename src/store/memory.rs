use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::error::AppError;
use crate::models::trip::{Trip, TripPatch};
use crate::store::{SubscriptionHandle, TripStore, TripSubscription};

#[derive(Default)]
pub struct InMemoryTripStore {
    trips: DashMap<String, Trip>,
    listeners: DashMap<String, Vec<(u64, watch::Sender<Trip>)>>,
    next_listener_id: AtomicU64,
}

impl InMemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    pub fn listener_count(&self, trip_id: &str) -> usize {
        self.listeners
            .get(trip_id)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    fn notify(&self, trip: &Trip) {
        let Some(mut listeners) = self.listeners.get_mut(&trip.id) else {
            return;
        };

        listeners.retain(|(_, tx)| !tx.is_closed());
        for (_, tx) in listeners.iter() {
            // Two writers may notify out of order; never replace a newer snapshot.
            tx.send_if_modified(|current| {
                if trip.version > current.version {
                    *current = trip.clone();
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[async_trait]
impl TripStore for InMemoryTripStore {
    async fn get(&self, trip_id: &str) -> Result<Trip, AppError> {
        self.trips
            .get(trip_id)
            .map(|trip| trip.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("trip {trip_id} not found")))
    }

    async fn create(&self, trip: Trip) -> Result<Trip, AppError> {
        match self.trips.entry(trip.id.clone()) {
            Entry::Occupied(_) => Err(AppError::Conflict(format!(
                "trip {} already exists",
                trip.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(trip.clone());
                Ok(trip)
            }
        }
    }

    async fn update(
        &self,
        trip_id: &str,
        expected_version: u64,
        patch: TripPatch,
    ) -> Result<Trip, AppError> {
        let updated = {
            let mut trip = self
                .trips
                .get_mut(trip_id)
                .ok_or_else(|| AppError::NotFound(format!("trip {trip_id} not found")))?;

            if trip.version != expected_version {
                return Err(AppError::Conflict(format!(
                    "trip {trip_id} is at version {}, expected {expected_version}",
                    trip.version
                )));
            }

            patch.apply(&mut trip);
            trip.version += 1;
            trip.updated_at = Utc::now();
            trip.clone()
        };

        debug!(trip_id = %updated.id, version = updated.version, "trip updated");
        self.notify(&updated);
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<Trip>, AppError> {
        Ok(self.trips.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn subscribe(&self, trip_id: &str) -> Result<TripSubscription, AppError> {
        let trip = self
            .trips
            .get(trip_id)
            .ok_or_else(|| AppError::NotFound(format!("trip {trip_id} not found")))?;

        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(trip.value().clone());

        // Registered while the trip is read-locked so no update slips between
        // the initial snapshot and the first notification.
        self.listeners
            .entry(trip_id.to_string())
            .or_default()
            .push((id, tx));
        drop(trip);

        debug!(trip_id, listener = id, "trip subscription opened");
        Ok(TripSubscription::new(
            SubscriptionHandle {
                trip_id: trip_id.to_string(),
                id,
            },
            rx,
        ))
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut emptied = false;
        if let Some(mut listeners) = self.listeners.get_mut(&handle.trip_id) {
            let before = listeners.len();
            listeners.retain(|(id, _)| *id != handle.id);
            if listeners.len() != before {
                debug!(trip_id = %handle.trip_id, listener = handle.id, "trip subscription closed");
            }
            emptied = listeners.is_empty();
        }
        if emptied {
            self.listeners
                .remove_if(&handle.trip_id, |_, listeners| listeners.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::InMemoryTripStore;
    use crate::error::AppError;
    use crate::models::position::GeoPoint;
    use crate::models::trip::{Trip, TripPatch, TripStatus};
    use crate::store::TripStore;

    fn trip(id: &str) -> Trip {
        Trip::new(
            id.to_string(),
            "rider-1".to_string(),
            GeoPoint::new(52.52, 13.405),
            None,
        )
    }

    #[tokio::test]
    async fn update_bumps_version_and_merges_patch() {
        let store = InMemoryTripStore::new();
        store.create(trip("t1")).await.unwrap();

        let updated = store
            .update("t1", 1, TripPatch::status(TripStatus::Accepted))
            .await
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, TripStatus::Accepted);
        assert_eq!(updated.rider_id, "rider-1");
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let store = InMemoryTripStore::new();
        store.create(trip("t1")).await.unwrap();
        store
            .update("t1", 1, TripPatch::status(TripStatus::Accepted))
            .await
            .unwrap();

        let err = store
            .update("t1", 1, TripPatch::status(TripStatus::CanceledByRider))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.get("t1").await.unwrap().status, TripStatus::Accepted);
    }

    #[tokio::test]
    async fn duplicate_create_and_unknown_ids_are_rejected() {
        let store = InMemoryTripStore::new();
        store.create(trip("t1")).await.unwrap();

        assert!(matches!(
            store.create(trip("t1")).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(store.get("nope").await, Err(AppError::NotFound(_))));
        assert!(matches!(
            store.update("nope", 1, TripPatch::default()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_writers_at_same_version_have_one_winner() {
        let store = Arc::new(InMemoryTripStore::new());
        store.create(trip("t1")).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update("t1", 1, TripPatch::status(TripStatus::Accepted))
                    .await
            }));
        }

        let mut wins = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.get("t1").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn subscriber_observes_latest_snapshot() {
        let store = InMemoryTripStore::new();
        store.create(trip("t1")).await.unwrap();
        let mut subscription = store.subscribe("t1").await.unwrap();
        assert_eq!(subscription.current().version, 1);

        store
            .update("t1", 1, TripPatch::status(TripStatus::Accepted))
            .await
            .unwrap();
        store
            .update("t1", 2, TripPatch::status(TripStatus::CanceledByRider))
            .await
            .unwrap();

        let seen = subscription.next().await.unwrap();
        assert_eq!(seen.version, 3);
        assert_eq!(seen.status, TripStatus::CanceledByRider);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_ends_the_subscription() {
        let store = InMemoryTripStore::new();
        store.create(trip("t1")).await.unwrap();
        let mut subscription = store.subscribe("t1").await.unwrap();
        let handle = subscription.handle().clone();
        assert_eq!(store.listener_count("t1"), 1);

        store.unsubscribe(&handle);
        store.unsubscribe(&handle);

        assert_eq!(store.listener_count("t1"), 0);
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribing_to_unknown_trip_fails() {
        let store = InMemoryTripStore::new();
        assert!(matches!(
            store.subscribe("missing").await,
            Err(AppError::NotFound(_))
        ));
    }
}
