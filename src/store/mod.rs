//! Trip persistence boundary.
//!
//! The store is the only shared mutable resource. Writers must present the
//! version they read; the store rejects the write with `Conflict` when the
//! record moved on in between. Subscribers observe the latest snapshot, not
//! every intermediate one.

mod memory;

pub use memory::InMemoryTripStore;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::error::AppError;
use crate::models::trip::{Trip, TripPatch};

#[async_trait]
pub trait TripStore: Send + Sync {
    async fn get(&self, trip_id: &str) -> Result<Trip, AppError>;

    /// Fails with `Conflict` if a trip with the same id already exists.
    async fn create(&self, trip: Trip) -> Result<Trip, AppError>;

    /// Merges `patch` into the trip if its version still equals
    /// `expected_version`, bumping the version on success.
    async fn update(
        &self,
        trip_id: &str,
        expected_version: u64,
        patch: TripPatch,
    ) -> Result<Trip, AppError>;

    async fn list(&self) -> Result<Vec<Trip>, AppError>;

    async fn subscribe(&self, trip_id: &str) -> Result<TripSubscription, AppError>;

    /// Releases a listener. Unknown or already released handles are ignored.
    fn unsubscribe(&self, handle: &SubscriptionHandle);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub trip_id: String,
    pub id: u64,
}

/// Receiving side of a trip subscription.
pub struct TripSubscription {
    handle: SubscriptionHandle,
    updates: watch::Receiver<Trip>,
}

impl TripSubscription {
    pub fn new(handle: SubscriptionHandle, updates: watch::Receiver<Trip>) -> Self {
        Self { handle, updates }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Snapshot as of the last observed change.
    pub fn current(&self) -> Trip {
        self.updates.borrow().clone()
    }

    /// Waits for the next change. Returns `None` once the listener has been
    /// released.
    pub async fn next(&mut self) -> Option<Trip> {
        self.updates.changed().await.ok()?;
        Some(self.updates.borrow_and_update().clone())
    }

    pub fn into_stream(self) -> (SubscriptionHandle, WatchStream<Trip>) {
        (self.handle, WatchStream::from_changes(self.updates))
    }
}
