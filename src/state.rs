use std::sync::Arc;

use crate::engine::session::{SessionConfig, SessionContext};
use crate::engine::state_machine::TripStateMachine;
use crate::observability::metrics::Metrics;
use crate::routing::RouteProvider;
use crate::store::{InMemoryTripStore, TripStore};

pub struct AppState {
    pub store: Arc<InMemoryTripStore>,
    pub machine: Arc<TripStateMachine>,
    pub router: Arc<dyn RouteProvider>,
    pub session: SessionConfig,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(router: Arc<dyn RouteProvider>, session: SessionConfig) -> Self {
        let metrics = Metrics::new();
        let store = Arc::new(InMemoryTripStore::new());
        let machine = Arc::new(TripStateMachine::new(
            store.clone() as Arc<dyn TripStore>,
            metrics.clone(),
        ));

        Self {
            store,
            machine,
            router,
            session,
            metrics,
        }
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            machine: self.machine.clone(),
            router: self.router.clone(),
            metrics: self.metrics.clone(),
            config: self.session.clone(),
        }
    }
}
