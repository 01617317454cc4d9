//! Location sensor collaborator.
//!
//! A sensor hands out watches: each watch is a channel of readings that stays
//! open until `stop` is called with its id. Stopping is synchronous and
//! idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::{AppError, SensorError};
use crate::models::position::Position;

pub type SensorReading = Result<Position, SensorError>;

pub struct SensorWatch {
    pub id: u64,
    pub readings: mpsc::Receiver<SensorReading>,
}

#[async_trait]
pub trait LocationSensor: Send + Sync {
    fn watch(&self) -> SensorWatch;

    fn stop(&self, watch_id: u64);

    /// One-shot fix, failing with `Timeout` after `timeout`.
    async fn get_once(&self, timeout: Duration) -> Result<Position, AppError> {
        let mut watch = self.watch();
        let outcome = tokio::time::timeout(timeout, watch.readings.recv()).await;
        self.stop(watch.id);

        match outcome {
            Err(_) => Err(AppError::Timeout(format!(
                "no location fix within {} ms",
                timeout.as_millis()
            ))),
            Ok(None) => Err(AppError::Unavailable("location sensor closed".to_string())),
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(Some(Ok(fix))) => {
                fix.validate()?;
                Ok(fix)
            }
        }
    }
}

/// Sensor fed by the host: device callbacks, an HTTP ingest or a test push
/// readings in, every open watch receives them in order.
pub struct ChannelSensor {
    watchers: DashMap<u64, mpsc::Sender<SensorReading>>,
    next_watch_id: AtomicU64,
    buffer: usize,
}

impl ChannelSensor {
    pub fn new(buffer: usize) -> Self {
        Self {
            watchers: DashMap::new(),
            next_watch_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Fans a reading out to every open watch; returns how many received it.
    /// A watch whose buffer is full drops the reading.
    pub fn push(&self, reading: SensorReading) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.watchers.iter() {
            match entry.value().try_send(reading.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(watch_id = *entry.key(), "sensor watch buffer full; dropping reading");
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        for id in closed {
            self.watchers.remove(&id);
        }

        delivered
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

impl Default for ChannelSensor {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl LocationSensor for ChannelSensor {
    fn watch(&self) -> SensorWatch {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.watchers.insert(id, tx);
        debug!(watch_id = id, "sensor watch started");

        SensorWatch { id, readings: rx }
    }

    fn stop(&self, watch_id: u64) {
        if self.watchers.remove(&watch_id).is_some() {
            debug!(watch_id, "sensor watch stopped");
        }
    }
}
