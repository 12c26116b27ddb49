//! Sample-and-publish pipeline of one sensor
//!
//! A [`SensorFeed`] is the only path from an adapter to the broker. Scheduler
//! jobs and dispatcher subscriptions for the same sensor share one feed, so
//! its lock keeps their sample→publish sequences from interleaving.

use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::codec::{self, CodecError};
use crate::mqtt::{BrokerSession, Outbound, SessionError};
use crate::sensor::{Reading, SensorAdapter, SensorError, SensorKind};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Publish(#[from] SessionError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedOutcome {
    Published(Reading),
    /// Still inside the post-boot settle window
    Suppressed,
    /// The sensor reported itself permanently unavailable earlier
    Disabled,
}

pub struct SensorFeed {
    adapter: Arc<dyn SensorAdapter>,
    session: Arc<BrokerSession>,
    clock: Arc<dyn Clock>,
    client_id: String,
    topic: String,
    retain: bool,
    settle: Option<Duration>,
    last_time: Mutex<Option<DateTime<Local>>>,
    disabled: AtomicBool,
}

impl SensorFeed {
    pub fn new(
        adapter: Arc<dyn SensorAdapter>,
        session: Arc<BrokerSession>,
        clock: Arc<dyn Clock>,
        client_id: impl Into<String>,
    ) -> Self {
        let kind = adapter.kind();
        Self {
            topic: session.topics().for_kind(kind),
            retain: kind.retained(),
            adapter,
            session,
            clock,
            client_id: client_id.into(),
            settle: None,
            last_time: Mutex::new(None),
            disabled: AtomicBool::new(false),
        }
    }

    /// Suppress everything until the process has been up for longer than `settle`
    pub fn with_settle(mut self, settle: Option<Duration>) -> Self {
        self.settle = settle;
        self
    }

    pub fn kind(&self) -> SensorKind {
        self.adapter.kind()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn is_settled(&self) -> bool {
        match self.settle {
            Some(window) => self.clock.uptime() > window,
            None => true,
        }
    }

    /// Samples the sensor once and publishes the reading
    pub async fn publish_current(&self) -> Result<FeedOutcome, FeedError> {
        if self.is_disabled() {
            return Ok(FeedOutcome::Disabled);
        }
        if !self.is_settled() {
            debug!("{} inside settle window, suppressed", self.kind());
            return Ok(FeedOutcome::Suppressed);
        }

        let mut last_time = self.last_time.lock().await;

        let value = match self.adapter.sample().await {
            Ok(value) => value,
            Err(e) => {
                if e.is_permanent() && !self.disabled.swap(true, Ordering::Relaxed) {
                    warn!("{}; disabling its jobs", e);
                }
                return Err(e.into());
            }
        };

        let mut time = self.clock.wall();
        if let Some(previous) = *last_time {
            if time < previous {
                time = previous;
            }
        }
        *last_time = Some(time);

        let reading = Reading::new(self.kind(), value, self.clock.uptime(), time);
        let payload = codec::encode(&reading, &self.client_id)?;
        debug!(
            "{} {} at +{:.3}s -> {}",
            reading.kind(),
            reading.state_label(),
            reading.uptime().as_secs_f64(),
            String::from_utf8_lossy(&payload)
        );

        self.session
            .publish(Outbound::new(self.topic.clone(), payload).retained(self.retain))
            .await?;
        Ok(FeedOutcome::Published(reading))
    }
}
