//! Edge-triggered publishing
//!
//! Adapters push [`Transition`]s into one channel from their own notification
//! context; the dispatcher drains it on a single task and turns every
//! transition into one publish per subscribed feed.
//!
//! ```text
//! DoorContact ─┐
//! Motion A/B  ─┼─► mpsc<Transition> ──► EventDispatcher ──► SensorFeed ──► BrokerSession
//! Light       ─┘                        (kind → feeds)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feed::{FeedOutcome, SensorFeed};
use crate::sensor::{SensorKind, Transition};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub published: u64,
    pub suppressed: u64,
    pub failed: u64,
}

#[derive(Default)]
pub struct EventDispatcher {
    subscriptions: HashMap<SensorKind, Vec<Arc<SensorFeed>>>,
    stats: DispatchStats,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: SensorKind, feed: Arc<SensorFeed>) {
        debug!("Subscribing {} feed to {} transitions", feed.topic(), kind);
        self.subscriptions.entry(kind).or_default().push(feed);
    }

    pub fn subscriber_count(&self, kind: SensorKind) -> usize {
        self.subscriptions.get(&kind).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Publishes the transition through every feed subscribed to its kind
    ///
    /// Returns the number of readings that reached the broker.
    pub async fn dispatch(&mut self, transition: Transition) -> usize {
        self.stats.received += 1;
        let Some(feeds) = self.subscriptions.get(&transition.kind) else {
            debug!("No subscription for {} transition", transition.kind);
            return 0;
        };

        let mut published = 0;
        for feed in feeds {
            match feed.publish_current().await {
                Ok(FeedOutcome::Published(reading)) => {
                    published += 1;
                    debug!(
                        "{} went {:?}, published {}",
                        transition.kind,
                        transition.state,
                        reading.state_label()
                    );
                }
                Ok(FeedOutcome::Suppressed) => {
                    self.stats.suppressed += 1;
                    debug!("{} transition inside settle window", transition.kind);
                }
                Ok(FeedOutcome::Disabled) => {}
                Err(e) => {
                    self.stats.failed += 1;
                    warn!("{} transition not published: {}", transition.kind, e);
                }
            }
        }
        self.stats.published += published as u64;
        published
    }

    /// Drains transitions until shutdown or until every source hung up
    pub async fn run_until_shutdown(
        mut self,
        mut transitions: mpsc::Receiver<Transition>,
        shutdown: CancellationToken,
    ) -> DispatchStats {
        info!(
            "Event dispatcher running for {} sensor kind(s)",
            self.subscriptions.len()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Event dispatcher shutting down");
                    break;
                }
                next = transitions.recv() => match next {
                    Some(transition) => {
                        self.dispatch(transition).await;
                    }
                    None => {
                        info!("All transition sources closed");
                        break;
                    }
                },
            }
        }
        self.stats
    }
}
