//! Startup sequence and process lifetime
//!
//! ```text
//! config ─► SessionStartup (last will) ─► wait_until_reachable ─► connect ─► start loop
//!        ─► dispatcher subscriptions ─► startup burst ─► scheduler jobs + heartbeat
//!        ─► ... until shutdown ─► stop jobs ─► offline + disconnect
//! ```
//!
//! The order is fixed: nothing is subscribed or published before the broker
//! accepted the connection, and the scheduler owns the process lifetime once
//! it is running.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::dispatcher::{DispatchStats, EventDispatcher};
use crate::feed::{FeedOutcome, SensorFeed};
use crate::mqtt::session::{Disconnected, SessionStartup, SessionStats};
use crate::mqtt::{BrokerSession, BrokerTransport, Reachability, SessionError, Topics};
use crate::scheduler::{IntervalScheduler, JobError, JobReport};
use crate::sensor::{SensorEntry, SensorKind};

const TRANSITION_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("shutdown requested before the broker session was up")]
    Cancelled,
}

/// What the agent did between startup and shutdown
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub burst_published: usize,
    pub jobs: Vec<JobReport>,
    pub dispatch: DispatchStats,
    pub session: SessionStats,
}

pub struct Orchestrator {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(config: AgentConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Runs the agent until `shutdown` is cancelled
    ///
    /// Only startup failures (unreachable broker, refused connect) are
    /// returned as errors; everything after the connect is contained.
    pub async fn run(
        self,
        transport: Box<dyn BrokerTransport>,
        probe: &dyn Reachability,
        sensors: Vec<SensorEntry>,
        shutdown: CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let topics = Topics::new(self.config.broker.topic_root.clone());
        let startup = SessionStartup::create(transport, self.config.endpoint(), topics);

        let session = tokio::select! {
            _ = shutdown.cancelled() => return Err(OrchestratorError::Cancelled),
            session = self.connect(startup, probe) => session?,
        };

        let (transitions_tx, transitions_rx) = mpsc::channel(TRANSITION_CAPACITY);
        let mut dispatcher = EventDispatcher::new();
        let mut feeds = Vec::with_capacity(sensors.len());

        for entry in &sensors {
            let feed = Arc::new(
                SensorFeed::new(
                    entry.adapter.clone(),
                    session.clone(),
                    self.clock.clone(),
                    self.config.broker.client_id.clone(),
                )
                .with_settle(entry.settle),
            );

            if let Some(source) = &entry.events {
                match source.on_transition(transitions_tx.clone()) {
                    Ok(()) => dispatcher.subscribe(entry.kind(), feed.clone()),
                    Err(e) => warn!("No transition events for {}: {}", entry.kind(), e),
                }
            }
            feeds.push((feed, entry.poll_interval));
        }
        drop(transitions_tx);

        let dispatcher_task = tokio::spawn(dispatcher.run_until_shutdown(transitions_rx, shutdown.clone()));

        let burst_published = self.startup_burst(&feeds).await;

        let mut scheduler = IntervalScheduler::create(shutdown.clone());
        for (feed, interval) in &feeds {
            let feed = feed.clone();
            scheduler = scheduler.add_job(feed.kind().to_string(), *interval, move || {
                let feed = feed.clone();
                async move {
                    feed.publish_current().await?;
                    Ok::<(), JobError>(())
                }
            });
        }
        let heartbeat_session = session.clone();
        scheduler = scheduler.add_job("heartbeat", self.config.heartbeat_interval(), move || {
            let session = heartbeat_session.clone();
            async move {
                session.announce_online().await?;
                Ok::<(), JobError>(())
            }
        });

        let jobs = scheduler.start().join().await;
        info!("Scheduler stopped");
        for job in &jobs {
            info!("Job {}: fired {} time(s), {} failed", job.name, job.fired, job.failed);
        }

        let dispatch = match dispatcher_task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Dispatcher task failed: {}", e);
                DispatchStats::default()
            }
        };
        info!(
            "Dispatcher handled {} transition(s), published {}",
            dispatch.received, dispatch.published
        );

        if let Err(e) = session.shutdown().await {
            warn!("Broker disconnect failed: {}", e);
        }

        Ok(RunReport {
            burst_published,
            jobs,
            dispatch,
            session: session.stats(),
        })
    }

    async fn connect(
        &self,
        startup: SessionStartup<Disconnected>,
        probe: &dyn Reachability,
    ) -> Result<Arc<BrokerSession>, SessionError> {
        let session = startup
            .wait_until_reachable(probe, self.config.retry_policy())
            .await?
            .connect()
            .await?
            .start()
            .await?;
        Ok(session)
    }

    /// Publishes every burst kind once, in burst order
    async fn startup_burst(&self, feeds: &[(Arc<SensorFeed>, Duration)]) -> usize {
        info!("Publishing startup readings");
        let mut published = 0;
        for kind in SensorKind::STARTUP_BURST {
            for (feed, _) in feeds.iter().filter(|(feed, _)| feed.kind() == kind) {
                match feed.publish_current().await {
                    Ok(FeedOutcome::Published(reading)) => {
                        published += 1;
                        debug!("Startup {} reading: {}", kind, reading.state_label());
                    }
                    Ok(outcome) => debug!("Startup {} reading skipped: {:?}", kind, outcome),
                    Err(e) => warn!("Startup {} reading failed: {}", kind, e),
                }
            }
        }
        published
    }
}
