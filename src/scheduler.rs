//! Periodic jobs
//!
//! Every job gets its own tokio task and its own ticker, so a slow one-wire
//! read never delays the door or heartbeat jobs. Each firing runs in a spawned
//! task: an error or panic is logged and counted, and the next tick fires as
//! usual.
//!
//! # State Machine
//!
//! ```text
//! Registering ──start──► Running ──join──► [Vec<JobReport>]
//! ```

use futures::future::BoxFuture;
use statum::{machine, state};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::feed::FeedError;
use crate::mqtt::SessionError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type JobAction = Arc<dyn Fn() -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

#[derive(Clone)]
struct Job {
    name: String,
    interval: Duration,
    action: JobAction,
}

/// Firing statistics of one job, returned after shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub name: String,
    pub fired: u64,
    pub failed: u64,
}

#[state]
#[derive(Debug, Clone)]
pub enum SchedulerState {
    Registering,
    Running,
}

#[machine]
pub struct IntervalScheduler<S: SchedulerState> {
    jobs: Vec<Job>,
    handles: Vec<JoinHandle<JobReport>>,
    shutdown: CancellationToken,
}

impl<S: SchedulerState> IntervalScheduler<S> {
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

impl IntervalScheduler<Registering> {
    pub fn create(shutdown: CancellationToken) -> Self {
        Self::new(Vec::new(), Vec::new(), shutdown)
    }

    /// Registers a job; its first firing is one full interval after `start`
    pub fn add_job<F, Fut>(mut self, name: impl Into<String>, interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let name = name.into();
        let action: JobAction =
            Arc::new(move || -> BoxFuture<'static, Result<(), JobError>> { Box::pin(action()) });
        debug!("Registered job {} every {:?}", name, interval);
        self.jobs.push(Job {
            name,
            interval,
            action,
        });
        self
    }

    pub fn start(mut self) -> IntervalScheduler<Running> {
        info!("Starting {} scheduled job(s)", self.jobs.len());
        let start = Instant::now();
        self.handles = self
            .jobs
            .iter()
            .cloned()
            .map(|job| tokio::spawn(run_job(job, start, self.shutdown.clone())))
            .collect();
        self.transition()
    }
}

impl IntervalScheduler<Running> {
    /// Waits for shutdown and collects every job's report
    pub async fn join(self) -> Vec<JobReport> {
        self.shutdown.cancelled().await;

        let mut reports = Vec::with_capacity(self.handles.len());
        for (job, handle) in self.jobs.iter().zip(self.handles) {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("Job task {} ended abnormally: {}", job.name, e);
                    reports.push(JobReport {
                        name: job.name.clone(),
                        fired: 0,
                        failed: 0,
                    });
                }
            }
        }
        reports
    }
}

async fn run_job(job: Job, start: Instant, shutdown: CancellationToken) -> JobReport {
    let mut ticker = interval_at(start + job.interval, job.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report = JobReport {
        name: job.name.clone(),
        fired: 0,
        failed: 0,
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                report.fired += 1;
                let action = job.action.clone();
                match tokio::spawn(async move { action().await }).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        report.failed += 1;
                        warn!("Job {} failed: {}", job.name, e);
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!("Job {} panicked: {}", job.name, e);
                    }
                }
            }
        }
    }

    debug!("Job {} stopped after {} firing(s)", job.name, report.fired);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{SensorError, SensorKind};
    use std::sync::Mutex;

    fn recorder(
        start: Instant,
        log: Arc<Mutex<Vec<u64>>>,
    ) -> impl Fn() -> BoxFuture<'static, Result<(), JobError>> + Send + Sync + 'static {
        move || {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(start.elapsed().as_secs());
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_fire_each_job_on_its_own_interval() {
        let start = Instant::now();
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let running = IntervalScheduler::create(shutdown.clone())
            .add_job("a", Duration::from_secs(30), recorder(start, a.clone()))
            .add_job("b", Duration::from_secs(8), recorder(start, b.clone()))
            .start();

        tokio::time::sleep(Duration::from_secs(70)).await;
        shutdown.cancel();
        let reports = running.join().await;

        assert_eq!(*a.lock().unwrap(), vec![30, 60]);
        assert_eq!(*b.lock().unwrap(), vec![8, 16, 24, 32, 40, 48, 56, 64]);
        assert_eq!(reports[0].fired, 2);
        assert_eq!(reports[1].fired, 8);
    }

    #[tokio::test(start_paused = true)]
    #[allow(unreachable_code)]
    async fn should_keep_running_when_a_job_fails_or_panics() {
        let start = Instant::now();
        let heartbeat = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let failing = || async {
            Err(JobError::Feed(FeedError::Sensor(SensorError::Transient {
                kind: SensorKind::Temperature,
                reason: "crc".to_string(),
            })))
        };
        let panicking = || async {
            panic!("sensor exploded");
            Ok(())
        };

        let running = IntervalScheduler::create(shutdown.clone())
            .add_job("temperature", Duration::from_secs(10), failing)
            .add_job("light", Duration::from_secs(10), panicking)
            .add_job("heartbeat", Duration::from_secs(10), recorder(start, heartbeat.clone()))
            .start();

        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown.cancel();
        let reports = running.join().await;

        assert_eq!(*heartbeat.lock().unwrap(), vec![10, 20, 30]);
        assert_eq!(
            reports[0],
            JobReport {
                name: "temperature".to_string(),
                fired: 3,
                failed: 3
            }
        );
        assert_eq!(reports[1].failed, 3);
        assert_eq!(reports[2].failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_fire_before_first_interval() {
        let start = Instant::now();
        let log = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();
        let running = IntervalScheduler::create(shutdown.clone())
            .add_job("slow", Duration::from_secs(60), recorder(start, log.clone()))
            .start();
        assert_eq!(running.job_count(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        shutdown.cancel();
        let reports = running.join().await;

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(reports[0].fired, 0);
    }
}
