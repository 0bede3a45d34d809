// =============================================================================
// Scheduler — cadence-aligned periodic jobs with overlap skip
// =============================================================================
//
// Jobs fire on wall-clock boundaries (top of second / minute / hour) or on a
// fixed period.  A job that is still running when its next slot arrives is
// skipped for that slot, never queued, so a slow REST call cannot pile up a
// backlog of itself.  Panics inside a job are caught and logged; the
// scheduler and every other job keep running.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::timing::TaskTimings;

/// Scheduler wake-up granularity.
const TICK: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Cadence
// ---------------------------------------------------------------------------

/// When a job fires.  The clock-aligned variants fire on UTC boundaries so
/// repeated runs line up with exchange minute/hour windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Secondly,
    Minutely,
    Hourly,
    Every(Duration),
}

impl Cadence {
    /// The first fire time strictly after `now`.
    pub fn next_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Cadence::Secondly => align(now, TimeDelta::seconds(1)),
            Cadence::Minutely => align(now, TimeDelta::minutes(1)),
            Cadence::Hourly => align(now, TimeDelta::hours(1)),
            Cadence::Every(period) => {
                let delta = TimeDelta::from_std(*period).unwrap_or(TimeDelta::seconds(1));
                now + delta
            }
        }
    }
}

fn align(now: DateTime<Utc>, step: TimeDelta) -> DateTime<Utc> {
    // Truncate to the current boundary, then step once past `now`.
    let floor = now.duration_trunc(step).unwrap_or(now);
    floor + step
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct ScheduledJob {
    name: String,
    cadence: Cadence,
    next_fire: RwLock<DateTime<Utc>>,
    running: Arc<AtomicBool>,
    task: JobFn,
}

impl ScheduledJob {
    /// Claim the job for one run.  Returns `false` when a previous run is
    /// still in flight.
    fn try_begin(&self) -> bool {
        !self.running.swap(true, Ordering::AcqRel)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    jobs: RwLock<Vec<Arc<ScheduledJob>>>,
    timings: Arc<TaskTimings>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(timings: Arc<TaskTimings>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: RwLock::new(Vec::new()),
            timings,
            shutdown,
        }
    }

    /// Register a job.  The closure is called once per fire and must return a
    /// fresh future each time.
    pub fn add_job<F, Fut>(&self, name: &str, cadence: Cadence, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = Arc::new(ScheduledJob {
            name: name.to_string(),
            cadence,
            next_fire: RwLock::new(cadence.next_fire(Utc::now())),
            running: Arc::new(AtomicBool::new(false)),
            task: Arc::new(move || task().boxed()),
        });
        info!(job = %job.name, cadence = ?cadence, "job registered");
        self.jobs.write().push(job);
    }

    /// Drive the schedule until shutdown is requested.
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = scheduler.shutdown.subscribe();
            loop {
                // Covers a shutdown requested before this loop subscribed.
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(TICK) => {}
                    _ = shutdown_rx.changed() => break,
                }
                scheduler.fire_due_jobs();
            }
            debug!("scheduler loop stopped");
        })
    }

    fn fire_due_jobs(&self) {
        let now = Utc::now();
        let jobs = self.jobs.read().clone();
        for job in jobs {
            {
                let next = *job.next_fire.read();
                if now < next {
                    continue;
                }
            }
            *job.next_fire.write() = job.cadence.next_fire(now);

            if !job.try_begin() {
                debug!(job = %job.name, "previous run still in flight, skipping slot");
                continue;
            }

            let timings = self.timings.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = std::panic::AssertUnwindSafe((job.task)())
                    .catch_unwind()
                    .await;
                let elapsed = started.elapsed().as_secs_f64();
                timings.record(&job.name, elapsed);

                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(job = %job.name, error = %e, "job failed"),
                    Err(_) => error!(job = %job.name, "job panicked"),
                }
                job.running.store(false, Ordering::Release);
            });
        }
    }

    /// Stop firing new runs, then wait up to `grace` for in-flight runs to
    /// finish.  Returns `true` when everything drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        // send_replace updates the value even with no receiver alive, so a
        // shutdown requested before run() is never lost.
        self.shutdown.send_replace(true);
        let deadline = Instant::now() + grace;
        loop {
            let busy: Vec<String> = {
                let jobs = self.jobs.read();
                jobs.iter()
                    .filter(|j| j.running.load(Ordering::Acquire))
                    .map(|j| j.name.clone())
                    .collect()
            };
            if busy.is_empty() {
                info!("scheduler drained");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(jobs = ?busy, "grace period elapsed with jobs still running");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
