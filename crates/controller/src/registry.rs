//! Live schedule entries, one slot per job category.
//!
//! Every replace cancels the old handle(s) before installing the new ones, so
//! a category never has two generations registered at once. The pending
//! sprinkler turn-off is tracked here as well, so shutdown and relay
//! overrides can find and abort it.
//!
//! ```text
//! sprinkler:         Empty ──replace_all(times)──▶ Scheduled(N)   (N may be 0)
//! light start/end:   Unset ──replace(time)──▶ Scheduled
//! color / temp poll: installed once at startup
//! ```

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, warn};
use uuid::Uuid;

/// What the registry needs from a job scheduler.
pub trait JobHost: Send + Sync {
    fn add(&self, job: Job) -> impl Future<Output = Result<Uuid, JobSchedulerError>> + Send;
    fn remove(&self, id: &Uuid) -> impl Future<Output = Result<(), JobSchedulerError>> + Send;
}

impl JobHost for JobScheduler {
    fn add(&self, job: Job) -> impl Future<Output = Result<Uuid, JobSchedulerError>> + Send {
        JobScheduler::add(self, job)
    }

    fn remove(&self, id: &Uuid) -> impl Future<Output = Result<(), JobSchedulerError>> + Send {
        JobScheduler::remove(self, id)
    }
}

/// An activated sprinkler waiting for its deferred turn-off.
#[derive(Debug)]
pub struct PendingSprinklerCycle {
    pub cycle: u64,
    /// Duration captured when the cycle started.
    pub duration: Duration,
    pub armed_at: DateTime<Local>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingSnapshot {
    pub cycle: u64,
    pub duration_ms: u64,
    pub armed_at: DateTime<Local>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub sprinkler_jobs: Vec<Uuid>,
    pub light_start: Option<Uuid>,
    pub light_end: Option<Uuid>,
    pub color_update: Option<Uuid>,
    pub temperature_poll: Option<Uuid>,
    pub pending_turn_off: Option<PendingSnapshot>,
}

pub struct ScheduleRegistry<H: JobHost = JobScheduler> {
    host: H,
    sprinkler_jobs: Vec<Uuid>,
    light_start: Option<Uuid>,
    light_end: Option<Uuid>,
    color_update: Option<Uuid>,
    temperature_poll: Option<Uuid>,
    pending: Option<PendingSprinklerCycle>,
}

impl<H: JobHost> ScheduleRegistry<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            sprinkler_jobs: Vec::new(),
            light_start: None,
            light_end: None,
            color_update: None,
            temperature_poll: None,
            pending: None,
        }
    }

    async fn cancel(host: &H, id: Uuid) {
        if let Err(e) = host.remove(&id).await {
            warn!(job = %id, error = %e, "failed to cancel job");
        }
    }

    async fn replace_slot(
        host: &H,
        slot: &mut Option<Uuid>,
        job: Job,
    ) -> Result<Uuid, JobSchedulerError> {
        if let Some(old) = slot.take() {
            Self::cancel(host, old).await;
        }
        let id = host.add(job).await?;
        *slot = Some(id);
        Ok(id)
    }

    // -- sprinkler ----------------------------------------------------------

    /// Cancel every sprinkler job, then install `jobs`. An empty list leaves
    /// the category empty. If any add fails, the jobs installed by this call
    /// are cancelled again and the category is left empty.
    pub async fn replace_sprinkler_jobs(&mut self, jobs: Vec<Job>) -> Result<(), JobSchedulerError> {
        for id in std::mem::take(&mut self.sprinkler_jobs) {
            Self::cancel(&self.host, id).await;
        }
        for job in jobs {
            match self.host.add(job).await {
                Ok(id) => self.sprinkler_jobs.push(id),
                Err(e) => {
                    for id in std::mem::take(&mut self.sprinkler_jobs) {
                        Self::cancel(&self.host, id).await;
                    }
                    return Err(e);
                }
            }
        }
        debug!(count = self.sprinkler_jobs.len(), "sprinkler jobs installed");
        Ok(())
    }

    pub fn sprinkler_job_count(&self) -> usize {
        self.sprinkler_jobs.len()
    }

    // -- light window -------------------------------------------------------

    pub async fn replace_light_start(&mut self, job: Job) -> Result<Uuid, JobSchedulerError> {
        Self::replace_slot(&self.host, &mut self.light_start, job).await
    }

    pub async fn replace_light_end(&mut self, job: Job) -> Result<Uuid, JobSchedulerError> {
        Self::replace_slot(&self.host, &mut self.light_end, job).await
    }

    // -- periodic -----------------------------------------------------------

    pub async fn install_color_update(&mut self, job: Job) -> Result<Uuid, JobSchedulerError> {
        Self::replace_slot(&self.host, &mut self.color_update, job).await
    }

    pub async fn install_temperature_poll(&mut self, job: Job) -> Result<Uuid, JobSchedulerError> {
        Self::replace_slot(&self.host, &mut self.temperature_poll, job).await
    }

    // -- pending turn-off ---------------------------------------------------

    /// Track the turn-off timer for `cycle`. A still-armed timer from an
    /// earlier cycle is aborted; the newest cycle decides when the relay
    /// drops.
    pub fn arm_turn_off(&mut self, cycle: u64, duration: Duration, handle: JoinHandle<()>) {
        if let Some(prev) = self.pending.take() {
            debug!(cycle = prev.cycle, "superseded pending turn-off");
            prev.handle.abort();
        }
        self.pending = Some(PendingSprinklerCycle {
            cycle,
            duration,
            armed_at: Local::now(),
            handle,
        });
    }

    /// Called by the timer of `cycle` when it elapses. Returns false when the
    /// cycle is no longer the pending one.
    pub fn complete_turn_off(&mut self, cycle: u64) -> bool {
        match &self.pending {
            Some(p) if p.cycle == cycle => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Abort the pending turn-off, if any.
    pub fn abort_pending(&mut self) -> Option<u64> {
        self.pending.take().map(|p| {
            p.handle.abort();
            p.cycle
        })
    }

    pub fn pending(&self) -> Option<&PendingSprinklerCycle> {
        self.pending.as_ref()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            sprinkler_jobs: self.sprinkler_jobs.clone(),
            light_start: self.light_start,
            light_end: self.light_end,
            color_update: self.color_update,
            temperature_poll: self.temperature_poll,
            pending_turn_off: self.pending().map(|p| PendingSnapshot {
                cycle: p.cycle,
                duration_ms: p.duration.as_millis() as u64,
                armed_at: p.armed_at,
            }),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
