//! Job lifecycle runner: the entry point the external scheduler calls on every
//! due tick, and the home of the administrative operations (see `admin`).
//!
//! Every run follows the same shape: take the job's lease, drive the state
//! machine, release the lease. Nothing that happens inside a scheduled run is
//! returned to the scheduler as an error; outcomes are recorded on the job
//! record and logged.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{FeedJobError, Result};
use crate::feed::{FeedCatalog, FeedFetcher};
use crate::jobs::{JobRecord, JobState, JobStore};
use crate::lock::{LockRenewer, LockService, keep_alive};
use crate::rotation::RotationEngine;
use crate::store::SearchStore;

/// Opaque handle the scheduler passes on each tick.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobParameterHandle {
    pub name: String,
}

impl JobParameterHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// What a single run did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// A new generation was swapped in.
    Refreshed { index: String },
    /// The job is available but auto-refresh is off.
    Skipped,
    /// Another node holds the lease; this tick is a no-op.
    Locked,
    /// A tick arrived while the job was not available; auto-refresh was
    /// turned off.
    Invalid(JobState),
    /// No record for the job name.
    Missing,
    /// The run failed; the failure is recorded on the job.
    Failed(String),
}

/// A run executing on the runtime.
#[derive(Debug)]
pub struct RunHandle {
    job: String,
    handle: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn job(&self) -> &str {
        &self.job
    }

    pub async fn wait(self) -> RunOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(job = %self.job, "feed job task aborted: {err}");
                RunOutcome::Failed(format!("task aborted: {err}"))
            }
        }
    }
}

pub struct JobRunner {
    pub(crate) config: EngineConfig,
    pub(crate) locks: LockService,
    pub(crate) jobs: JobStore,
    pub(crate) catalog: Arc<dyn FeedCatalog>,
    pub(crate) rotation: RotationEngine,
    permits: Arc<Semaphore>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .field("jobs", &self.jobs)
            .field("catalog", &self.catalog)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn SearchStore>,
        catalog: Arc<dyn FeedCatalog>,
        config: EngineConfig,
    ) -> Result<Self> {
        let fetcher = FeedFetcher::new(&config.fetch)?;
        Self::with_fetcher(store, catalog, fetcher, config)
    }

    pub fn with_fetcher(
        store: Arc<dyn SearchStore>,
        catalog: Arc<dyn FeedCatalog>,
        fetcher: FeedFetcher,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let locks = LockService::new(Arc::clone(&store), config.store.locks_index.clone(), config.lock);
        let jobs = JobStore::new(Arc::clone(&store), config.store.jobs_index.clone());
        let rotation = RotationEngine::new(store, jobs.clone(), fetcher, config.rotation.clone());
        let permits = Arc::new(Semaphore::new(config.runner.max_concurrent_runs));
        Ok(Self {
            config,
            locks,
            jobs,
            catalog,
            rotation,
            permits,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    /// Scheduler callback. Returns immediately; the run proceeds on a worker
    /// task once a permit is free.
    pub fn run_job(self: &Arc<Self>, handle: JobParameterHandle) -> RunHandle {
        let runner = Arc::clone(self);
        let span = info_span!("feed_job_run", job = %handle.name, run_id = %Uuid::now_v7());
        let job = handle.name.clone();
        let task = tokio::spawn(
            async move {
                let _permit = match Arc::clone(&runner.permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => return RunOutcome::Failed(format!("runner shut down: {err}")),
                };
                runner.run_scheduled(&handle.name).await
            }
            .instrument(span),
        );
        RunHandle { job, handle: task }
    }

    /// One scheduled tick, executed inline.
    pub async fn run_scheduled(&self, name: &str) -> RunOutcome {
        let lock = match self.locks.acquire(name, self.config.lock.lock_duration_secs).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!(job = name, "lease held by another node; skipping tick");
                return RunOutcome::Locked;
            }
            Err(err) => {
                error!(job = name, "failed to acquire lease: {err}");
                return RunOutcome::Failed(err.to_string());
            }
        };

        let renewer = LockRenewer::new(self.locks.clone(), lock);
        let outcome = self.scheduled_update(name, &renewer).await;
        renewer.release().await;
        outcome
    }

    async fn scheduled_update(&self, name: &str, renewer: &LockRenewer) -> RunOutcome {
        let mut record = match self.jobs.get(name).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(job = name, "scheduled tick for unknown job");
                return RunOutcome::Missing;
            }
            Err(err) => {
                error!(job = name, "failed to load job record: {err}");
                return RunOutcome::Failed(err.to_string());
            }
        };

        if record.state != JobState::Available {
            let state = record.state;
            warn!(job = name, %state, "scheduled tick in non-available state; disabling auto-refresh");
            record.disable();
            record.record_failure();
            self.persist_best_effort(&mut record).await;
            return RunOutcome::Invalid(state);
        }

        if !record.update_enabled {
            info!(job = name, "auto-refresh disabled; skipping tick");
            record.record_skip();
            self.persist_best_effort(&mut record).await;
            return RunOutcome::Skipped;
        }

        self.execute_rotation(record, renewer, JobState::RefreshFailed).await
    }

    /// Moves the job into its in-progress state, rotates, and records the
    /// outcome. `failure_state` is where the job lands if anything fails.
    pub(crate) async fn execute_rotation(
        &self,
        mut record: JobRecord,
        renewer: &LockRenewer,
        failure_state: JobState,
    ) -> RunOutcome {
        let in_progress = if record.current_index().is_some() {
            JobState::Refreshing
        } else {
            JobState::Creating
        };
        if record.state != in_progress {
            record.state = in_progress;
            if let Err(err) = self.jobs.update(&mut record).await {
                error!(job = %record.name, "failed to mark job {in_progress}: {err}");
                return RunOutcome::Failed(err.to_string());
            }
        }

        match self.rotate_record(&mut record, renewer).await {
            Ok(index) => RunOutcome::Refreshed { index },
            Err(err) => {
                error!(job = %record.name, state = %failure_state, "feed refresh failed: {err}");
                record.state = failure_state;
                record.record_failure();
                if failure_state == JobState::RefreshFailed {
                    record.disable();
                }
                self.persist_best_effort(&mut record).await;
                RunOutcome::Failed(err.to_string())
            }
        }
    }

    async fn rotate_record(&self, record: &mut JobRecord, renewer: &LockRenewer) -> Result<String> {
        let feed = self.catalog.feed_for(&record.name).await?.ok_or_else(|| {
            FeedJobError::NotFound(format!("no feed configured for job {}", record.name))
        })?;
        let report = self.rotation.rotate(record, &feed, renewer).await?;
        Ok(report.index)
    }

    async fn persist_best_effort(&self, record: &mut JobRecord) {
        if let Err(err) = self.jobs.update(record).await {
            error!(job = %record.name, "failed to persist job record: {err}");
        }
    }

    /// Runs `execute_rotation` for a lease the caller already holds, releasing
    /// it afterwards.
    pub(crate) fn spawn_locked_rotation(
        self: &Arc<Self>,
        record: JobRecord,
        renewer: LockRenewer,
        failure_state: JobState,
    ) -> RunHandle {
        let runner = Arc::clone(self);
        let job = record.name.clone();
        let span = info_span!("feed_job_run", job = %job, run_id = %Uuid::now_v7());
        let task = tokio::spawn(
            async move {
                let permit = keep_alive(&renewer, Arc::clone(&runner.permits).acquire_owned()).await;
                let outcome = match permit {
                    Ok(_permit) => runner.execute_rotation(record, &renewer, failure_state).await,
                    Err(err) => RunOutcome::Failed(format!("runner shut down: {err}")),
                };
                renewer.release().await;
                outcome
            }
            .instrument(span),
        );
        RunHandle { job, handle: task }
    }
}
