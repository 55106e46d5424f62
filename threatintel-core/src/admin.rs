//! User-initiated job operations. They share the scheduler's lease, so an
//! administrative call and a scheduled run never touch the same job at once.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{FeedJobError, Result};
use crate::feed::validate_header_superset;
use crate::jobs::{JobRecord, JobState, Schedule};
use crate::lock::{LockModel, LockRenewer, keep_alive};
use crate::rotation::{data_index_base, generation_names};
use crate::runner::{JobRunner, RunHandle};

/// Which jobs `get_jobs` returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobSelector {
    All,
    Names(Vec<String>),
}

/// Fields an update may change. Unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateJobRequest {
    pub schedule: Option<Schedule>,
    pub update_enabled: Option<bool>,
}

/// Job names double as index names and lease ids.
pub fn validate_job_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 127 {
        return Err(FeedJobError::Validation(format!(
            "job name must be 1-127 characters, got {}",
            name.len()
        )));
    }
    if name.starts_with(['-', '_', '.', '+']) {
        return Err(FeedJobError::Validation(format!(
            "job name {name:?} must not start with '-', '_', '.' or '+'"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')))
    {
        return Err(FeedJobError::Validation(format!(
            "job name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

impl JobRunner {
    /// Registers the job in `CREATING` and starts its first load in the
    /// background. The returned handle resolves once that load finished.
    pub async fn create_job(self: &Arc<Self>, name: &str, schedule: Schedule) -> Result<RunHandle> {
        validate_job_name(name)?;
        schedule.validate()?;
        if self.catalog.feed_for(name).await?.is_none() {
            return Err(FeedJobError::Validation(format!("no feed configured for job {name}")));
        }
        self.jobs.create_index_if_absent().await?;

        let lock = self.acquire_or_contend(name).await?;
        let mut record = JobRecord::new(name, schedule);
        if let Err(err) = self.jobs.put(&mut record).await {
            self.release_quietly(&lock).await;
            return Err(err);
        }
        info!(job = name, "job created");

        let renewer = LockRenewer::new(self.locks.clone(), lock);
        Ok(self.spawn_locked_rotation(record, renewer, JobState::CreateFailed))
    }

    pub async fn get_jobs(&self, selector: &JobSelector) -> Result<Vec<JobRecord>> {
        match selector {
            JobSelector::All => self.jobs.list().await,
            JobSelector::Names(names) => self.jobs.get_all(names).await,
        }
    }

    /// Changes the schedule and/or the auto-refresh flag of an available job.
    /// The feed's current header must still carry every recorded field.
    pub async fn update_job(&self, name: &str, request: UpdateJobRequest) -> Result<JobRecord> {
        if let Some(schedule) = &request.schedule {
            schedule.validate()?;
        }

        let lock = self.acquire_or_contend(name).await?;
        let renewer = LockRenewer::new(self.locks.clone(), lock);
        let result = keep_alive(&renewer, self.update_locked(name, request)).await;
        renewer.release().await;
        result
    }

    async fn update_locked(&self, name: &str, request: UpdateJobRequest) -> Result<JobRecord> {
        let mut record = self
            .jobs
            .get(name)
            .await?
            .ok_or_else(|| FeedJobError::NotFound(format!("job {name}")))?;
        if record.state != JobState::Available {
            return Err(FeedJobError::Validation(format!(
                "job {name} is {}, updates require AVAILABLE",
                record.state
            )));
        }

        let feed = self
            .catalog
            .feed_for(name)
            .await?
            .ok_or_else(|| FeedJobError::Validation(format!("no feed configured for job {name}")))?;
        let reader = self.rotation.fetcher().open(&feed).await?;
        validate_header_superset(&record.feed_fields, reader.fields())?;
        drop(reader);

        if let Some(schedule) = request.schedule
            && record.reschedule(schedule)
        {
            info!(job = name, period = record.schedule.period, unit = ?record.schedule.unit, "schedule changed");
        }
        match request.update_enabled {
            Some(true) => record.enable(),
            Some(false) => record.disable(),
            None => {}
        }
        self.jobs.update(&mut record).await?;
        Ok(record)
    }

    /// Removes all of the job's indices and then its record. If index removal
    /// fails the previous state is restored and the error returned.
    ///
    /// Both generation names are removed along with the recorded indices, so
    /// a generation abandoned by a failed refresh does not outlive the job.
    pub async fn delete_job(&self, name: &str) -> Result<()> {
        let lock = self.acquire_or_contend(name).await?;
        let renewer = LockRenewer::new(self.locks.clone(), lock);
        let result = keep_alive(&renewer, self.delete_locked(name)).await;
        renewer.release().await;
        result
    }

    async fn delete_locked(&self, name: &str) -> Result<()> {
        let mut record = self
            .jobs
            .get(name)
            .await?
            .ok_or_else(|| FeedJobError::NotFound(format!("job {name}")))?;
        let previous = record.state;
        record.state = JobState::Deleting;
        self.jobs.update(&mut record).await?;

        let indices = self.indices_to_delete(&record).await;
        if let Err(err) = self.rotation.delete_indices(&indices).await {
            warn!(job = name, %previous, "index removal failed; restoring job state");
            record.state = previous;
            if let Err(restore) = self.jobs.update(&mut record).await {
                warn!(job = name, "failed to restore job state: {restore}");
            }
            return Err(err);
        }

        self.jobs.delete(name).await?;
        info!(job = name, "job deleted");
        Ok(())
    }

    /// Recorded indices plus both generation names. Without a catalog entry
    /// the generations are derived as if the feed id matched the job name.
    async fn indices_to_delete(&self, record: &JobRecord) -> Vec<String> {
        let feed_id = match self.catalog.feed_for(&record.name).await {
            Ok(Some(feed)) => feed.feed_id,
            Ok(None) => record.name.clone(),
            Err(err) => {
                warn!(job = %record.name, "feed lookup failed; deleting recorded indices only: {err}");
                return record.indices.clone();
            }
        };
        let base = data_index_base(&self.config.rotation.data_index_prefix, &record.name, &feed_id);
        let mut indices = record.indices.clone();
        for generation in generation_names(&base) {
            if !indices.contains(&generation) {
                indices.push(generation);
            }
        }
        indices
    }

    /// Runs a rotation now, regardless of schedule or auto-refresh. This is
    /// how `REFRESH_FAILED` and `CREATE_FAILED` jobs are recovered.
    pub async fn refresh_job(self: &Arc<Self>, name: &str) -> Result<RunHandle> {
        let lock = self.acquire_or_contend(name).await?;
        let record = match self.jobs.get(name).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.release_quietly(&lock).await;
                return Err(FeedJobError::NotFound(format!("job {name}")));
            }
            Err(err) => {
                self.release_quietly(&lock).await;
                return Err(err);
            }
        };
        if record.state == JobState::Deleting {
            self.release_quietly(&lock).await;
            return Err(FeedJobError::Validation(format!("job {name} is being deleted")));
        }

        let failure_state = if record.current_index().is_some() {
            JobState::RefreshFailed
        } else {
            JobState::CreateFailed
        };
        info!(job = name, state = %record.state, "manual refresh requested");
        let renewer = LockRenewer::new(self.locks.clone(), lock);
        Ok(self.spawn_locked_rotation(record, renewer, failure_state))
    }

    async fn acquire_or_contend(&self, name: &str) -> Result<LockModel> {
        self.locks
            .acquire(name, self.config.lock.lock_duration_secs)
            .await?
            .ok_or_else(|| FeedJobError::Contention(format!("job {name} is locked")))
    }

    async fn release_quietly(&self, lock: &LockModel) {
        if let Err(err) = self.locks.release(lock).await {
            warn!(resource = %lock.resource, "lease release failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_must_be_index_safe() {
        validate_job_name("feed-x").unwrap();
        validate_job_name("abuse.ch_sslbl").unwrap();
        assert!(validate_job_name("").is_err());
        assert!(validate_job_name("Feed").is_err());
        assert!(validate_job_name("_hidden").is_err());
        assert!(validate_job_name("has space").is_err());
        assert!(validate_job_name(&"a".repeat(128)).is_err());
    }
}
