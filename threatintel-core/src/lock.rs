//! Cluster-wide job lease backed by a single versioned document per job.
//!
//! Mutual exclusion comes from conditional writes: a lease is taken by
//! creating the document, or by overwriting an expired one at the
//! version it was read at. Whoever loses the write race observes a conflict
//! and backs off. This is not linearizable under partitions; anything that
//! needs stronger guarantees can implement the same acquire/renew/release
//! surface over a consensus-backed key.

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::config::LockConfig;
use crate::error::Result;
use crate::store::{DocVersion, IndexSpec, SearchStore, StoreError, WriteCondition};

const MIN_HEARTBEAT_MILLIS: u64 = 50;

/// Handle to a held lease. The version is the token every renew/release
/// must present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockModel {
    pub resource: String,
    pub lock_time: DateTime<Utc>,
    pub lock_duration_secs: u64,
    version: DocVersion,
}

impl LockModel {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.lock_time + Duration::seconds(self.lock_duration_secs as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn version(&self) -> DocVersion {
        self.version
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockDocument {
    job_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    lock_time: DateTime<Utc>,
    lock_duration_seconds: u64,
}

impl LockDocument {
    fn blocks_acquire(&self, now: DateTime<Utc>) -> bool {
        now < self.lock_time + Duration::seconds(self.lock_duration_seconds as i64)
    }
}

#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn SearchStore>,
    index: String,
    renew_after: Duration,
    index_ready: Arc<OnceCell<()>>,
}

impl fmt::Debug for LockService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockService")
            .field("index", &self.index)
            .field("renew_after", &self.renew_after)
            .field("index_ready", &self.index_ready.initialized())
            .finish()
    }
}

impl LockService {
    pub fn new(store: Arc<dyn SearchStore>, index: impl Into<String>, config: LockConfig) -> Self {
        Self {
            store,
            index: index.into(),
            renew_after: Duration::seconds(config.renew_after_secs as i64),
            index_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_index(&self) -> Result<()> {
        self.index_ready
            .get_or_try_init(|| async {
                let spec = IndexSpec::system(json!({
                    "properties": {
                        "job_id": { "type": "keyword" },
                        "lock_time": { "type": "date", "format": "epoch_millis" },
                        "lock_duration_seconds": { "type": "long" },
                    }
                }));
                match self.store.create_index(&self.index, &spec).await {
                    Ok(()) | Err(StoreError::AlreadyExists(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            })
            .await?;
        Ok(())
    }

    /// Takes the lease on `resource`, or returns `None` while another holder's
    /// lease is live.
    pub async fn acquire(&self, resource: &str, duration_secs: u64) -> Result<Option<LockModel>> {
        self.ensure_index().await?;
        let now = Utc::now();
        let existing = self.store.get_document(&self.index, resource).await?;

        let condition = match &existing {
            None => WriteCondition::Create,
            Some(doc) => {
                let current: LockDocument = serde_json::from_value(doc.source.clone())?;
                if current.blocks_acquire(now) {
                    trace!(resource, holder_since = %current.lock_time, "lease held elsewhere");
                    return Ok(None);
                }
                WriteCondition::IfVersion(doc.version)
            }
        };

        let lock_doc = LockDocument {
            job_id: resource.to_string(),
            lock_time: now,
            lock_duration_seconds: duration_secs,
        };
        match self
            .store
            .put_document(&self.index, resource, serde_json::to_value(&lock_doc)?, condition)
            .await
        {
            Ok(version) => {
                debug!(resource, duration_secs, %version, "lease acquired");
                Ok(Some(LockModel {
                    resource: resource.to_string(),
                    lock_time: now,
                    lock_duration_secs: duration_secs,
                    version,
                }))
            }
            Err(StoreError::AlreadyExists(_)) | Err(StoreError::VersionConflict { .. }) => {
                trace!(resource, "lost lease acquisition race");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Extends the lease. Returns the input unchanged while the lease is
    /// younger than the renewal threshold, or when another holder has since
    /// taken over (the caller keeps going on a best-effort basis).
    pub async fn renew(&self, lock: &LockModel) -> Result<LockModel> {
        let now = Utc::now();
        if now < lock.lock_time + self.renew_after {
            return Ok(lock.clone());
        }

        let lock_doc = LockDocument {
            job_id: lock.resource.clone(),
            lock_time: now,
            lock_duration_seconds: lock.lock_duration_secs,
        };
        match self
            .store
            .put_document(
                &self.index,
                &lock.resource,
                serde_json::to_value(&lock_doc)?,
                WriteCondition::IfVersion(lock.version),
            )
            .await
        {
            Ok(version) => {
                trace!(resource = %lock.resource, %version, "lease renewed");
                Ok(LockModel {
                    resource: lock.resource.clone(),
                    lock_time: now,
                    lock_duration_secs: lock.lock_duration_secs,
                    version,
                })
            }
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::DocumentNotFound { .. }) => {
                warn!(resource = %lock.resource, "lease lost before renewal; continuing best-effort");
                Ok(lock.clone())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drops the lease if `lock` still holds it. Safe to call repeatedly and
    /// after expiry.
    pub async fn release(&self, lock: &LockModel) -> Result<()> {
        match self
            .store
            .delete_document(&self.index, &lock.resource, Some(lock.version))
            .await
        {
            Ok(()) => {
                debug!(resource = %lock.resource, "lease released");
                Ok(())
            }
            Err(StoreError::DocumentNotFound { .. })
            | Err(StoreError::VersionConflict { .. })
            | Err(StoreError::IndexNotFound(_)) => {
                trace!(resource = %lock.resource, "lease already released or taken over");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Callback the rotation engine invokes throughout long-running steps so the
/// lease does not lapse mid-operation.
#[async_trait]
pub trait RenewLock: Send + Sync {
    async fn renew_lock(&self);

    /// How often [`keep_alive`] invokes [`RenewLock::renew_lock`].
    fn heartbeat_interval(&self) -> StdDuration;
}

/// Drives `work` to completion while renewing the lease on a timer, so a
/// single slow step (a stalled download, a long force-merge) cannot outlive
/// the lease. `work` must not call `renew_lock` itself.
pub async fn keep_alive<F>(renew: &dyn RenewLock, work: F) -> F::Output
where
    F: Future,
{
    let mut work = std::pin::pin!(work);
    let mut ticker = tokio::time::interval(renew.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick() => renew.renew_lock().await,
        }
    }
}

/// Keeps the most recent lease handle for one run and renews it on demand.
pub struct LockRenewer {
    service: LockService,
    lock: Mutex<LockModel>,
}

impl fmt::Debug for LockRenewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("LockRenewer");
        match self.lock.try_lock() {
            Ok(lock) => debug.field("resource", &lock.resource).field("expires_at", &lock.expires_at()),
            Err(_) => debug.field("lock", &"<locked>"),
        };
        debug.finish()
    }
}

impl LockRenewer {
    pub fn new(service: LockService, lock: LockModel) -> Self {
        Self {
            service,
            lock: Mutex::new(lock),
        }
    }

    pub async fn current(&self) -> LockModel {
        self.lock.lock().await.clone()
    }

    /// Releases whichever lease handle is current; errors are logged, never raised.
    pub async fn release(&self) {
        let lock = self.current().await;
        if let Err(err) = self.service.release(&lock).await {
            warn!(resource = %lock.resource, "lease release failed: {err}");
        }
    }
}

#[async_trait]
impl RenewLock for LockRenewer {
    async fn renew_lock(&self) {
        let mut guard = self.lock.lock().await;
        match self.service.renew(&guard).await {
            Ok(renewed) => *guard = renewed,
            Err(err) => warn!(resource = %guard.resource, "lease renew failed: {err}"),
        }
    }

    /// Half the renewal threshold: the lease is rewritten at most
    /// 1.5 × `renew_after` after its last write, well inside its duration.
    fn heartbeat_interval(&self) -> StdDuration {
        let half = (self.service.renew_after.num_milliseconds().max(0) / 2) as u64;
        StdDuration::from_millis(half.max(MIN_HEARTBEAT_MILLIS))
    }
}
