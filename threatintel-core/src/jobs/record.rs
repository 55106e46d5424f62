use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FeedJobError, Result};

pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle states of a feed job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Creating,
    Available,
    CreateFailed,
    Deleting,
    Refreshing,
    RefreshFailed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Creating => "CREATING",
            JobState::Available => "AVAILABLE",
            JobState::CreateFailed => "CREATE_FAILED",
            JobState::Deleting => "DELETING",
            JobState::Refreshing => "REFRESHING",
            JobState::RefreshFailed => "REFRESH_FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

/// Interval consumed by the external trigger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub period: u64,
    pub unit: IntervalUnit,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
}

impl Schedule {
    pub fn new(period: u64, unit: IntervalUnit) -> Self {
        Self {
            period,
            unit,
            start_time: Utc::now(),
        }
    }

    pub fn days(period: u64) -> Self {
        Self::new(period, IntervalUnit::Days)
    }

    pub fn interval(&self) -> Duration {
        let period = self.period as i64;
        match self.unit {
            IntervalUnit::Minutes => Duration::minutes(period),
            IntervalUnit::Hours => Duration::hours(period),
            IntervalUnit::Days => Duration::days(period),
        }
    }

    pub fn same_interval(&self, other: &Schedule) -> bool {
        self.interval() == other.interval()
    }

    /// Feed refreshes are never scheduled more often than daily.
    pub fn validate(&self) -> Result<()> {
        if self.interval() < Duration::days(1) {
            return Err(FeedJobError::Validation(format!(
                "refresh interval must be at least 1 day, got {} {:?}",
                self.period, self.unit
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStats {
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_succeeded_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_failed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_skipped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_processing_time_in_millis: Option<u64>,
}

/// Persisted descriptor of one recurring feed-refresh job.
///
/// `indices` is ordered; the last entry is the generation currently served
/// for reads, anything before it is awaiting cleanup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub state: JobState,
    pub schedule: Schedule,
    pub update_enabled: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub enabled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub indices: Vec<String>,
    #[serde(default)]
    pub update_stats: UpdateStats,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update_time: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Header of the generation last loaded successfully.
    #[serde(default)]
    pub feed_fields: Vec<String>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl JobRecord {
    pub fn new(name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            state: JobState::Creating,
            schedule,
            update_enabled: false,
            enabled_time: None,
            indices: Vec::new(),
            update_stats: UpdateStats::default(),
            last_update_time: Utc::now(),
            schema_version: SCHEMA_VERSION,
            feed_fields: Vec::new(),
        }
    }

    pub fn current_index(&self) -> Option<&str> {
        self.indices.last().map(String::as_str)
    }

    /// Makes `index` the current generation, keeping the list duplicate-free.
    pub fn push_current_index(&mut self, index: &str) {
        self.indices.retain(|existing| existing != index);
        self.indices.push(index.to_string());
    }

    pub fn enable(&mut self) {
        if !self.update_enabled {
            self.update_enabled = true;
            self.enabled_time = Some(Utc::now());
        }
    }

    pub fn disable(&mut self) {
        self.update_enabled = false;
        self.enabled_time = None;
    }

    /// Replaces the schedule; the start time is reset only when the interval
    /// actually changes. Returns whether it changed.
    pub fn reschedule(&mut self, schedule: Schedule) -> bool {
        if self.schedule.same_interval(&schedule) {
            return false;
        }
        self.schedule = Schedule {
            start_time: Utc::now(),
            ..schedule
        };
        true
    }

    pub fn record_success(&mut self, processing_millis: u64) {
        self.update_stats.last_succeeded_at = Some(Utc::now());
        self.update_stats.last_processing_time_in_millis = Some(processing_millis);
    }

    pub fn record_failure(&mut self) {
        self.update_stats.last_failed_at = Some(Utc::now());
    }

    pub fn record_skip(&mut self) {
        self.update_stats.last_skipped_at = Some(Utc::now());
    }
}
