use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use mobyclaw_config::persist::{atomic_write_json, load_json};

use crate::recurrence::RepeatRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Delivered,
    Cancelled,
}

/// A persisted future delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub due: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatRule>,
    /// `<platform>:<id>` delivery target.
    pub channel: String,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Input for `create`; the store assigns id, status, and timestamps.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub due: DateTime<Utc>,
    pub message: Option<String>,
    pub prompt: Option<String>,
    pub channel: String,
    pub repeat: Option<RepeatRule>,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule {0} not found")]
    NotFound(String),

    #[error("schedule {0} is not pending")]
    NotPending(String),

    #[error("{0}")]
    Invalid(String),
}

/// Owner of `schedules.json`.  Non-pending records are pruned at load; the
/// file only ever accumulates what still needs to fire.
pub struct ScheduleStore {
    path: PathBuf,
    inner: Mutex<Vec<Schedule>>,
}

impl ScheduleStore {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        let mut schedules = load_json::<Vec<Schedule>>(&path)
            .unwrap_or_else(|err| {
                warn!(?err, "schedule store unreadable — starting empty");
                None
            })
            .unwrap_or_default();

        let before = schedules.len();
        schedules.retain(|s| s.status == ScheduleStatus::Pending);
        if schedules.len() < before {
            info!(pruned = before - schedules.len(), "pruned non-pending schedules");
        }

        let store = Self {
            path,
            inner: Mutex::new(schedules),
        };
        store.persist();
        Ok(store)
    }

    pub fn create(&self, new: NewSchedule) -> Result<Schedule, ScheduleError> {
        if new.message.is_none() && new.prompt.is_none() {
            return Err(ScheduleError::Invalid(
                "one of message or prompt is required".into(),
            ));
        }
        if new.channel.trim().is_empty() {
            return Err(ScheduleError::Invalid("channel is required".into()));
        }

        let schedule = Schedule {
            id: generate_id(),
            due: new.due,
            message: new.message,
            prompt: new.prompt,
            repeat: new.repeat,
            channel: new.channel,
            status: ScheduleStatus::Pending,
            created_at: Utc::now(),
            delivered_at: None,
        };

        self.inner.lock().unwrap().push(schedule.clone());
        self.persist();
        info!(id = %schedule.id, due = %schedule.due, channel = %schedule.channel, "schedule created");
        Ok(schedule)
    }

    pub fn list(&self, status: Option<ScheduleStatus>) -> Vec<Schedule> {
        let schedules = self.inner.lock().unwrap();
        schedules
            .iter()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Schedule> {
        self.inner.lock().unwrap().iter().find(|s| s.id == id).cloned()
    }

    /// Cancel a schedule; only `pending` ones can be cancelled.
    pub fn cancel(&self, id: &str) -> Result<Schedule, ScheduleError> {
        let mut schedules = self.inner.lock().unwrap();
        let schedule = schedules
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        if schedule.status != ScheduleStatus::Pending {
            return Err(ScheduleError::NotPending(id.to_string()));
        }
        schedule.status = ScheduleStatus::Cancelled;
        let cancelled = schedule.clone();
        drop(schedules);
        self.persist();
        info!(id, "schedule cancelled");
        Ok(cancelled)
    }

    pub fn mark_delivered(&self, id: &str) -> Result<Schedule, ScheduleError> {
        let mut schedules = self.inner.lock().unwrap();
        let schedule = schedules
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        schedule.status = ScheduleStatus::Delivered;
        schedule.delivered_at = Some(Utc::now());
        let delivered = schedule.clone();
        drop(schedules);
        self.persist();
        Ok(delivered)
    }

    /// Pending schedules whose due time has arrived.
    pub fn get_due(&self, now: DateTime<Utc>) -> Vec<Schedule> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.status == ScheduleStatus::Pending && s.due <= now)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.status == ScheduleStatus::Pending)
            .count()
    }

    fn persist(&self) {
        let schedules = self.inner.lock().unwrap();
        if let Err(err) = atomic_write_json(&self.path, &*schedules) {
            warn!(?err, "failed to persist schedules");
        }
    }
}

fn generate_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("sch_{}", &hex[..12])
}
