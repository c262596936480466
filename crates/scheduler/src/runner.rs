use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use mobyclaw_channels::AdapterRegistry;
use mobyclaw_runtime::Orchestrator;

use crate::recurrence::compute_next;
use crate::store::{NewSchedule, Schedule, ScheduleStore};

/// Fixed fire-loop cadence.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(30);

/// Seam for running a schedule's `prompt` through the shared session, so the
/// fire loop is testable without an upstream.
#[async_trait]
pub trait PromptRunner: Send + Sync {
    async fn run_prompt(&self, channel_id: &str, prompt: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl PromptRunner for Orchestrator {
    async fn run_prompt(&self, channel_id: &str, prompt: &str) -> anyhow::Result<String> {
        self.send(channel_id, prompt).await.map_err(Into::into)
    }
}

/// The 30-second fire loop.  Every failure keeps the schedule pending so the
/// next tick retries; delivery is at-least-once.
pub struct SchedulerLoop {
    store: Arc<ScheduleStore>,
    registry: Arc<AdapterRegistry>,
    runner: Arc<dyn PromptRunner>,
    tick: Duration,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<ScheduleStore>,
        registry: Arc<AdapterRegistry>,
        runner: Arc<dyn PromptRunner>,
    ) -> Self {
        Self {
            store,
            registry,
            runner,
            tick: SCHEDULER_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(tick = ?self.tick, "scheduler loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {
                    self.fire_due(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Fire every due schedule once; returns how many were delivered.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let due = self.store.get_due(now);
        if due.is_empty() {
            return 0;
        }
        debug!(count = due.len(), "schedules due");

        let mut delivered = 0;
        for schedule in due {
            match self.fire_one(&schedule).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(id = %schedule.id, ?err, "schedule delivery failed — staying pending");
                }
            }
        }
        delivered
    }

    async fn fire_one(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let text = match &schedule.prompt {
            Some(prompt) => {
                let channel_id = format!("schedule:{}", schedule.id);
                match self.runner.run_prompt(&channel_id, prompt).await {
                    Ok(reply) if !reply.trim().is_empty() => reply,
                    Ok(_) => self.fallback_text(schedule)?,
                    Err(err) => {
                        warn!(id = %schedule.id, ?err, "prompt schedule failed — falling back");
                        self.fallback_text(schedule)?
                    }
                }
            }
            None => self.fallback_text(schedule)?,
        };

        self.registry
            .deliver(&schedule.channel, &text)
            .await
            .with_context(|| format!("deliver to {}", schedule.channel))?;

        self.store.mark_delivered(&schedule.id)?;
        info!(id = %schedule.id, channel = %schedule.channel, "schedule delivered");

        if let Some(rule) = &schedule.repeat {
            let next_due = compute_next(schedule.due, rule);
            let clone = self.store.create(NewSchedule {
                due: next_due,
                message: schedule.message.clone(),
                prompt: schedule.prompt.clone(),
                channel: schedule.channel.clone(),
                repeat: Some(rule.clone()),
            })?;
            info!(id = %clone.id, due = %clone.due, "recurring schedule cloned");
        }
        Ok(())
    }

    fn fallback_text(&self, schedule: &Schedule) -> anyhow::Result<String> {
        schedule
            .message
            .clone()
            .with_context(|| format!("schedule {} produced no deliverable text", schedule.id))
    }
}
