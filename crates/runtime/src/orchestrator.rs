use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mobyclaw_config::{QueueMode, SessionConfig};
use mobyclaw_memory::{ContextOptimizer, DashboardClient, ShortTermMemory};
use mobyclaw_upstream::{PromptOutcome, StreamEvent, UpstreamAgent};

use crate::errors::TurnError;
use crate::session::{QueueEntry, SessionStore};

const BUSY_WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
const BUSY_WATCHDOG_MAX: Duration = Duration::from_secs(10 * 60);

/// Result of a `stop()` call.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub stopped: bool,
    pub queue_cleared: usize,
}

/// Serializes every turn — user messages, heartbeats, scheduled prompts —
/// through the single shared upstream session.
///
/// Cheap to clone; all state is shared.  The busy flag in `SessionStore` plus
/// this being the sole dispatcher guarantee at most one in-flight upstream
/// call.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    agent: Arc<dyn UpstreamAgent>,
    session: Arc<SessionStore>,
    stm: Arc<ShortTermMemory>,
    context: Option<Arc<ContextOptimizer>>,
    dashboard: Option<DashboardClient>,
    config: SessionConfig,
    /// Abort handle of the in-flight stream, if any.
    abort: Mutex<Option<watch::Sender<bool>>>,
    /// The single shared drain timer.
    drain_timer: Mutex<Option<tokio::task::AbortHandle>>,
}

impl Orchestrator {
    pub fn new(
        agent: Arc<dyn UpstreamAgent>,
        session: Arc<SessionStore>,
        stm: Arc<ShortTermMemory>,
        context: Option<Arc<ContextOptimizer>>,
        dashboard: Option<DashboardClient>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent,
                session,
                stm,
                context,
                dashboard,
                config,
                abort: Mutex::new(None),
                drain_timer: Mutex::new(None),
            }),
        }
    }

    pub fn session_store(&self) -> Arc<SessionStore> {
        self.inner.session.clone()
    }

    pub fn queue_mode(&self) -> QueueMode {
        self.inner.config.queue_mode
    }

    /// Clear the shared session; the next turn starts fresh with replay.
    pub fn reset_session(&self) {
        self.inner.session.clear();
    }

    /// Buffered send: the full response text, no intermediate events.
    pub async fn send(&self, channel_id: &str, message: &str) -> Result<String, TurnError> {
        let (events, _sink) = mpsc::unbounded_channel();
        self.dispatch(channel_id, message, events).await
    }

    /// Streaming send: events are published as the turn progresses; the final
    /// text is the return value.
    pub async fn send_stream(
        &self,
        channel_id: &str,
        message: &str,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<String, TurnError> {
        self.dispatch(channel_id, message, events).await
    }

    async fn dispatch(
        &self,
        channel_id: &str,
        message: &str,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<String, TurnError> {
        // Claim the session before any suspension point; losers queue.
        if !self.inner.session.try_begin_turn() {
            let (resolver, resolved) = oneshot::channel();
            let (position, dropped) = self.inner.session.enqueue(QueueEntry {
                id: Uuid::new_v4(),
                channel_id: channel_id.to_string(),
                message: message.to_string(),
                events: events.clone(),
                resolver,
                enqueued_at: Utc::now(),
            });
            if let Some(dropped) = dropped {
                warn!(dropped = %dropped.message.chars().take(40).collect::<String>(), "queue full — dropping oldest entry");
                let _ = dropped.resolver.send(Err(TurnError::Overflow));
            }
            let _ = events.send(StreamEvent::Queued { position });
            debug!(position, channel_id, "turn queued behind busy session");
            self.schedule_drain();
            return resolved.await.unwrap_or(Err(TurnError::QueueCleared));
        }

        let result = self.run_turn(channel_id, message, &events).await;
        self.finish_turn();
        result
    }

    /// One turn against the shared session, with a single transparent retry
    /// when the upstream session turns out to be dead.
    async fn run_turn(
        &self,
        channel_id: &str,
        message: &str,
        events: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<String, TurnError> {
        let synthetic = is_synthetic_channel(channel_id);

        let enriched = if synthetic {
            message.to_string()
        } else if let Some(optimizer) = &self.inner.context {
            let prefix = optimizer.compose(message).await;
            if prefix.is_empty() {
                message.to_string()
            } else {
                format!("{prefix}{message}")
            }
        } else {
            message.to_string()
        };

        let mut retried = false;
        loop {
            let session_id = self.ensure_session().await?;
            self.inner.session.touch_activity();

            let outbound = if self.inner.session.consume_new_session_flag() {
                let history = self.inner.stm.history_block();
                if history.is_empty() {
                    enriched.clone()
                } else {
                    format!("{history}\n\n{enriched}")
                }
            } else {
                enriched.clone()
            };

            let (abort_tx, mut abort_rx) = watch::channel(false);
            *self.inner.abort.lock().unwrap() = Some(abort_tx);

            let outcome = tokio::time::timeout(
                self.inner.config.run_timeout,
                self.inner
                    .agent
                    .prompt_stream(&outbound, &session_id, events, &mut abort_rx),
            )
            .await;

            let aborted = *abort_rx.borrow();
            self.inner.abort.lock().unwrap().take();

            let outcome: Result<PromptOutcome, TurnError> = match outcome {
                Err(_) => Err(mobyclaw_upstream::AgentError::Timeout.into()),
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(err)) => Err(err.into()),
            };

            match outcome {
                Ok(outcome) => {
                    if !synthetic {
                        self.inner.stm.add_exchange(channel_id, &outbound, &outcome.text);
                    }
                    self.log_turn(channel_id, message, &outcome, &session_id);
                    return Ok(outcome.text);
                }
                Err(_) if aborted => return Err(TurnError::Aborted),
                Err(err) if !retried && err.is_session_class() => {
                    warn!(%err, "session-class failure — rotating session and retrying once");
                    self.inner.session.clear();
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn ensure_session(&self) -> Result<String, TurnError> {
        let session = &self.inner.session;
        if session.should_reset(Utc::now()) {
            info!("session lifecycle boundary reached — rotating");
            session.clear();
        }
        if let Some(id) = session.session_id() {
            return Ok(id);
        }
        let id = self.inner.agent.create_session().await?;
        session.set_session_id(&id);
        Ok(id)
    }

    fn finish_turn(&self) {
        self.inner.session.end_turn();
        if self.inner.session.queue_len() > 0 {
            self.schedule_drain();
        }
    }

    // ── queue draining ─────────────────────────────────────────────────────────

    fn schedule_drain(&self) {
        let mut timer = self.inner.drain_timer.lock().unwrap();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let delay = match self.inner.config.queue_mode {
            QueueMode::Collect => self.inner.config.queue_debounce,
            QueueMode::Followup => Duration::ZERO,
        };
        let this = self.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            this.drain().await;
        });
        *timer = Some(handle.abort_handle());
    }

    async fn drain(&self) {
        self.inner.drain_timer.lock().unwrap().take();
        if !self.inner.session.try_begin_turn() {
            // Busy again; whoever holds the session reschedules on finish.
            return;
        }

        match self.inner.config.queue_mode {
            QueueMode::Followup => {
                if let Some(entry) = self.inner.session.pop_front() {
                    let result = self.run_turn(&entry.channel_id, &entry.message, &entry.events).await;
                    let _ = entry.resolver.send(result);
                } else {
                    self.inner.session.end_turn();
                    return;
                }
            }
            QueueMode::Collect => {
                let entries = self.inner.session.drain_queue();
                match entries.len() {
                    0 => {
                        self.inner.session.end_turn();
                        return;
                    }
                    1 => {
                        let entry = entries.into_iter().next().expect("one entry");
                        let result =
                            self.run_turn(&entry.channel_id, &entry.message, &entry.events).await;
                        let _ = entry.resolver.send(result);
                    }
                    n => {
                        self.run_coalesced(entries, n).await;
                    }
                }
            }
        }
        self.finish_turn();
    }

    /// Merge a burst of queued entries into one synthetic turn.  Events and
    /// the final response fan out to every waiter; the coalesced turn uses
    /// the last entry's channel.
    async fn run_coalesced(&self, entries: Vec<QueueEntry>, count: usize) {
        let channel = entries
            .last()
            .map(|e| e.channel_id.clone())
            .unwrap_or_else(|| "system".to_string());
        let combined = format!(
            "[{count} messages were queued while you were busy. Here they are combined:]\n\n{}",
            entries
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("\n\n---\n\n")
        );
        info!(count, channel = %channel, "coalescing queued turns");

        let sinks: Vec<_> = entries.iter().map(|e| e.events.clone()).collect();
        let (fan_tx, mut fan_rx) = mpsc::unbounded_channel::<StreamEvent>();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = fan_rx.recv().await {
                for sink in &sinks {
                    let _ = sink.send(event.clone());
                }
            }
        });

        let result = self.run_turn(&channel, &combined, &fan_tx).await;
        drop(fan_tx);
        let _ = forwarder.await;

        match result {
            Ok(text) => {
                for entry in entries {
                    let _ = entry.resolver.send(Ok(text.clone()));
                }
            }
            Err(err) => {
                for entry in entries {
                    let _ = entry.resolver.send(Err(err.to_shared()));
                }
            }
        }
    }

    // ── stop & watchdog ────────────────────────────────────────────────────────

    /// Abort the in-flight stream (if any) and clear the queue.
    pub fn stop(&self) -> StopOutcome {
        if let Some(timer) = self.inner.drain_timer.lock().unwrap().take() {
            timer.abort();
        }

        let mut stopped = false;
        if self.inner.session.is_busy() {
            if let Some(abort) = self.inner.abort.lock().unwrap().as_ref() {
                stopped = abort.send(true).is_ok();
            }
        }

        let cleared = self.inner.session.clear_queue();
        let queue_cleared = cleared.len();
        for entry in cleared {
            let _ = entry.resolver.send(Err(TurnError::QueueCleared));
        }

        info!(stopped, queue_cleared, "stop requested");
        StopOutcome {
            stopped,
            queue_cleared,
        }
    }

    /// Periodically force-clear a busy flag that outlived any plausible turn.
    pub fn spawn_busy_watchdog(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(BUSY_WATCHDOG_INTERVAL) => {
                        if this.inner.session.check_busy_watchdog(BUSY_WATCHDOG_MAX)
                            && this.inner.session.queue_len() > 0
                        {
                            this.schedule_drain();
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn log_turn(
        &self,
        channel_id: &str,
        user_message: &str,
        outcome: &PromptOutcome,
        session_id: &str,
    ) {
        let Some(dashboard) = &self.inner.dashboard else {
            return;
        };
        dashboard.log_conversation(json!({
            "channel": channel_id,
            "user": user_message,
            "agent": outcome.text,
            "session_id": session_id,
            "time": Utc::now().to_rfc3339(),
        }));
        if let Some(usage) = &outcome.usage {
            dashboard.log_usage(json!({
                "session_id": session_id,
                "usage": usage,
                "time": Utc::now().to_rfc3339(),
            }));
        }
    }
}

/// Channels whose turns are gateway-generated: no context enrichment, no
/// short-term-memory record.
fn is_synthetic_channel(channel_id: &str) -> bool {
    channel_id.starts_with("heartbeat:")
        || channel_id.starts_with("schedule:")
        || channel_id == "system"
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Notify;

    use mobyclaw_config::{QueueMode, SessionConfig};
    use mobyclaw_upstream::AgentError;

    use crate::testing::{FakeAgent, Script, harness, wait_queue_len};

    use super::*;

    fn collect_config(debounce_ms: u64) -> SessionConfig {
        SessionConfig {
            queue_mode: QueueMode::Collect,
            queue_debounce: Duration::from_millis(debounce_ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn buffered_send_creates_session_and_records_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([Script::Text("hello there")]);
        let (orch, session, stm) = harness(agent.clone(), SessionConfig::default(), &dir);

        let text = orch.send("telegram:1", "hi").await.unwrap();
        assert_eq!(text, "hello there");
        assert_eq!(session.session_id().as_deref(), Some("sess-1"));
        assert_eq!(agent.calls().len(), 1);
        assert_eq!(agent.calls()[0].0, "sess-1");
        assert!(stm.history_block().contains("User: hi"));
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn synthetic_channels_skip_short_term_memory() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([Script::Text("HEARTBEAT_OK"), Script::Text("sched")]);
        let (orch, _session, stm) = harness(agent, SessionConfig::default(), &dir);

        orch.send("heartbeat:main", "reflect").await.unwrap();
        orch.send("schedule:sch_x", "say hi").await.unwrap();
        assert!(stm.is_empty());
    }

    #[tokio::test]
    async fn session_class_error_rotates_and_retries_once() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([
            Script::Fail(AgentError::Stream("tool_use_id not found".into())),
            Script::Text("ok"),
        ]);
        let (orch, session, _stm) = harness(agent.clone(), SessionConfig::default(), &dir);

        let text = orch.send("telegram:1", "hello again").await.unwrap();
        assert_eq!(text, "ok");

        let calls = agent.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "sess-1");
        assert_eq!(calls[1].0, "sess-2");
        assert!(calls[1].1.contains("hello again"));
        assert_eq!(session.session_id().as_deref(), Some("sess-2"));
    }

    #[tokio::test]
    async fn plain_errors_surface_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([Script::Fail(AgentError::Stream(
            "model produced garbage".into(),
        ))]);
        let (orch, _session, _stm) = harness(agent.clone(), SessionConfig::default(), &dir);

        let err = orch.send("telegram:1", "hi").await.unwrap_err();
        assert!(!err.is_session_class());
        assert_eq!(agent.calls().len(), 1);
    }

    #[tokio::test]
    async fn session_class_error_retries_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([
            Script::Fail(AgentError::Stream("session gone".into())),
            Script::Fail(AgentError::Stream("session gone again".into())),
        ]);
        let (orch, _session, _stm) = harness(agent.clone(), SessionConfig::default(), &dir);

        let err = orch.send("telegram:1", "hi").await.unwrap_err();
        assert!(err.is_session_class());
        assert_eq!(agent.calls().len(), 2);
    }

    #[tokio::test]
    async fn collect_mode_coalesces_into_one_upstream_call() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::with_script([
            Script::Gated("first", gate.clone()),
            Script::Text("combined reply"),
        ]);
        let (orch, session, _stm) = harness(agent.clone(), collect_config(50), &dir);

        let t1 = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "first").await })
        };
        agent.started.notified().await;

        let mut queued = Vec::new();
        for (i, msg) in ["a", "b", "c"].into_iter().enumerate() {
            let orch = orch.clone();
            queued.push(tokio::spawn(async move { orch.send("telegram:1", msg).await }));
            wait_queue_len(&session, i + 1).await;
        }

        gate.notify_one();
        assert_eq!(t1.await.unwrap().unwrap(), "first");

        let mut results = Vec::new();
        for task in queued {
            results.push(task.await.unwrap().unwrap());
        }
        assert!(results.iter().all(|r| r == "combined reply"));

        let calls = agent.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].1,
            "[3 messages were queued while you were busy. Here they are combined:]\n\na\n\n---\n\nb\n\n---\n\nc"
        );
    }

    #[tokio::test]
    async fn followup_mode_drains_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::with_script([
            Script::Gated("first", gate.clone()),
            Script::Text("reply-a"),
            Script::Text("reply-b"),
        ]);
        let config = SessionConfig {
            queue_mode: QueueMode::Followup,
            ..Default::default()
        };
        let (orch, session, _stm) = harness(agent.clone(), config, &dir);

        let t1 = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "first").await })
        };
        agent.started.notified().await;

        let ta = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "a").await })
        };
        wait_queue_len(&session, 1).await;
        let tb = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "b").await })
        };
        wait_queue_len(&session, 2).await;

        gate.notify_one();
        t1.await.unwrap().unwrap();
        assert_eq!(ta.await.unwrap().unwrap(), "reply-a");
        assert_eq!(tb.await.unwrap().unwrap(), "reply-b");

        let messages: Vec<String> = agent.calls().into_iter().map(|(_, m)| m).collect();
        assert_eq!(messages, vec!["first", "a", "b"]);
    }

    #[tokio::test]
    async fn full_queue_rejects_the_oldest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::with_script([
            Script::Gated("first", gate.clone()),
            Script::Text("late reply"),
        ]);
        let config = SessionConfig {
            max_queue_size: 2,
            ..collect_config(50)
        };
        let (orch, session, _stm) = harness(agent.clone(), config, &dir);

        let t1 = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "first").await })
        };
        agent.started.notified().await;

        let ta = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "a").await })
        };
        wait_queue_len(&session, 1).await;
        let tb = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "b").await })
        };
        wait_queue_len(&session, 2).await;
        let tc = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "c").await })
        };

        // "a" was the oldest and gets evicted.
        let err = ta.await.unwrap().unwrap_err();
        assert!(matches!(err, TurnError::Overflow));

        gate.notify_one();
        t1.await.unwrap().unwrap();
        assert_eq!(tb.await.unwrap().unwrap(), "late reply");
        assert_eq!(tc.await.unwrap().unwrap(), "late reply");
    }

    #[tokio::test]
    async fn stop_aborts_in_flight_and_clears_queue() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::with_script([Script::Gated("never", gate)]);
        let (orch, session, _stm) = harness(agent.clone(), collect_config(5_000), &dir);

        let t1 = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "long task").await })
        };
        agent.started.notified().await;

        let ta = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "queued 1").await })
        };
        wait_queue_len(&session, 1).await;
        let tb = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "queued 2").await })
        };
        wait_queue_len(&session, 2).await;

        let outcome = orch.stop();
        assert!(outcome.stopped);
        assert_eq!(outcome.queue_cleared, 2);

        assert!(matches!(t1.await.unwrap().unwrap_err(), TurnError::Aborted));
        assert!(matches!(ta.await.unwrap().unwrap_err(), TurnError::QueueCleared));
        assert!(matches!(tb.await.unwrap().unwrap_err(), TurnError::QueueCleared));

        // Aborted turns are never retried.
        assert_eq!(agent.calls().len(), 1);
        assert_eq!(session.queue_len(), 0);
    }

    #[tokio::test]
    async fn stop_with_idle_session_only_reports_queue() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([]);
        let (orch, _session, _stm) = harness(agent, SessionConfig::default(), &dir);

        let outcome = orch.stop();
        assert!(!outcome.stopped);
        assert_eq!(outcome.queue_cleared, 0);
    }

    #[tokio::test]
    async fn max_turns_rotates_session_and_injects_replay() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([
            Script::Text("r1"),
            Script::Text("r2"),
            Script::Text("r3"),
        ]);
        let config = SessionConfig {
            max_turns: 2,
            ..Default::default()
        };
        let (orch, session, _stm) = harness(agent.clone(), config, &dir);

        orch.send("telegram:1", "one").await.unwrap();
        orch.send("telegram:1", "two").await.unwrap();
        assert_eq!(session.session_id().as_deref(), Some("sess-1"));

        orch.send("telegram:1", "three").await.unwrap();
        assert_eq!(session.session_id().as_deref(), Some("sess-2"));

        let calls = agent.calls();
        assert!(calls[2].1.starts_with("[SHORT-TERM MEMORY"));
        assert!(calls[2].1.contains("User: one"));
        assert!(calls[2].1.ends_with("three"));
    }

    #[tokio::test]
    async fn at_most_one_upstream_call_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([]);
        let (orch, _session, _stm) = harness(agent.clone(), collect_config(5), &dir);

        let mut tasks = Vec::new();
        for i in 0..6 {
            let orch = orch.clone();
            tasks.push(tokio::spawn(async move {
                orch.send("telegram:1", &format!("m{i}")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(agent.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn queued_event_carries_position() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::with_script([Script::Gated("first", gate.clone())]);
        let (orch, session, _stm) = harness(agent.clone(), collect_config(50), &dir);

        let t1 = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send("telegram:1", "first").await })
        };
        agent.started.notified().await;

        let (events, mut rx) = mpsc::unbounded_channel();
        let t2 = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.send_stream("telegram:1", "waiting", events).await })
        };
        wait_queue_len(&session, 1).await;

        let first_event = rx.recv().await.unwrap();
        assert!(matches!(first_event, StreamEvent::Queued { position: 1 }));

        gate.notify_one();
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();
    }
}
