use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use mobyclaw_channels::ChannelStore;
use mobyclaw_config::GatewayConfig;
use mobyclaw_config::persist::{atomic_write_json, load_json};

use crate::orchestrator::Orchestrator;

const HEARTBEAT_CHANNEL: &str = "heartbeat:main";
/// A reply of exactly this string means "nothing to report".
const QUIET_REPLY: &str = "HEARTBEAT_OK";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub heartbeat_count: u64,
    pub last_exploration: Option<DateTime<Utc>>,
}

/// Periodic autonomous turn: reflection by default, a bounded exploration
/// every Nth tick.  Skips outside active hours, never contends with user
/// turns, and backs off after repeated failures until the session rotates.
pub struct Heartbeat {
    orchestrator: Orchestrator,
    channels: Arc<ChannelStore>,
    config: GatewayConfig,
    state_path: PathBuf,
    state: Mutex<HeartbeatState>,
    consecutive_failures: AtomicU32,
    /// Session id at the time of the last failure; back-off lifts when the
    /// live session differs.
    last_failed_session: Mutex<Option<String>>,
    running: AtomicBool,
}

impl Heartbeat {
    pub fn new(
        orchestrator: Orchestrator,
        channels: Arc<ChannelStore>,
        config: GatewayConfig,
    ) -> Self {
        let state_path = config.heartbeat_state_file();
        let state = load_json::<HeartbeatState>(&state_path)
            .unwrap_or_else(|err| {
                warn!(?err, "heartbeat state unreadable — starting at zero");
                None
            })
            .unwrap_or_default();
        Self {
            orchestrator,
            channels,
            config,
            state_path,
            state: Mutex::new(state),
            consecutive_failures: AtomicU32::new(0),
            last_failed_session: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Interval loop; runs until shutdown flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.heartbeat.interval;
        info!(?interval, "heartbeat started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.tick(false).await {
                        warn!(?err, "heartbeat tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One heartbeat.  `force` bypasses the active-hours gate (used by the
    /// manual trigger endpoint).  Returns the agent's reply when it had
    /// something to say.
    pub async fn tick(&self, force: bool) -> anyhow::Result<Option<String>> {
        let hb = &self.config.heartbeat;
        if !force && !hb.active_hours.contains(Utc::now(), hb.tz()) {
            return Ok(None);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("heartbeat already running — skipping tick");
            return Ok(None);
        }
        let result = self.tick_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn tick_inner(&self) -> anyhow::Result<Option<String>> {
        let session = self.orchestrator.session_store();

        // Back-off: after too many consecutive failures, wait for the session
        // to rotate before trying again.
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures >= self.config.heartbeat.max_failures {
            let current = session.session_id();
            let failed = self.last_failed_session.lock().unwrap().clone();
            if current == failed {
                debug!(failures, "heartbeat backing off until session rotates");
                return Ok(None);
            }
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }

        // Never contend with user turns.
        if session.is_busy() || session.queue_len() > 0 {
            debug!("session busy — skipping heartbeat");
            return Ok(None);
        }

        let (count, is_exploration) = {
            let mut state = self.state.lock().unwrap();
            state.heartbeat_count += 1;
            let hb = &self.config.heartbeat;
            let is_exploration = hb.exploration_enabled
                && state.heartbeat_count % hb.exploration_frequency == 0;
            if is_exploration {
                state.last_exploration = Some(Utc::now());
            }
            if let Err(err) = atomic_write_json(&self.state_path, &*state) {
                warn!(?err, "failed to persist heartbeat state");
            }
            (state.heartbeat_count, is_exploration)
        };

        let prompt = self.build_prompt(is_exploration, count);
        info!(count, is_exploration, "heartbeat firing");

        match self.orchestrator.send(HEARTBEAT_CHANNEL, &prompt).await {
            Ok(reply) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if reply.trim() == QUIET_REPLY {
                    debug!("quiet heartbeat");
                    Ok(None)
                } else {
                    Ok(Some(reply))
                }
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                *self.last_failed_session.lock().unwrap() = session.session_id();
                warn!(failures, %err, "heartbeat turn failed");
                Err(err.into())
            }
        }
    }

    /// Compose the heartbeat prompt: a fixed header plus a reflection or
    /// exploration body.
    pub fn build_prompt(&self, is_exploration: bool, count: u64) -> String {
        let kind = if is_exploration { "exploration" } else { "reflection" };
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let channels = self.channels.get_all();
        let channel_list = if channels.is_empty() {
            "(none known yet)".to_string()
        } else {
            channels
                .iter()
                .map(|(platform, id)| format!("{platform} → {id}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let default_channel = self
            .channels
            .get_default()
            .unwrap_or_else(|| "(none)".to_string());

        let root = self.config.data_root.display();
        let port = self.config.http.port;

        let mut prompt = format!(
            "[HEARTBEAT {kind} #{count} — {timestamp}]\n\
             Known channels: {channel_list} (default: {default_channel})\n\
             Your files: {root}/state/inner.json, {root}/SELF.md, {root}/explorations/\n\n"
        );

        if is_exploration {
            let hb = &self.config.heartbeat;
            prompt.push_str(&format!(
                "This is an exploration heartbeat.\n\
                 1. Read state/inner.json and pick ONE topic from your curiosity queue.\n\
                 2. Research it with at most {max_fetches} web fetch(es).\n\
                 3. Write a summary of roughly {words} words to \
                 explorations/YYYY-MM-DD-<slug>.md with this front-matter:\n\
                 ---\n\
                 topic: <the topic>\n\
                 date: <today>\n\
                 sources: <urls you fetched>\n\
                 ---\n\
                 4. Remove the topic from the curiosity queue, then do a brief \
                 reflection: update your mood and energy in state/inner.json.\n\
                 Reply {QUIET_REPLY} when there is nothing the user needs to hear.\n",
                max_fetches = hb.exploration_max_fetches,
                words = hb.exploration_summary_words,
            ));
        } else {
            prompt.push_str(&format!(
                "This is a reflection heartbeat — do NOT make any web requests.\n\
                 1. Read state/inner.json and update your mood, energy, and \
                 preoccupations to match how the recent conversation left you.\n\
                 2. Append a line to your journal if something feels worth keeping.\n\
                 3. Check whether anything you promised the user is now due.\n\
                 4. If — and only if — something genuinely needs the user's \
                 attention, deliver it with:\n\
                 POST http://localhost:{port}/api/deliver \
                 {{\"channel\": \"{default_channel}\", \"message\": \"...\"}}\n\
                 Otherwise reply exactly {QUIET_REPLY}.\n"
            ));
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use mobyclaw_config::{ActiveHours, SessionConfig};
    use mobyclaw_upstream::AgentError;

    use crate::testing::{FakeAgent, Script, harness};

    use super::*;

    fn heartbeat_with(
        agent: Arc<crate::testing::FakeAgent>,
        config: GatewayConfig,
        dir: &tempfile::TempDir,
    ) -> (Heartbeat, Arc<crate::session::SessionStore>) {
        let (orchestrator, session, _stm) = harness(agent, SessionConfig::default(), dir);
        let channels =
            Arc::new(ChannelStore::new(dir.path().join("channels.json")).unwrap());
        (Heartbeat::new(orchestrator, channels, config), session)
    }

    fn config_at(dir: &tempfile::TempDir) -> GatewayConfig {
        GatewayConfig {
            data_root: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn quiet_reply_counts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([Script::Text("HEARTBEAT_OK")]);
        let (heartbeat, _session) = heartbeat_with(agent.clone(), config_at(&dir), &dir);

        let reply = heartbeat.tick(true).await.unwrap();
        assert_eq!(reply, None);
        assert_eq!(agent.calls().len(), 1);

        let persisted: HeartbeatState = mobyclaw_config::persist::load_json(
            &config_at(&dir).heartbeat_state_file(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(persisted.heartbeat_count, 1);
    }

    #[tokio::test]
    async fn non_quiet_reply_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([Script::Text("I noticed something.")]);
        let (heartbeat, _session) = heartbeat_with(agent, config_at(&dir), &dir);

        let reply = heartbeat.tick(true).await.unwrap();
        assert_eq!(reply.as_deref(), Some("I noticed something."));
    }

    #[tokio::test]
    async fn busy_session_is_never_contended() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([]);
        let (heartbeat, session) = heartbeat_with(agent.clone(), config_at(&dir), &dir);

        assert!(session.try_begin_turn());
        let reply = heartbeat.tick(true).await.unwrap();
        assert_eq!(reply, None);
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn outside_active_hours_skips_silently() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_at(&dir);
        // A zero-width window is never active.
        config.heartbeat.active_hours = ActiveHours { start: 0, end: 0 };
        let agent = FakeAgent::with_script([]);
        let (heartbeat, _session) = heartbeat_with(agent.clone(), config, &dir);

        assert_eq!(heartbeat.tick(false).await.unwrap(), None);
        assert!(agent.calls().is_empty());
        // force bypasses the gate.
        heartbeat.tick(true).await.unwrap();
        assert_eq!(agent.calls().len(), 1);
    }

    #[tokio::test]
    async fn backs_off_after_failures_until_session_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_at(&dir);
        config.heartbeat.max_failures = 1;
        let agent = FakeAgent::with_script([
            Script::Fail(AgentError::Stream("boom".into())),
            Script::Text("HEARTBEAT_OK"),
        ]);
        let (heartbeat, _session) = heartbeat_with(agent.clone(), config, &dir);

        assert!(heartbeat.tick(true).await.is_err());
        assert_eq!(agent.calls().len(), 1);

        // Same session — backing off.
        assert_eq!(heartbeat.tick(true).await.unwrap(), None);
        assert_eq!(agent.calls().len(), 1);

        // Rotation lifts the back-off.
        heartbeat.orchestrator.reset_session();
        assert_eq!(heartbeat.tick(true).await.unwrap(), None);
        assert_eq!(agent.calls().len(), 2);
    }

    #[tokio::test]
    async fn exploration_cadence_follows_frequency() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_at(&dir);
        config.heartbeat.exploration_frequency = 2;
        let agent = FakeAgent::with_script([
            Script::Text("HEARTBEAT_OK"),
            Script::Text("HEARTBEAT_OK"),
        ]);
        let (heartbeat, _session) = heartbeat_with(agent.clone(), config, &dir);

        heartbeat.tick(true).await.unwrap();
        heartbeat.tick(true).await.unwrap();

        let calls = agent.calls();
        assert!(calls[0].1.contains("reflection"));
        assert!(calls[1].1.contains("exploration"));
        assert!(heartbeat.state.lock().unwrap().last_exploration.is_some());
    }

    #[test]
    fn prompt_bodies_match_their_kind() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_script([]);
        let (heartbeat, _session) = heartbeat_with(agent, config_at(&dir), &dir);

        let reflection = heartbeat.build_prompt(false, 3);
        assert!(reflection.contains("do NOT make any web requests"));
        assert!(reflection.contains("/api/deliver"));
        assert!(reflection.contains("HEARTBEAT_OK"));

        let exploration = heartbeat.build_prompt(true, 4);
        assert!(exploration.contains("curiosity queue"));
        assert!(exploration.contains("topic:"));
        assert!(exploration.contains("explorations/"));
    }
}
