//! Telegram long-polling adapter.
//!
//! Inbound messages are deduped, allowlisted, and dispatched as streaming
//! turns rendered through [`render::TurnRenderer`].  A liveness watchdog
//! restarts polling when updates go silent; the dedup ring absorbs whatever
//! gets replayed afterwards.

mod api;
mod render;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error, info, warn};

use mobyclaw_channels::{ChannelStore, ProactiveSender};
use mobyclaw_config::TelegramConfig;
use mobyclaw_runtime::{Orchestrator, TurnError};

pub use api::{TelegramApi, chunk_message};
pub use render::{RenderConfig, TurnRenderer};

const POLL_TIMEOUT_S: u32 = 25;
const DEDUP_CAPACITY: usize = 50;
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
const WATCHDOG_IDLE_MAX: Duration = Duration::from_secs(5 * 60);
const PUMP_INTERVAL: Duration = Duration::from_millis(300);
const TYPING_INTERVAL: Duration = Duration::from_secs(4);
/// Proactive sends chunk below the platform cap to leave formatting headroom.
const PROACTIVE_CHUNK: usize = 3500;

pub struct TelegramBot {
    api: TelegramApi,
    orchestrator: Orchestrator,
    channels: Arc<ChannelStore>,
    allowed_users: Vec<i64>,
    dedup: Mutex<DedupRing>,
    last_update_at: Mutex<Instant>,
    restart: Notify,
}

impl TelegramBot {
    pub fn new(
        config: &TelegramConfig,
        orchestrator: Orchestrator,
        channels: Arc<ChannelStore>,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            api: TelegramApi::new(&config.bot_token)?,
            orchestrator,
            channels,
            allowed_users: config.allowed_users.clone(),
            dedup: Mutex::new(DedupRing::new(DEDUP_CAPACITY)),
            last_update_at: Mutex::new(Instant::now()),
            restart: Notify::new(),
        }))
    }

    /// The send function registered with the adapter registry.
    pub fn sender(self: &Arc<Self>) -> Arc<TelegramSender> {
        Arc::new(TelegramSender {
            api: self.api.clone(),
        })
    }

    /// Run the polling loop and the liveness watchdog until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let watchdog = {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.watchdog_loop(shutdown).await })
        };
        self.poll_loop(shutdown).await;
        watchdog.abort();
    }

    async fn poll_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut offset: i64 = 0;
        info!("telegram polling started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.restart.notified() => {
                    warn!("restarting telegram polling after silent stall");
                    if let Err(err) = self.api.delete_webhook(false).await {
                        warn!(?err, "delete_webhook failed during restart");
                    }
                }
                updates = self.api.get_updates(offset, POLL_TIMEOUT_S) => {
                    match updates {
                        Ok(updates) => {
                            *self.last_update_at.lock().unwrap() = Instant::now();
                            for update in updates {
                                offset = update.update_id + 1;
                                self.handle_update(update);
                            }
                        }
                        Err(err) if err.to_string().contains("409") => {
                            // Another instance is polling — back off and let it win.
                            warn!("telegram 409 conflict — waiting 15s");
                            tokio::time::sleep(Duration::from_secs(15)).await;
                        }
                        Err(err) => {
                            warn!(?err, "getUpdates failed — retrying in 5s");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
        info!("telegram polling stopped");
    }

    fn handle_update(self: &Arc<Self>, update: api::Update) {
        let Some(message) = update.message else {
            return;
        };
        let Some(text) = message.text else {
            return;
        };
        let chat_id = message.chat.id;

        if !self.allowed_users.is_empty() {
            let from = message.from.as_ref().map(|u| u.id);
            if !from.is_some_and(|id| self.allowed_users.contains(&id)) {
                debug!(chat_id, ?from, "dropping message from non-allowlisted user");
                return;
            }
        }

        // Replayed updates (watchdog restarts, reconnects) drop here.
        if !self
            .dedup
            .lock()
            .unwrap()
            .remember((chat_id, message.message_id))
        {
            debug!(chat_id, message_id = message.message_id, "duplicate update dropped");
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.dispatch(chat_id, text.trim().to_string()).await {
                error!(?err, chat_id, "telegram dispatch failed");
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, chat_id: i64, text: String) -> Result<()> {
        let line = normalize_command(&text);
        if line.starts_with('/') {
            return self.handle_command(chat_id, &line).await;
        }
        self.run_turn(chat_id, &line).await
    }

    async fn handle_command(&self, chat_id: i64, line: &str) -> Result<()> {
        match line {
            "/start" | "/help" => {
                self.api
                    .send_message(
                        chat_id,
                        "/new — start a fresh session\n\
                         /stop — stop the current response\n\
                         /status — session and queue state\n\n\
                         Anything else is a message to your agent.",
                    )
                    .await?;
            }
            "/new" | "/reset" | "/clear" => {
                self.orchestrator.reset_session();
                self.api
                    .send_message(chat_id, "Fresh session — I'll pick up from my short-term memory.")
                    .await?;
            }
            "/stop" => {
                let outcome = self.orchestrator.stop();
                let reply = if outcome.stopped {
                    format!("Stopped. Cleared {} queued message(s).", outcome.queue_cleared)
                } else if outcome.queue_cleared > 0 {
                    format!("Nothing running; cleared {} queued message(s).", outcome.queue_cleared)
                } else {
                    "Nothing to stop.".to_string()
                };
                self.api.send_message(chat_id, &reply).await?;
            }
            "/status" => {
                let snapshot = self.orchestrator.session_store().snapshot();
                let channels = self.channels.get_all();
                let reply = format!(
                    "session: {}\nbusy: {}\nqueued: {}\nturns this session: {}\nknown channels: {}",
                    snapshot.session_id.as_deref().unwrap_or("(none)"),
                    snapshot.busy,
                    snapshot.queue_length,
                    snapshot.turn_count,
                    if channels.is_empty() {
                        "(none)".to_string()
                    } else {
                        channels.values().cloned().collect::<Vec<_>>().join(", ")
                    },
                );
                self.api.send_message(chat_id, &reply).await?;
            }
            // Unhandled slash commands are ignored.
            _ => debug!(line, "ignoring unknown command"),
        }
        Ok(())
    }

    /// One streaming turn: context line, channel tracking, renderer-driven
    /// segment edits, typing indicator.
    async fn run_turn(self: &Arc<Self>, chat_id: i64, text: &str) -> Result<()> {
        let channel_id = format!("telegram:{chat_id}");
        self.channels.track(&channel_id);

        let default_channel = self
            .channels
            .get_default()
            .filter(|d| *d != channel_id)
            .map(|d| format!(", default_channel={d}"))
            .unwrap_or_default();
        let message = format!(
            "[context: channel={channel_id}, time={}{default_channel}]\n{text}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );

        let renderer = Arc::new(TurnRenderer::new(
            self.api.clone(),
            chat_id,
            RenderConfig::default(),
        ));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let turn = {
            let orchestrator = self.orchestrator.clone();
            let channel_id = channel_id.clone();
            tokio::spawn(async move {
                orchestrator.send_stream(&channel_id, &message, events_tx).await
            })
        };

        let mut pump = tokio::time::interval(PUMP_INTERVAL);
        let mut typing = tokio::time::interval(TYPING_INTERVAL);
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => renderer.handle_event(event).await,
                        None => break,
                    }
                }
                _ = pump.tick() => renderer.pump(false).await,
                _ = typing.tick() => {
                    if !renderer.any_sent().await {
                        let _ = self.api.send_typing(chat_id).await;
                    }
                }
            }
        }

        let result = turn
            .await
            .unwrap_or_else(|err| Err(TurnError::Internal(format!("turn task panicked: {err}"))));
        if let Err(err) = &result {
            debug!(%err, chat_id, "turn ended with error");
        }
        renderer.finish(&result).await;
        Ok(())
    }

    async fn watchdog_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {
                    let idle = self.last_update_at.lock().unwrap().elapsed();
                    if idle > WATCHDOG_IDLE_MAX && self.api.get_me().await {
                        warn!(?idle, "no updates despite reachable API — nudging poller");
                        self.restart.notify_one();
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
}

/// Proactive delivery function for the adapter registry.  Errors propagate so
/// the scheduler keeps the schedule pending and retries.
pub struct TelegramSender {
    api: TelegramApi,
}

#[async_trait]
impl ProactiveSender for TelegramSender {
    async fn send(&self, target: &str, text: &str) -> Result<()> {
        let chat_id: i64 = target
            .parse()
            .with_context(|| format!("bad telegram chat id {target:?}"))?;
        for chunk in chunk_message(text, PROACTIVE_CHUNK) {
            self.api.send_message(chat_id, &chunk).await?;
        }
        Ok(())
    }
}

/// Ring of recently-seen message keys; `remember` returns `false` on repeats.
struct DedupRing {
    capacity: usize,
    seen: VecDeque<(i64, i64)>,
}

impl DedupRing {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: VecDeque::with_capacity(capacity),
        }
    }

    fn remember(&mut self, key: (i64, i64)) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.seen.len() == self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(key);
        true
    }
}

/// Strip `@botname` suffixes from commands and trim whitespace.
fn normalize_command(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return trimmed.to_string();
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    let command = command
        .split_once('@')
        .map(|(base, _)| base)
        .unwrap_or(command);

    if rest.is_empty() {
        command.to_string()
    } else {
        format!("{command} {rest}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bot_mentions_in_commands() {
        assert_eq!(normalize_command("/status@mobyclaw_bot"), "/status");
        assert_eq!(normalize_command("/new@mobyclaw_bot now"), "/new now");
        assert_eq!(normalize_command(" hello "), "hello");
    }

    #[test]
    fn dedup_ring_drops_repeats_within_capacity() {
        let mut ring = DedupRing::new(50);
        assert!(ring.remember((42, 1)));
        assert!(!ring.remember((42, 1)));
        assert!(ring.remember((42, 2)));
        assert!(ring.remember((43, 1)));
    }

    #[test]
    fn dedup_ring_evicts_oldest_at_capacity() {
        let mut ring = DedupRing::new(3);
        for i in 0..3 {
            assert!(ring.remember((1, i)));
        }
        assert!(ring.remember((1, 3))); // evicts (1, 0)
        assert!(ring.remember((1, 0))); // old key admitted again
        assert!(!ring.remember((1, 3)));
    }
}
