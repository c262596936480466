use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use mobyclaw_config::SessionConfig;
use mobyclaw_config::persist::{atomic_write_json, load_json};
use mobyclaw_upstream::StreamEvent;

use crate::errors::TurnError;

/// A turn parked behind a busy session.
pub struct QueueEntry {
    pub id: Uuid,
    pub channel_id: String,
    pub message: String,
    pub events: mpsc::UnboundedSender<StreamEvent>,
    pub resolver: oneshot::Sender<Result<String, TurnError>>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSession {
    session_id: Option<String>,
    last_activity: Option<DateTime<Utc>>,
    last_reset_at: Option<DateTime<Utc>>,
    updated: DateTime<Utc>,
}

/// Read-only view for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub busy: bool,
    pub queue_length: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub turn_count: u32,
}

struct SessionState {
    session_id: Option<String>,
    busy: bool,
    busy_since: Option<Instant>,
    last_activity: Option<DateTime<Utc>>,
    last_reset_at: Option<DateTime<Utc>>,
    turn_count: u32,
    is_new: bool,
    queue: VecDeque<QueueEntry>,
}

/// The single shared session's mutable state.  Every read-then-update runs
/// under one mutex so two callers racing through the busy check cannot both
/// proceed.
pub struct SessionStore {
    path: PathBuf,
    config: SessionConfig,
    tz: Tz,
    inner: Mutex<SessionState>,
}

impl SessionStore {
    pub fn new(path: PathBuf, config: SessionConfig, tz: Tz) -> anyhow::Result<Self> {
        let persisted = load_json::<PersistedSession>(&path).unwrap_or_else(|err| {
            warn!(?err, "session file unreadable — starting fresh");
            None
        });

        let (session_id, last_activity, last_reset_at) = match persisted {
            Some(p) => (p.session_id, p.last_activity, p.last_reset_at),
            None => (None, None, None),
        };

        Ok(Self {
            path,
            config,
            tz,
            inner: Mutex::new(SessionState {
                session_id,
                busy: false,
                busy_since: None,
                last_activity,
                last_reset_at,
                turn_count: 0,
                is_new: false,
                queue: VecDeque::new(),
            }),
        })
    }

    // ── session identity ───────────────────────────────────────────────────────

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().unwrap().session_id.clone()
    }

    /// Adopt a freshly-created upstream session.  Marks the session new so the
    /// next turn injects the short-term-memory replay.
    pub fn set_session_id(&self, id: &str) {
        let mut state = self.inner.lock().unwrap();
        state.session_id = Some(id.to_string());
        state.is_new = true;
        self.persist(&state);
    }

    /// Forget the current session: next turn gets a fresh one with replay.
    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap();
        state.session_id = None;
        state.is_new = true;
        state.turn_count = 0;
        state.last_reset_at = Some(Utc::now());
        self.persist(&state);
    }

    pub fn touch_activity(&self) {
        let mut state = self.inner.lock().unwrap();
        state.turn_count += 1;
        state.last_activity = Some(Utc::now());
        self.persist(&state);
    }

    /// Atomic test-and-clear of the new-session flag.
    pub fn consume_new_session_flag(&self) -> bool {
        let mut state = self.inner.lock().unwrap();
        std::mem::take(&mut state.is_new)
    }

    /// Lifecycle rules: turn-count cap, daily boundary, optional idle window.
    pub fn should_reset(&self, now: DateTime<Utc>) -> bool {
        let state = self.inner.lock().unwrap();
        if state.session_id.is_none() {
            return false;
        }
        if state.turn_count >= self.config.max_turns {
            return true;
        }
        if let Some(last) = state.last_activity {
            if self.crossed_daily_boundary(last, now) {
                return true;
            }
            if let Some(idle_minutes) = self.config.idle_reset_minutes {
                if now - last > chrono::Duration::minutes(idle_minutes as i64) {
                    return true;
                }
            }
        }
        false
    }

    /// Whether the most recent daily-reset boundary (local time) falls between
    /// the last activity and now.
    fn crossed_daily_boundary(&self, last_activity: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let local_now = now.with_timezone(&self.tz).naive_local();
        let mut boundary = local_now
            .date()
            .and_hms_opt(self.config.daily_reset_hour, 0, 0)
            .unwrap_or(local_now);
        if local_now < boundary {
            boundary = boundary - chrono::Duration::days(1);
        }
        last_activity.with_timezone(&self.tz).naive_local() < boundary
    }

    // ── busy flag ──────────────────────────────────────────────────────────────

    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().busy
    }

    /// Claim the session for a turn.  Returns `false` when it is already busy;
    /// the check and the claim happen under one lock.
    pub fn try_begin_turn(&self) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.busy {
            return false;
        }
        state.busy = true;
        state.busy_since = Some(Instant::now());
        true
    }

    pub fn end_turn(&self) {
        let mut state = self.inner.lock().unwrap();
        state.busy = false;
        state.busy_since = None;
    }

    /// Force-clear a busy flag older than `max_busy` — a silent upstream death
    /// that slipped past the socket watchdog.  Returns `true` when cleared.
    pub fn check_busy_watchdog(&self, max_busy: Duration) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.busy && state.busy_since.is_some_and(|since| since.elapsed() > max_busy) {
            warn!(?max_busy, "busy flag stuck — force clearing");
            state.busy = false;
            state.busy_since = None;
            return true;
        }
        false
    }

    // ── queue ──────────────────────────────────────────────────────────────────

    /// Append an entry.  When the queue is full the oldest entry is dropped
    /// and returned so the caller can reject it.  The second value is the
    /// 1-based queue position of the new entry.
    pub fn enqueue(&self, entry: QueueEntry) -> (usize, Option<QueueEntry>) {
        let mut state = self.inner.lock().unwrap();
        let dropped = if state.queue.len() >= self.config.max_queue_size {
            state.queue.pop_front()
        } else {
            None
        };
        state.queue.push_back(entry);
        (state.queue.len(), dropped)
    }

    pub fn pop_front(&self) -> Option<QueueEntry> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    pub fn drain_queue(&self) -> Vec<QueueEntry> {
        self.inner.lock().unwrap().queue.drain(..).collect()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Empty the queue, returning the entries for rejection.
    pub fn clear_queue(&self) -> Vec<QueueEntry> {
        let cleared = self.drain_queue();
        if !cleared.is_empty() {
            info!(count = cleared.len(), "queue cleared");
        }
        cleared
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.lock().unwrap();
        SessionSnapshot {
            session_id: state.session_id.clone(),
            busy: state.busy,
            queue_length: state.queue.len(),
            last_activity: state.last_activity,
            turn_count: state.turn_count,
        }
    }

    fn persist(&self, state: &SessionState) {
        let record = PersistedSession {
            session_id: state.session_id.clone(),
            last_activity: state.last_activity,
            last_reset_at: state.last_reset_at,
            updated: Utc::now(),
        };
        if let Err(err) = atomic_write_json(&self.path, &record) {
            warn!(?err, "failed to persist session state");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn store_with(config: SessionConfig, dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("session.json"), config, chrono_tz::UTC).unwrap()
    }

    fn entry(message: &str) -> QueueEntry {
        let (events, _rx) = mpsc::unbounded_channel();
        let (resolver, _rx) = oneshot::channel();
        QueueEntry {
            id: Uuid::new_v4(),
            channel_id: "telegram:1".into(),
            message: message.into(),
            events,
            resolver,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn busy_claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(SessionConfig::default(), &dir);
        assert!(store.try_begin_turn());
        assert!(!store.try_begin_turn());
        store.end_turn();
        assert!(store.try_begin_turn());
    }

    #[test]
    fn new_session_flag_is_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(SessionConfig::default(), &dir);
        store.set_session_id("sess-1");
        assert!(store.consume_new_session_flag());
        assert!(!store.consume_new_session_flag());
        store.clear();
        assert!(store.consume_new_session_flag());
    }

    #[test]
    fn turn_count_cap_forces_reset() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            max_turns: 2,
            ..Default::default()
        };
        let store = store_with(config, &dir);
        store.set_session_id("sess-1");
        assert!(!store.should_reset(Utc::now()));
        store.touch_activity();
        store.touch_activity();
        assert!(store.should_reset(Utc::now()));
    }

    #[test]
    fn daily_boundary_crossing_forces_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(SessionConfig::default(), &dir);
        store.set_session_id("sess-1");
        store.touch_activity();

        // Activity just happened; same side of the 04:00 boundary.
        assert!(!store.should_reset(Utc::now()));

        // Now pretend "now" is after the next 04:00 boundary.
        let tomorrow_morning = (Utc::now() + chrono::Duration::days(1))
            .date_naive()
            .and_hms_opt(5, 0, 0)
            .unwrap()
            .and_utc();
        assert!(store.should_reset(tomorrow_morning));
    }

    #[test]
    fn idle_window_forces_reset() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            idle_reset_minutes: Some(30),
            ..Default::default()
        };
        let store = store_with(config, &dir);
        store.set_session_id("sess-1");
        store.touch_activity();
        assert!(!store.should_reset(Utc::now()));
        assert!(store.should_reset(Utc::now() + chrono::Duration::minutes(31)));
    }

    #[test]
    fn no_session_means_no_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(SessionConfig::default(), &dir);
        let far_future = Utc.with_ymd_and_hms(2040, 1, 1, 12, 0, 0).unwrap();
        assert!(!store.should_reset(far_future));
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            max_queue_size: 2,
            ..Default::default()
        };
        let store = store_with(config, &dir);

        let (pos, dropped) = store.enqueue(entry("a"));
        assert_eq!((pos, dropped.is_some()), (1, false));
        let (pos, dropped) = store.enqueue(entry("b"));
        assert_eq!((pos, dropped.is_some()), (2, false));
        let (_, dropped) = store.enqueue(entry("c"));
        assert_eq!(dropped.unwrap().message, "a");

        let remaining: Vec<_> = store.drain_queue().into_iter().map(|e| e.message).collect();
        assert_eq!(remaining, vec!["b", "c"]);
    }

    #[test]
    fn busy_watchdog_only_clears_stale_turns() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(SessionConfig::default(), &dir);
        assert!(store.try_begin_turn());
        assert!(!store.check_busy_watchdog(Duration::from_secs(600)));
        assert!(store.is_busy());
        assert!(store.check_busy_watchdog(Duration::ZERO));
        assert!(!store.is_busy());
    }

    #[test]
    fn persists_identity_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        {
            let store =
                SessionStore::new(path.clone(), SessionConfig::default(), chrono_tz::UTC).unwrap();
            store.set_session_id("sess-42");
            store.touch_activity();
        }
        let reloaded =
            SessionStore::new(path, SessionConfig::default(), chrono_tz::UTC).unwrap();
        assert_eq!(reloaded.session_id().as_deref(), Some("sess-42"));
        assert!(reloaded.snapshot().last_activity.is_some());
        // busy and the queue never persist.
        assert!(!reloaded.is_busy());
        assert_eq!(reloaded.queue_len(), 0);
    }
}
