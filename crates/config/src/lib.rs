use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub mod persist;

// ── upstream agent runtime ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the agent runtime (`AGENT_URL`).
    pub base_url: String,
    /// Opaque agent name segment of the stream endpoint (`AGENT_NAME`).
    pub agent_name: String,
    /// How long to poll the health endpoint at boot before giving up.
    pub ready_timeout: Duration,
    /// Destroy the stream when no bytes arrive for this long.
    pub socket_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787".to_string(),
            agent_name: "agent".to_string(),
            ready_timeout: Duration::from_secs(120),
            socket_idle_timeout: Duration::from_secs(300),
        }
    }
}

// ── dashboard (soft dependency) ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    /// Base URL of the dashboard (`DASHBOARD_URL`); empty disables it entirely.
    pub base_url: String,
    /// `CONTEXT_OPTIMIZER=false` disables per-turn context enrichment.
    pub context_enabled: bool,
    /// Token budget forwarded to the context endpoint (`CONTEXT_BUDGET_TOKENS`).
    pub context_budget_tokens: u32,
    pub context_timeout: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            context_enabled: true,
            context_budget_tokens: 2000,
            context_timeout: Duration::from_secs(3),
        }
    }
}

// ── session lifecycle & queue ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Coalesce a burst of queued messages into one synthetic turn.
    Collect,
    /// Drain queued messages one at a time, in order.
    Followup,
}

impl FromStr for QueueMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "collect" => Ok(Self::Collect),
            "followup" => Ok(Self::Followup),
            other => bail!("unknown queue mode {other:?} (expected collect|followup)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Rotate the upstream session after this many turns.
    pub max_turns: u32,
    /// Local hour at which a daily rotation boundary falls (`0..24`).
    pub daily_reset_hour: u32,
    /// Rotate when the session has been idle longer than this (optional).
    pub idle_reset_minutes: Option<u64>,
    /// Hard cap on a single turn (`RUN_TIMEOUT_MS`).
    pub run_timeout: Duration,
    pub max_queue_size: usize,
    pub queue_mode: QueueMode,
    /// Collect-mode drain debounce (`QUEUE_DEBOUNCE_MS`).
    pub queue_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: 80,
            daily_reset_hour: 4,
            idle_reset_minutes: None,
            run_timeout: Duration::from_secs(600),
            max_queue_size: 20,
            queue_mode: QueueMode::Collect,
            queue_debounce: Duration::from_millis(1000),
        }
    }
}

// ── short-term memory ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StmConfig {
    pub max_exchanges: usize,
    pub max_msg_length: usize,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            max_exchanges: 20,
            max_msg_length: 1500,
        }
    }
}

// ── heartbeat ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub active_hours: ActiveHours,
    /// IANA timezone name for the active-hours window (`TZ`).
    pub timezone: String,
    pub exploration_enabled: bool,
    /// Every Nth heartbeat becomes an exploration instead of a reflection.
    pub exploration_frequency: u64,
    pub exploration_max_fetches: u32,
    pub exploration_summary_words: u32,
    /// Back off after this many consecutive failures until the session rotates.
    pub max_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            active_hours: ActiveHours::default(),
            timezone: "UTC".to_string(),
            exploration_enabled: true,
            exploration_frequency: 4,
            exploration_max_fetches: 1,
            exploration_summary_words: 300,
            max_failures: 2,
        }
    }
}

impl HeartbeatConfig {
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            tracing::warn!(tz = %self.timezone, "unrecognised timezone — falling back to UTC");
            chrono_tz::UTC
        })
    }
}

// ── messaging adapters ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Empty allowlist admits every user.
    pub allowed_users: Vec<i64>,
}

impl TelegramConfig {
    pub fn enabled(&self) -> bool {
        !self.bot_token.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

// ── top-level gateway config ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Process-wide data root (`MOBYCLAW_HOME`); every persisted file lives here.
    pub data_root: PathBuf,
    pub upstream: UpstreamConfig,
    pub dashboard: DashboardConfig,
    pub session: SessionConfig,
    pub stm: StmConfig,
    pub heartbeat: HeartbeatConfig,
    pub telegram: TelegramConfig,
    pub http: HttpConfig,
}

impl GatewayConfig {
    /// Build a config from the environment, with code defaults for anything
    /// unset.  Malformed values fall back to the default with a warning rather
    /// than aborting boot.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.data_root = env::var("MOBYCLAW_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".mobyclaw"));

        if let Ok(url) = env::var("AGENT_URL") {
            if !url.trim().is_empty() {
                config.upstream.base_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Ok(name) = env::var("AGENT_NAME") {
            if !name.trim().is_empty() {
                config.upstream.agent_name = name.trim().to_string();
            }
        }

        if let Ok(url) = env::var("DASHBOARD_URL") {
            config.dashboard.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(raw) = env::var("CONTEXT_OPTIMIZER") {
            config.dashboard.context_enabled = !raw.eq_ignore_ascii_case("false");
        }
        config.dashboard.context_budget_tokens =
            env_parse("CONTEXT_BUDGET_TOKENS", config.dashboard.context_budget_tokens);

        if let Some(ms) = env_parse_opt::<u64>("RUN_TIMEOUT_MS") {
            config.session.run_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse_opt::<u64>("QUEUE_DEBOUNCE_MS") {
            config.session.queue_debounce = Duration::from_millis(ms);
        }
        if let Ok(raw) = env::var("QUEUE_MODE") {
            match raw.parse() {
                Ok(mode) => config.session.queue_mode = mode,
                Err(err) => tracing::warn!(%err, "ignoring QUEUE_MODE"),
            }
        }
        config.session.max_queue_size =
            env_parse("MAX_QUEUE_SIZE", config.session.max_queue_size);
        config.session.max_turns = env_parse("SESSION_MAX_TURNS", config.session.max_turns);
        config.session.daily_reset_hour =
            env_parse("DAILY_RESET_HOUR", config.session.daily_reset_hour).min(23);
        config.session.idle_reset_minutes = env_parse_opt("IDLE_RESET_MINUTES");

        config.stm.max_exchanges = env_parse("STM_MAX_EXCHANGES", config.stm.max_exchanges);
        config.stm.max_msg_length = env_parse("STM_MAX_MSG_LENGTH", config.stm.max_msg_length);

        if let Some(interval) = env_duration("HEARTBEAT_INTERVAL") {
            config.heartbeat.interval = interval;
        }
        if let Ok(raw) = env::var("ACTIVE_HOURS") {
            match raw.parse() {
                Ok(hours) => config.heartbeat.active_hours = hours,
                Err(err) => tracing::warn!(%err, "ignoring ACTIVE_HOURS"),
            }
        }
        if let Ok(tz) = env::var("TZ") {
            if !tz.trim().is_empty() {
                config.heartbeat.timezone = tz.trim().to_string();
            }
        }
        if let Ok(raw) = env::var("EXPLORATION_ENABLED") {
            config.heartbeat.exploration_enabled = !raw.eq_ignore_ascii_case("false");
        }
        config.heartbeat.exploration_frequency =
            env_parse("EXPLORATION_FREQUENCY", config.heartbeat.exploration_frequency).max(1);
        config.heartbeat.exploration_max_fetches =
            env_parse("EXPLORATION_MAX_FETCHES", config.heartbeat.exploration_max_fetches);
        config.heartbeat.exploration_summary_words =
            env_parse("EXPLORATION_SUMMARY_WORDS", config.heartbeat.exploration_summary_words);

        if let Ok(token) = env::var("TELEGRAM_BOT_TOKEN") {
            config.telegram.bot_token = token.trim().to_string();
        }
        if let Ok(raw) = env::var("TELEGRAM_ALLOWED_USERS") {
            config.telegram.allowed_users = raw
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect();
        }

        config.http.port = env_parse("PORT", config.http.port);
        config
    }

    // ── data-root paths ────────────────────────────────────────────────────────

    pub fn session_file(&self) -> PathBuf {
        self.data_root.join("session.json")
    }

    pub fn schedules_file(&self) -> PathBuf {
        self.data_root.join("schedules.json")
    }

    pub fn channels_file(&self) -> PathBuf {
        self.data_root.join("channels.json")
    }

    pub fn stm_file(&self) -> PathBuf {
        self.data_root.join("short-term-memory.json")
    }

    pub fn inner_state_file(&self) -> PathBuf {
        self.data_root.join("state").join("inner.json")
    }

    pub fn heartbeat_state_file(&self) -> PathBuf {
        self.data_root.join("state").join("heartbeat-state.json")
    }

    pub fn self_file(&self) -> PathBuf {
        self.data_root.join("SELF.md")
    }

    pub fn explorations_dir(&self) -> PathBuf {
        self.data_root.join("explorations")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }
}

// ── active hours ───────────────────────────────────────────────────────────────

/// A local-time window (`"07:00-23:00"`) outside of which heartbeats stay
/// silent.  Scheduled deliveries fire regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHours {
    /// Minutes since local midnight, inclusive.
    pub start: u32,
    /// Minutes since local midnight, exclusive.
    pub end: u32,
}

impl Default for ActiveHours {
    fn default() -> Self {
        Self {
            start: 7 * 60,
            end: 23 * 60,
        }
    }
}

impl ActiveHours {
    /// Whether `now` falls inside the window in the given timezone.
    /// Handles windows that wrap midnight (e.g. `22:00-06:00`).
    pub fn contains(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        let local = now.with_timezone(&tz);
        let minute = local.hour() * 60 + local.minute();
        if self.start <= self.end {
            minute >= self.start && minute < self.end
        } else {
            minute >= self.start || minute < self.end
        }
    }
}

impl FromStr for ActiveHours {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((start, end)) = s.split_once('-') else {
            bail!("active hours must look like 07:00-23:00, got {s:?}");
        };
        Ok(Self {
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }
}

fn parse_hhmm(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    let Some((h, m)) = raw.split_once(':') else {
        bail!("expected HH:MM, got {raw:?}");
    };
    let hours: u32 = h.parse()?;
    let minutes: u32 = m.parse()?;
    if hours > 23 || minutes > 59 {
        bail!("time out of range: {raw:?}");
    }
    Ok(hours * 60 + minutes)
}

// ── env helpers ────────────────────────────────────────────────────────────────

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_parse_opt(key).unwrap_or(default)
}

fn env_parse_opt<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse a humantime-style duration (`15m`, `90s`, `2h`) from the environment.
fn env_duration(key: &str) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    match humantime::parse_duration(raw.trim()) {
        Ok(d) => Some(d),
        Err(err) => {
            tracing::warn!(key, %err, "ignoring unparseable duration");
            None
        }
    }
}

/// Channel-id prefixes that are internal to the gateway and never tracked as
/// deliverable channels.
pub const RESERVED_CHANNEL_PREFIXES: [&str; 4] = ["api", "cli", "heartbeat", "schedule"];

/// Split a `<platform>:<id>` channel string.
pub fn split_channel(channel: &str) -> Option<(&str, &str)> {
    let (platform, id) = channel.split_once(':')?;
    if platform.is_empty() || id.is_empty() {
        return None;
    }
    Some((platform, id))
}

/// Whether a channel id belongs to a reserved (non-deliverable) namespace.
pub fn is_reserved_channel(channel: &str) -> bool {
    RESERVED_CHANNEL_PREFIXES
        .iter()
        .any(|prefix| channel.starts_with(&format!("{prefix}:")) || channel == *prefix)
}

/// Return `text` truncated to `max_chars` characters with a trailing ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let truncated = chars.into_iter().take(max_chars).collect::<String>();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn active_hours_parse_and_contains() {
        let hours: ActiveHours = "07:00-23:00".parse().unwrap();
        assert_eq!(hours.start, 420);
        assert_eq!(hours.end, 1380);

        let morning = Utc.with_ymd_and_hms(2030, 1, 1, 8, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2030, 1, 1, 23, 30, 0).unwrap();
        assert!(hours.contains(morning, chrono_tz::UTC));
        assert!(!hours.contains(night, chrono_tz::UTC));
    }

    #[test]
    fn active_hours_wrap_midnight() {
        let hours: ActiveHours = "22:00-06:00".parse().unwrap();
        let late = Utc.with_ymd_and_hms(2030, 1, 1, 23, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2030, 1, 1, 3, 0, 0).unwrap();
        let midday = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();
        assert!(hours.contains(late, chrono_tz::UTC));
        assert!(hours.contains(early, chrono_tz::UTC));
        assert!(!hours.contains(midday, chrono_tz::UTC));
    }

    #[test]
    fn active_hours_respect_timezone() {
        let hours: ActiveHours = "07:00-23:00".parse().unwrap();
        // 23:30 UTC is 00:30 in Berlin (winter) — outside either way, but
        // 06:30 UTC is 07:30 in Berlin — inside only with the tz applied.
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 6, 30, 0).unwrap();
        assert!(!hours.contains(now, chrono_tz::UTC));
        assert!(hours.contains(now, chrono_tz::Europe::Berlin));
    }

    #[test]
    fn reserved_channels_are_detected() {
        assert!(is_reserved_channel("api:http"));
        assert!(is_reserved_channel("heartbeat:main"));
        assert!(is_reserved_channel("schedule:sch_abc"));
        assert!(!is_reserved_channel("telegram:42"));
    }

    #[test]
    fn split_channel_rejects_malformed_ids() {
        assert_eq!(split_channel("telegram:42"), Some(("telegram", "42")));
        assert_eq!(split_channel("telegram"), None);
        assert_eq!(split_channel(":42"), None);
        assert_eq!(split_channel("telegram:"), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo…");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
