//! Known-channel tracking and the proactive-delivery registry.
//!
//! `ChannelStore` remembers the last-seen channel per messaging platform so
//! schedules and heartbeats know where to speak.  `AdapterRegistry` maps a
//! platform name to its send function; the scheduler and heartbeat deliver
//! through it without knowing any platform's SDK.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use mobyclaw_config::persist::{atomic_write_json, load_json};
use mobyclaw_config::{is_reserved_channel, split_channel};

// ── channel store ──────────────────────────────────────────────────────────────

/// Persistent `platform → last-seen channel id` map plus the in-memory
/// most-recently-active channel.
pub struct ChannelStore {
    path: PathBuf,
    inner: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    by_platform: BTreeMap<String, String>,
    last_active: Option<String>,
}

impl ChannelStore {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        let by_platform = load_json::<BTreeMap<String, String>>(&path)
            .unwrap_or_else(|err| {
                warn!(?err, "channel store unreadable — starting empty");
                None
            })
            .unwrap_or_default();
        Ok(Self {
            path,
            inner: Mutex::new(ChannelState {
                by_platform,
                last_active: None,
            }),
        })
    }

    /// Record an inbound channel.  Reserved gateway namespaces (`api`, `cli`,
    /// `heartbeat`, `schedule`) are never tracked.
    pub fn track(&self, channel_id: &str) {
        if is_reserved_channel(channel_id) {
            return;
        }
        let Some((platform, _)) = split_channel(channel_id) else {
            return;
        };

        let mut state = self.inner.lock().unwrap();
        state.last_active = Some(channel_id.to_string());
        let known = state.by_platform.get(platform);
        if known.map(String::as_str) != Some(channel_id) {
            state
                .by_platform
                .insert(platform.to_string(), channel_id.to_string());
            if let Err(err) = atomic_write_json(&self.path, &state.by_platform) {
                warn!(?err, "failed to persist channel store");
            }
            debug!(platform, channel_id, "channel tracked");
        }
    }

    pub fn get(&self, platform: &str) -> Option<String> {
        self.inner.lock().unwrap().by_platform.get(platform).cloned()
    }

    pub fn get_all(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().by_platform.clone()
    }

    /// The channel proactive messages default to: the most recently active
    /// one, else the first known platform's channel.
    pub fn get_default(&self) -> Option<String> {
        let state = self.inner.lock().unwrap();
        state
            .last_active
            .clone()
            .or_else(|| state.by_platform.values().next().cloned())
    }
}

// ── adapter registry ───────────────────────────────────────────────────────────

/// A platform's proactive send function.  Implementations must be safe to
/// call from any task — inbound handlers, the scheduler, and the heartbeat
/// all deliver through the same object.
#[async_trait]
pub trait ProactiveSender: Send + Sync {
    async fn send(&self, target: &str, text: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("malformed channel id {0:?} (expected <platform>:<id>)")]
    BadChannel(String),

    #[error("no adapter registered for platform {0:?}")]
    UnknownPlatform(String),

    #[error("send to {channel} failed: {source}")]
    Send {
        channel: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Registry of `platform → ProactiveSender`.
#[derive(Default)]
pub struct AdapterRegistry {
    senders: RwLock<HashMap<String, Arc<dyn ProactiveSender>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, platform: &str, sender: Arc<dyn ProactiveSender>) {
        self.senders
            .write()
            .unwrap()
            .insert(platform.to_string(), sender);
    }

    pub fn platforms(&self) -> Vec<String> {
        self.senders.read().unwrap().keys().cloned().collect()
    }

    /// Parse `<platform>:<id>`, look up the platform's sender, and deliver.
    pub async fn deliver(&self, channel: &str, text: &str) -> Result<(), DeliveryError> {
        let Some((platform, target)) = split_channel(channel) else {
            return Err(DeliveryError::BadChannel(channel.to_string()));
        };
        let sender = self
            .senders
            .read()
            .unwrap()
            .get(platform)
            .cloned()
            .ok_or_else(|| DeliveryError::UnknownPlatform(platform.to_string()))?;

        sender
            .send(target, text)
            .await
            .map_err(|source| DeliveryError::Send {
                channel: channel.to_string(),
                source,
            })
    }
}
